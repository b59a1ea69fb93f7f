use crate::dissect::Dissector;
use crate::hwaddr::HwAddr;
use pnet_packet::ethernet::EthernetPacket;
use pnet_packet::vlan::VlanPacket;
use pnet_packet::Packet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const ETH_HLEN: usize = 14;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;
pub const ETHERTYPE_QINQ: u16 = 0x88a8;

/// Values below this are 802.3 lengths, not ethertypes
const ETHERTYPE_MIN: u16 = 0x0600;

const LLC_SAP_SNAP: u8 = 0xaa;
const LLC_CTRL_UI: u8 = 0x03;
const SNAP_HLEN: usize = 8;

/// Minimum Ethernet payload; shorter frames are padded up to it
pub const ETH_MIN_PAYLOAD: usize = 46;

/// Check a declared network-layer length against the captured length.
///
/// Returns true (malformed) if more is declared than was captured, or if the
/// capture is longer than declared by more than Ethernet minimum-frame padding
/// can explain.
pub fn check_ethernet_padup(len: usize, declared: usize) -> bool {
    if declared > len {
        return true;
    }
    len > declared && len > ETH_MIN_PAYLOAD
}

impl Dissector<'_> {
    pub(crate) fn handle_l2_ethernet(&mut self, data: &[u8]) {
        trace!("handle_l2_ethernet (len={})", data.len());
        self.pkt.l2hlen = ETH_HLEN;
        let eth = match EthernetPacket::new(data) {
            Some(eth) => eth,
            None => {
                self.malformed(format_args!("Ethernet frame of {} bytes", data.len()));
                return;
            }
        };
        let dst = HwAddr::from(eth.get_destination());
        let src = HwAddr::from(eth.get_source());
        self.pkt.l2d = self.neighbor(dst.as_bytes());
        self.pkt.l2s = self.neighbor(src.as_bytes());
        let ethertype = eth.get_ethertype().0;
        if ethertype < ETHERTYPE_MIN {
            self.handle_l2_llc(eth.payload(), ethertype as usize);
        } else {
            self.handle_ethertype(ethertype, eth.payload());
        }
    }

    /// 802.3 frame: `len` bytes of LLC data, possibly followed by padding
    fn handle_l2_llc(&mut self, data: &[u8], len: usize) {
        if len > data.len() {
            self.malformed(format_args!("802.3 length {} > {}", len, data.len()));
            return;
        }
        self.handle_l2_snap(&data[..len]);
    }

    /// LLC header, followed by a SNAP header for encapsulated ethertypes
    pub(crate) fn handle_l2_snap(&mut self, data: &[u8]) {
        if data.len() < 3 {
            self.malformed(format_args!("LLC header of {} bytes", data.len()));
            return;
        }
        if data[0] != LLC_SAP_SNAP || data[1] != LLC_SAP_SNAP || data[2] != LLC_CTRL_UI {
            self.noproto(format_args!("LLC SAP 0x{:02x}", data[0]));
            return;
        }
        if data.len() < SNAP_HLEN {
            self.malformed(format_args!("SNAP header of {} bytes", data.len()));
            return;
        }
        if !self.pkt.tunneled {
            self.pkt.l2hlen += SNAP_HLEN;
        }
        let ethertype = u16::from_be_bytes([data[6], data[7]]);
        self.handle_ethertype(ethertype, &data[SNAP_HLEN..]);
    }

    /// Dispatch a network-layer payload by ethertype
    pub(crate) fn handle_ethertype(&mut self, ethertype: u16, data: &[u8]) {
        self.pkt.l3proto = ethertype;
        match ethertype {
            ETHERTYPE_IPV4 => self.handle_l3_ipv4(data),
            ETHERTYPE_IPV6 => self.handle_l3_ipv6(data),
            ETHERTYPE_ARP => self.handle_l3_arp(data),
            ETHERTYPE_VLAN | ETHERTYPE_QINQ => self.handle_l2_vlan(data),
            _ => self.noproto(format_args!("ethertype 0x{:04x}", ethertype)),
        }
    }

    fn handle_l2_vlan(&mut self, data: &[u8]) {
        trace!("handle_l2_vlan (len={})", data.len());
        let vlan = match VlanPacket::new(data) {
            Some(vlan) => vlan,
            None => {
                self.malformed(format_args!("802.1Q tag of {} bytes", data.len()));
                return;
            }
        };
        if !self.enter_encapsulation() {
            return;
        }
        if !self.pkt.tunneled {
            self.pkt.l2hlen += 4;
        }
        trace!("    vlan id: {}", vlan.get_vlan_identifier());
        self.handle_ethertype(vlan.get_ethertype().0, vlan.payload());
    }

    /// ARP: the sender protocol address names the sender hardware address
    fn handle_l3_arp(&mut self, data: &[u8]) {
        trace!("handle_l3_arp (len={})", data.len());
        if data.len() < 8 {
            self.malformed(format_args!("ARP header of {} bytes", data.len()));
            return;
        }
        let ptype = u16::from_be_bytes([data[2], data[3]]);
        let hln = data[4] as usize;
        let pln = data[5] as usize;
        let op = u16::from_be_bytes([data[6], data[7]]);
        if data.len() < 8 + 2 * (hln + pln) {
            self.malformed(format_args!(
                "ARP op {} with {} bytes for hln {} pln {}",
                op,
                data.len(),
                hln,
                pln
            ));
            return;
        }
        let width = self.iface.neighbors.width();
        if width != 0 && hln != width {
            self.malformed(format_args!("ARP hln {} on {}-byte link", hln, width));
            return;
        }
        let sha = &data[8..8 + hln];
        let spa = &data[8 + hln..8 + hln + pln];
        let sender = match (ptype, spa.len()) {
            (ETHERTYPE_IPV4, 4) => Some(IpAddr::V4(Ipv4Addr::new(spa[0], spa[1], spa[2], spa[3]))),
            (ETHERTYPE_IPV6, 16) => {
                let mut b = [0u8; 16];
                b.copy_from_slice(spa);
                Some(IpAddr::V6(Ipv6Addr::from(b)))
            }
            _ => None,
        };
        match sender {
            Some(ip) if !ip.is_unspecified() => {
                let hw = self.neighbor_named(sha, ip);
                let handle = self.lookup_l3(hw, ip);
                self.pkt.l3s = Some(handle);
                self.pkt.l3s_addr = Some(ip);
            }
            _ => {
                self.neighbor(sha);
            }
        }
    }
}
