//! Linux "cooked" capture header (LINKTYPE_LINUX_SLL)

use crate::dissect::Dissector;
use crate::hwaddr::{HwAddr, MAX_HWADDR_LEN};
use crate::interface::{LinkInfo, IFF_BROADCAST};
use crate::neighbors::{categorize, Category};
use crate::packet::PacketContext;

pub const SLL_HDR_LEN: usize = 16;

pub const PACKET_HOST: u16 = 0;
pub const PACKET_BROADCAST: u16 = 1;
pub const PACKET_MULTICAST: u16 = 2;
pub const PACKET_OTHERHOST: u16 = 3;
pub const PACKET_OUTGOING: u16 = 4;

/// The 16-byte cooked header. All fields are big-endian on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SllHeader {
    pub pkttype: u16,
    pub arphrd: u16,
    pub halen: u16,
    pub addr: [u8; MAX_HWADDR_LEN],
    pub proto: u16,
}

impl SllHeader {
    /// Parse a header, returning it and the payload
    pub fn parse(data: &[u8]) -> Option<(SllHeader, &[u8])> {
        if data.len() < SLL_HDR_LEN {
            return None;
        }
        let mut addr = [0u8; MAX_HWADDR_LEN];
        addr.copy_from_slice(&data[6..14]);
        let hdr = SllHeader {
            pkttype: u16::from_be_bytes([data[0], data[1]]),
            arphrd: u16::from_be_bytes([data[2], data[3]]),
            halen: u16::from_be_bytes([data[4], data[5]]),
            addr,
            proto: u16::from_be_bytes([data[14], data[15]]),
        };
        Some((hdr, &data[SLL_HDR_LEN..]))
    }

    pub fn to_bytes(&self) -> [u8; SLL_HDR_LEN] {
        let mut b = [0u8; SLL_HDR_LEN];
        b[0..2].copy_from_slice(&self.pkttype.to_be_bytes());
        b[2..4].copy_from_slice(&self.arphrd.to_be_bytes());
        b[4..6].copy_from_slice(&self.halen.to_be_bytes());
        b[6..14].copy_from_slice(&self.addr);
        b[14..16].copy_from_slice(&self.proto.to_be_bytes());
        b
    }

    /// Synthesize the header describing a dissected frame
    pub fn for_frame(link: &LinkInfo, pkt: &PacketContext) -> SllHeader {
        let mut addr = [0u8; MAX_HWADDR_LEN];
        let mut halen = 0;
        if let Some(src) = pkt.l2s {
            let b = src.as_bytes();
            addr[..b.len()].copy_from_slice(b);
            halen = b.len() as u16;
        }
        SllHeader {
            pkttype: sll_packet_type(link, pkt),
            arphrd: link.arptype,
            halen,
            addr,
            proto: pkt.l3proto,
        }
    }
}

/// Packet type of a frame as seen from the interface: outgoing if sent from
/// our own address, else derived from the destination category
pub fn sll_packet_type(link: &LinkInfo, pkt: &PacketContext) -> u16 {
    if let (Some(src), Some(own)) = (pkt.l2s, link.hwaddr) {
        if src == own {
            return PACKET_OUTGOING;
        }
    }
    match pkt.l2d.map(|d| categorize(link, &d)) {
        None | Some(Category::Local) => PACKET_HOST,
        Some(Category::Broadcast) => PACKET_BROADCAST,
        Some(Category::Multicast) => PACKET_MULTICAST,
        Some(Category::Unicast) => PACKET_OTHERHOST,
    }
}

impl Dissector<'_> {
    /// Cooked frames carry their own addressing: the interface takes the
    /// frame's address for the duration of the dissection.
    pub(crate) fn handle_l2_cooked(&mut self, data: &[u8]) {
        trace!("handle_l2_cooked (len={})", data.len());
        // frames are re-logged unchanged
        self.pkt.l2hlen = 0;
        let (hdr, payload) = match SllHeader::parse(data) {
            Some(r) => r,
            None => {
                self.malformed(format_args!("cooked header with {} bytes", data.len()));
                return;
            }
        };
        let halen = usize::from(hdr.halen);
        if halen > MAX_HWADDR_LEN {
            self.malformed(format_args!("cooked address length {}", halen));
            return;
        }
        let addr = &hdr.addr[..halen];
        let saved = (
            self.iface.link.hwaddr,
            self.iface.link.bcast,
            self.iface.link.flags,
        );
        self.iface.link.hwaddr = HwAddr::new(addr);
        self.iface.link.bcast = Some(HwAddr::broadcast(halen));
        self.iface.link.flags |= IFF_BROADCAST;
        let hw = self.neighbor(addr);
        self.pkt.l2s = hw;
        self.pkt.l2d = hw;
        self.handle_ethertype(hdr.proto, payload);
        (
            self.iface.link.hwaddr,
            self.iface.link.bcast,
            self.iface.link.flags,
        ) = saved;
    }
}
