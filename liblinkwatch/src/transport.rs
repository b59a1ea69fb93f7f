use crate::dissect::Dissector;
use pnet_packet::gre::GrePacket;
use pnet_packet::icmp::IcmpPacket;
use pnet_packet::icmpv6::Icmpv6Packet;
use pnet_packet::tcp::TcpPacket;
use pnet_packet::udp::UdpPacket;

pub const TCP_MIN_HLEN: usize = 20;
pub const UDP_HLEN: usize = 8;
pub const IGMP_MIN_LEN: usize = 8;
pub const PIM_MIN_LEN: usize = 4;
pub const GRE_MIN_HLEN: usize = 4;

const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

impl Dissector<'_> {
    pub(crate) fn handle_l4_tcp(&mut self, data: &[u8]) {
        trace!("handle_l4_tcp (len={})", data.len());
        let tcp = match TcpPacket::new(data) {
            Some(tcp) => tcp,
            None => {
                self.malformed(format_args!("TCP with {} bytes", data.len()));
                return;
            }
        };
        let hlen = usize::from(tcp.get_data_offset()) * 4;
        if hlen < TCP_MIN_HLEN || hlen > data.len() {
            self.malformed(format_args!("TCP data offset {} with {} bytes", hlen, data.len()));
            return;
        }
        self.service(IPPROTO_TCP, tcp.get_source());
    }

    pub(crate) fn handle_l4_udp(&mut self, data: &[u8]) {
        trace!("handle_l4_udp (len={})", data.len());
        let udp = match UdpPacket::new(data) {
            Some(udp) => udp,
            None => {
                self.malformed(format_args!("UDP with {} bytes", data.len()));
                return;
            }
        };
        let ulen = usize::from(udp.get_length());
        if ulen < UDP_HLEN || ulen > data.len() {
            self.malformed(format_args!("UDP length {} with {} bytes", ulen, data.len()));
            return;
        }
        self.service(IPPROTO_UDP, udp.get_source());
    }

    pub(crate) fn handle_l4_icmp(&mut self, data: &[u8]) {
        trace!("handle_l4_icmp (len={})", data.len());
        match IcmpPacket::new(data) {
            Some(icmp) => {
                trace!(
                    "    ICMP type={} code={}",
                    icmp.get_icmp_type().0,
                    icmp.get_icmp_code().0
                );
            }
            None => self.malformed(format_args!("ICMP with {} bytes", data.len())),
        }
    }

    pub(crate) fn handle_l4_icmpv6(&mut self, data: &[u8]) {
        trace!("handle_l4_icmpv6 (len={})", data.len());
        match Icmpv6Packet::new(data) {
            Some(icmp) => {
                trace!(
                    "    ICMPv6 type={} code={}",
                    icmp.get_icmpv6_type().0,
                    icmp.get_icmpv6_code().0
                );
            }
            None => self.malformed(format_args!("ICMPv6 with {} bytes", data.len())),
        }
    }

    /// GRE: follow the encapsulated protocol, which is an ethertype
    pub(crate) fn handle_l4_gre(&mut self, data: &[u8]) {
        trace!("handle_l4_gre (len={})", data.len());
        let gre = match GrePacket::new(data) {
            Some(gre) => gre,
            None => {
                self.malformed(format_args!("GRE with {} bytes", data.len()));
                return;
            }
        };
        if gre.get_routing_present() != 0 {
            self.noproto(format_args!("source-routed GRE"));
            return;
        }
        let version = gre.get_version();
        if version != 0 {
            self.noproto(format_args!("GRE version {}", version));
            return;
        }
        let hlen = GRE_MIN_HLEN
            + usize::from(gre.get_checksum_present()) * 4
            + usize::from(gre.get_key_present()) * 4
            + usize::from(gre.get_sequence_present()) * 4;
        if hlen > data.len() {
            self.malformed(format_args!("GRE header length {} with {} bytes", hlen, data.len()));
            return;
        }
        if !self.enter_encapsulation() {
            return;
        }
        self.pkt.tunneled = true;
        self.handle_ethertype(gre.get_protocol_type(), &data[hlen..]);
    }

    pub(crate) fn handle_l4_igmp(&mut self, data: &[u8]) {
        trace!("handle_l4_igmp (len={})", data.len());
        if data.len() < IGMP_MIN_LEN {
            self.malformed(format_args!("IGMP with {} bytes", data.len()));
        }
    }

    pub(crate) fn handle_l4_pim(&mut self, data: &[u8]) {
        trace!("handle_l4_pim (len={})", data.len());
        if data.len() < PIM_MIN_LEN {
            self.malformed(format_args!("PIM with {} bytes", data.len()));
            return;
        }
        let version = data[0] >> 4;
        if version != 2 {
            self.noproto(format_args!("PIM version {}", version));
        }
    }
}
