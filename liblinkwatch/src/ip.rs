use crate::dissect::Dissector;
use crate::ethernet::check_ethernet_padup;
use pnet_packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet_packet::ipv4::{Ipv4Packet, MutableIpv4Packet};
use pnet_packet::ipv6::{Ipv6Packet, MutableIpv6Packet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const IPV4_MIN_HLEN: usize = 20;
pub const IPV6_HLEN: usize = 40;

pub const DEFAULT_IP4_TTL: u8 = 64;
pub const DEFAULT_IP6_HOPS: u8 = 64;

impl Dissector<'_> {
    pub(crate) fn handle_l3_ipv4(&mut self, data: &[u8]) {
        trace!("handle_l3_ipv4 (len={})", data.len());
        let ipv4 = match Ipv4Packet::new(data) {
            Some(ipv4) => ipv4,
            None => {
                self.malformed(format_args!("IPv4 with {} bytes", data.len()));
                return;
            }
        };
        let version = ipv4.get_version();
        if version != 4 {
            self.malformed(format_args!("IPv4 version {}", version));
            return;
        }
        let hlen = usize::from(ipv4.get_header_length()) * 4;
        if hlen < IPV4_MIN_HLEN || hlen > data.len() {
            self.malformed(format_args!("IPv4 header length {} with {} bytes", hlen, data.len()));
            return;
        }
        let tot_len = usize::from(ipv4.get_total_length());
        if tot_len < hlen || check_ethernet_padup(data.len(), tot_len) {
            self.malformed(format_args!("IPv4 total length {} with {} bytes", tot_len, data.len()));
            return;
        }
        self.set_l3_addresses(
            IpAddr::V4(ipv4.get_source()),
            IpAddr::V4(ipv4.get_destination()),
        );
        // fragments are not reassembled: later fragments reach the transport
        // handlers as they are
        let payload = &data[hlen..tot_len];
        self.dispatch_transport(ipv4.get_next_level_protocol(), payload);
    }

    pub(crate) fn handle_l3_ipv6(&mut self, data: &[u8]) {
        trace!("handle_l3_ipv6 (len={})", data.len());
        let ipv6 = match Ipv6Packet::new(data) {
            Some(ipv6) => ipv6,
            None => {
                self.malformed(format_args!("IPv6 with {} bytes", data.len()));
                return;
            }
        };
        let version = ipv6.get_version();
        if version != 6 {
            self.malformed(format_args!("IPv6 version {}", version));
            return;
        }
        let plen = usize::from(ipv6.get_payload_length());
        if data.len() < IPV6_HLEN + plen {
            self.malformed(format_args!("IPv6 payload length {} with {} bytes", plen, data.len()));
            return;
        }
        self.set_l3_addresses(
            IpAddr::V6(ipv6.get_source()),
            IpAddr::V6(ipv6.get_destination()),
        );
        let mut payload = &data[IPV6_HLEN..IPV6_HLEN + plen];
        let mut next = ipv6.get_next_header();
        loop {
            match next {
                IpNextHeaderProtocols::Hopopt => {
                    if payload.len() < 2 {
                        self.malformed(format_args!("IPv6 hop-by-hop with {} bytes", payload.len()));
                        return;
                    }
                    let extlen = (usize::from(payload[1]) + 1) * 8;
                    if extlen > payload.len() {
                        self.malformed(format_args!(
                            "IPv6 hop-by-hop length {} with {} bytes",
                            extlen,
                            payload.len()
                        ));
                        return;
                    }
                    next = IpNextHeaderProtocol::new(payload[0]);
                    payload = &payload[extlen..];
                }
                _ => {
                    self.dispatch_transport(next, payload);
                    return;
                }
            }
        }
    }

    /// Hand a network-layer payload to the transport handler for `proto`
    pub(crate) fn dispatch_transport(&mut self, proto: IpNextHeaderProtocol, data: &[u8]) {
        match proto {
            IpNextHeaderProtocols::Tcp => self.handle_l4_tcp(data),
            IpNextHeaderProtocols::Udp => self.handle_l4_udp(data),
            IpNextHeaderProtocols::Icmp => self.handle_l4_icmp(data),
            IpNextHeaderProtocols::Icmpv6 => self.handle_l4_icmpv6(data),
            IpNextHeaderProtocols::Gre => self.handle_l4_gre(data),
            IpNextHeaderProtocols::Igmp => self.handle_l4_igmp(data),
            IpNextHeaderProtocols::Pim => self.handle_l4_pim(data),
            _ => self.noproto(format_args!("IP protocol {}", proto.0)),
        }
    }
}

/// Write a minimal IPv4 header at the start of `frame`.
///
/// The total length and checksum are left for the caller. Returns the header
/// length, or `None` if the buffer is too small or the source is unset.
pub fn prep_ipv4_header(
    frame: &mut [u8],
    src: Ipv4Addr,
    dst: Ipv4Addr,
    proto: IpNextHeaderProtocol,
    id: u16,
) -> Option<usize> {
    if src.is_unspecified() {
        return None;
    }
    let hdr = frame.get_mut(..IPV4_MIN_HLEN)?;
    hdr.fill(0);
    let mut ip = MutableIpv4Packet::new(hdr)?;
    ip.set_version(4);
    ip.set_header_length((IPV4_MIN_HLEN / 4) as u8);
    ip.set_ttl(DEFAULT_IP4_TTL);
    ip.set_identification(id);
    ip.set_source(src);
    ip.set_destination(dst);
    ip.set_next_level_protocol(proto);
    Some(IPV4_MIN_HLEN)
}

/// Write a minimal IPv6 header at the start of `frame`.
///
/// The payload length is left for the caller. Returns the header length, or
/// `None` if the buffer is too small.
pub fn prep_ipv6_header(
    frame: &mut [u8],
    src: Ipv6Addr,
    dst: Ipv6Addr,
    proto: IpNextHeaderProtocol,
) -> Option<usize> {
    let hdr = frame.get_mut(..IPV6_HLEN)?;
    hdr.fill(0);
    let mut ip = MutableIpv6Packet::new(hdr)?;
    ip.set_version(6);
    ip.set_hop_limit(DEFAULT_IP6_HOPS);
    ip.set_next_header(proto);
    ip.set_source(src);
    ip.set_destination(dst);
    Some(IPV6_HLEN)
}
