use crate::context::ObserverContext;
use crate::datalink::Datalink;
use crate::events::Service;
use crate::hosts::L3Handle;
use crate::hwaddr::HwAddr;
use crate::interface::{route_to, InterfaceState};
use crate::packet::PacketContext;
use liblinkwatch_tools::Duration;
use std::fmt;
use std::net::IpAddr;

/// Maximum nesting of encapsulations (VLAN, SNAP, GRE) followed in one frame
pub(crate) const MAX_ENCAP_DEPTH: u8 = 8;

/// Dissection of one frame on one interface.
///
/// Each layer validates its own header, records what it found in the
/// `PacketContext` and hands the payload to the next layer. Problems are
/// recorded as flags (`malformed`, `noproto`) and stop the descent; they are
/// never propagated as errors.
pub struct Dissector<'a> {
    pub(crate) ctx: &'a ObserverContext,
    pub(crate) iface: &'a mut InterfaceState,
    pub(crate) pkt: PacketContext,
}

impl<'a> Dissector<'a> {
    pub fn new(ctx: &'a ObserverContext, iface: &'a mut InterfaceState, ts: Duration) -> Self {
        let pkt = PacketContext::new(iface.link.index, ts);
        Dissector { ctx, iface, pkt }
    }

    /// Dissect `data`, starting at the link layer
    pub fn run(mut self, datalink: Datalink, data: &[u8]) -> PacketContext {
        match datalink {
            Datalink::Ethernet => self.handle_l2_ethernet(data),
            Datalink::Radiotap => self.handle_l2_radiotap(data),
            Datalink::Irda => self.handle_l2_irda(data),
            Datalink::IrLap => self.handle_l2_irlap(data),
            Datalink::LinuxCooked => self.handle_l2_cooked(data),
        }
        self.pkt
    }

    pub(crate) fn malformed(&mut self, args: fmt::Arguments) {
        self.pkt.malformed = true;
        let msg = format!("{} malformed: {}", self.iface.link.name, args);
        self.ctx.diagnostic(&msg);
    }

    pub(crate) fn noproto(&mut self, args: fmt::Arguments) {
        self.pkt.noproto = true;
        let msg = format!("{} noproto: {}", self.iface.link.name, args);
        self.ctx.diagnostic(&msg);
    }

    /// Enter one more encapsulation level. Returns false (and flags the frame)
    /// if nesting is too deep.
    pub(crate) fn enter_encapsulation(&mut self) -> bool {
        if self.pkt.depth >= MAX_ENCAP_DEPTH {
            self.noproto(format_args!("encapsulation deeper than {}", MAX_ENCAP_DEPTH));
            return false;
        }
        self.pkt.depth += 1;
        true
    }

    /// Neighbor directory lookup for a hardware address seen in this frame
    pub(crate) fn neighbor(&mut self, addr: &[u8]) -> Option<HwAddr> {
        let iface = &mut *self.iface;
        iface.neighbors.lookup_or_create(
            &iface.link,
            addr,
            None,
            self.ctx.vendors(),
            self.ctx.events(),
        )
    }

    /// Neighbor lookup, naming the entry from a local protocol address (ARP,
    /// neighbor tables)
    pub(crate) fn neighbor_named(&mut self, addr: &[u8], ip: IpAddr) -> Option<HwAddr> {
        let hw = self.neighbor(addr)?;
        let iface = &mut *self.iface;
        iface
            .neighbors
            .name_local(&iface.link, &hw, ip, self.ctx.events());
        Some(hw)
    }

    /// Protocol address lookup. New addresses are reported, queued for name
    /// resolution when routable, and used to name their neighbor.
    pub(crate) fn lookup_l3(&mut self, neighbor: Option<HwAddr>, addr: IpAddr) -> L3Handle {
        let ifindex = self.iface.link.index;
        let hosts = self.ctx.hosts();
        let (handle, created) = hosts.lookup_or_create(ifindex, neighbor, addr);
        if created {
            if let Some(host) = hosts.get(handle) {
                self.ctx.events().address_observed(&self.iface.link, &host);
            }
            if wants_resolution(&addr) {
                self.ctx.resolution.enqueue(ifindex, neighbor, addr, handle);
            }
        }
        if let Some(hw) = neighbor {
            let InterfaceState {
                ref link,
                ref addresses,
                ref mut neighbors,
                ..
            } = *self.iface;
            neighbors.name_from_wire(
                link,
                &hw,
                addr,
                |ip| route_to(addresses, ip),
                self.ctx.events(),
            );
        }
        handle
    }

    /// Resolve both protocol addresses of the frame
    pub(crate) fn set_l3_addresses(&mut self, src: IpAddr, dst: IpAddr) {
        let l3s = self.lookup_l3(self.pkt.l2s, src);
        let l3d = self.lookup_l3(self.pkt.l2d, dst);
        self.pkt.l3s = Some(l3s);
        self.pkt.l3d = Some(l3d);
        self.pkt.l3s_addr = Some(src);
        self.pkt.l3d_addr = Some(dst);
    }

    /// Report the source of a frame sent from a well-known port
    pub(crate) fn service(&mut self, proto: u8, sport: u16) {
        if sport == 0 || sport >= 1024 {
            return;
        }
        if let Some(addr) = self.pkt.l3s_addr {
            let service = Service {
                addr,
                proto,
                port: sport,
            };
            self.ctx
                .events()
                .service_observed(&self.iface.link, &service);
        }
    }
}

/// Routable unicast addresses are worth a name lookup
fn wants_resolution(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(a) => {
            !(a.is_unspecified()
                || a.is_loopback()
                || a.is_multicast()
                || a.is_broadcast()
                || a.is_link_local())
        }
        IpAddr::V6(a) => {
            !(a.is_unspecified()
                || a.is_loopback()
                || a.is_multicast()
                || (a.segments()[0] & 0xffc0) == 0xfe80)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::wants_resolution;

    #[test]
    fn resolution_candidates() {
        assert!(wants_resolution(&"192.0.2.1".parse().unwrap()));
        assert!(wants_resolution(&"2001:db8::1".parse().unwrap()));
        assert!(!wants_resolution(&"127.0.0.1".parse().unwrap()));
        assert!(!wants_resolution(&"224.0.0.251".parse().unwrap()));
        assert!(!wants_resolution(&"255.255.255.255".parse().unwrap()));
        assert!(!wants_resolution(&"fe80::1".parse().unwrap()));
        assert!(!wants_resolution(&"ff02::1".parse().unwrap()));
    }
}
