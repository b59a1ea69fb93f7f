use crate::hosts::L3Host;
use crate::interface::{InterfaceState, LinkInfo};
use crate::neighbors::Neighbor;
use crate::packet::PacketContext;
use crate::wireless::WirelessEvent;
use serde::Serialize;
use std::net::IpAddr;

/// Opaque value returned by the consumer for a neighbor, stored with the entry
pub type ConsumerToken = u64;

/// A service seen answering from a well-known port
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Service {
    pub addr: IpAddr,
    /// IP protocol number (6: TCP, 17: UDP)
    pub proto: u8,
    pub port: u16,
}

/// Consumer of observation events (user interface, headless output, tests)
///
/// All callbacks are best-effort notifications, called synchronously from the
/// capture or control-plane threads, sometimes with the interface lock held.
/// They must not block and must not call back into the interface table.
pub trait EventSink: Send + Sync {
    fn frame_observed(&self, _iface: &InterfaceState, _pkt: &PacketContext) {}

    /// A neighbor was created or named. The returned token replaces the stored one.
    fn neighbor_observed(&self, _link: &LinkInfo, _neighbor: &Neighbor) -> Option<ConsumerToken> {
        None
    }

    fn address_observed(&self, _link: &LinkInfo, _host: &L3Host) {}

    fn service_observed(&self, _link: &LinkInfo, _service: &Service) {}

    fn interface_added(&self, _link: &LinkInfo) {}

    fn interface_removed(&self, _link: &LinkInfo) {}

    fn wireless_event(&self, _link: &LinkInfo, _event: &WirelessEvent) {}

    fn diagnostic(&self, _msg: &str) {}
}

/// Event consumer ignoring everything
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {}
