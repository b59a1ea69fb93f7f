use crate::hosts::L3Handle;
use crate::hwaddr::HwAddr;
use liblinkwatch_tools::Duration;
use std::net::IpAddr;

/// Per-frame classification result, filled by the dissection layers
#[derive(Clone, Debug, Default)]
pub struct PacketContext {
    pub ifindex: u32,
    pub ts: Duration,
    /// Source and destination neighbors
    pub l2s: Option<HwAddr>,
    pub l2d: Option<HwAddr>,
    /// Source and destination protocol address entries
    pub l3s: Option<L3Handle>,
    pub l3d: Option<L3Handle>,
    pub l3s_addr: Option<IpAddr>,
    pub l3d_addr: Option<IpAddr>,
    /// Ethertype of the network layer
    pub l3proto: u16,
    /// Length of the link-layer header(s), replaced when re-logging
    pub l2hlen: usize,
    pub malformed: bool,
    pub noproto: bool,
    /// Encapsulation depth (GRE, SNAP, VLAN)
    pub(crate) depth: u8,
    /// Set once inside a network-layer tunnel; link headers seen there are not
    /// part of `l2hlen`
    pub(crate) tunneled: bool,
}

impl PacketContext {
    pub fn new(ifindex: u32, ts: Duration) -> Self {
        PacketContext {
            ifindex,
            ts,
            ..PacketContext::default()
        }
    }

    /// Frame needs diagnostic re-logging
    #[inline]
    pub fn is_interesting(&self) -> bool {
        self.malformed || self.noproto
    }
}
