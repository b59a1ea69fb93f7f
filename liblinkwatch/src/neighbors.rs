//! Per-interface directory of observed hardware addresses
//!
//! Entries are kept in most-recently-seen order: an arena of nodes linked in a
//! doubly-linked recency list, indexed by address. Lookups and move-to-front
//! are O(1). The directory is bounded; inserting into a full directory evicts
//! the least recently seen entry.

use crate::events::{ConsumerToken, EventSink};
use crate::hwaddr::HwAddr;
use crate::interface::{
    LinkInfo, ARPHRD_ETHER, ARPHRD_IEEE80211, ARPHRD_IEEE80211_PRISM, ARPHRD_IEEE80211_RADIOTAP,
};
use fnv::FnvHashMap;
use lazy_static::lazy_static;
use serde::Serialize;
use std::net::IpAddr;

pub const DEFAULT_NEIGHBOR_CAPACITY: usize = 4096;

const BROADCAST_DEVNAME: &str = "Link broadcast";
const NIL: usize = usize::MAX;

/// Category of a hardware address, relative to the interface it was seen on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Category {
    /// The interface's own address
    Local,
    Unicast,
    Multicast,
    Broadcast,
}

/// Categorize `addr` relative to the interface addresses
pub fn categorize(link: &LinkInfo, addr: &HwAddr) -> Category {
    if !addr.is_multicast() {
        match link.hwaddr {
            Some(ref own) if own == addr => Category::Local,
            _ => Category::Unicast,
        }
    } else {
        match link.broadcast() {
            Some(bcast) if bcast == addr => Category::Broadcast,
            _ => Category::Multicast,
        }
    }
}

/// Vendor (organization) names, indexed by the first three address bytes
pub trait VendorLookup: Send + Sync {
    fn lookup(&self, oui: [u8; 3]) -> Option<&str>;
}

lazy_static! {
    static ref BUILTIN_VENDORS: FnvHashMap<[u8; 3], &'static str> = {
        let mut m = FnvHashMap::default();
        m.insert([0x00, 0x00, 0x0c], "Cisco Systems");
        m.insert([0x00, 0x0c, 0x29], "VMware");
        m.insert([0x00, 0x15, 0x5d], "Microsoft");
        m.insert([0x00, 0x1b, 0x21], "Intel");
        m.insert([0x00, 0x50, 0x56], "VMware");
        m.insert([0x08, 0x00, 0x27], "PCS Systemtechnik");
        m.insert([0x3c, 0x5a, 0xb4], "Google");
        m.insert([0x52, 0x54, 0x00], "QEMU virtual NIC");
        m.insert([0xb8, 0x27, 0xeb], "Raspberry Pi Foundation");
        m.insert([0xf0, 0x18, 0x98], "Apple");
        m
    };
}

/// A small built-in vendor table, used when no external database is provided
#[derive(Clone, Copy, Debug, Default)]
pub struct BuiltinVendors;

impl VendorLookup for BuiltinVendors {
    fn lookup(&self, oui: [u8; 3]) -> Option<&str> {
        BUILTIN_VENDORS.get(&oui).copied()
    }
}

/// An observed hardware address (L2 host)
#[derive(Clone, Debug, Serialize)]
pub struct Neighbor {
    pub addr: HwAddr,
    /// Display name; set at most once
    pub name: Option<String>,
    /// Device descriptor derived from the address
    pub devname: Option<String>,
    #[serde(skip)]
    pub token: Option<ConsumerToken>,
    pub srcpkt: u64,
    pub dstpkt: u64,
}

impl Neighbor {
    fn new(addr: HwAddr, devname: Option<String>) -> Self {
        Neighbor {
            addr,
            name: None,
            devname,
            token: None,
            srcpkt: 0,
            dstpkt: 0,
        }
    }
}

struct Node {
    neighbor: Neighbor,
    prev: usize,
    next: usize,
}

pub struct NeighborDirectory {
    width: usize,
    capacity: usize,
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    index: FnvHashMap<HwAddr, usize>,
}

impl NeighborDirectory {
    /// Create a directory for addresses of `width` bytes (0: adopt the width of
    /// the first inserted address)
    pub fn new(width: usize, capacity: usize) -> Self {
        NeighborDirectory {
            width,
            capacity: std::cmp::max(capacity, 1),
            nodes: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            index: FnvHashMap::default(),
        }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Drop all entries and change the address width
    pub fn reset_width(&mut self, width: usize) {
        if !self.is_empty() {
            debug!(
                "neighbor directory width {} -> {}, dropping {} entries",
                self.width,
                width,
                self.len()
            );
        }
        *self = NeighborDirectory::new(width, self.capacity);
    }

    pub fn get(&self, addr: &HwAddr) -> Option<&Neighbor> {
        self.index.get(addr).map(|&i| &self.nodes[i].neighbor)
    }

    pub fn get_mut(&mut self, addr: &HwAddr) -> Option<&mut Neighbor> {
        match self.index.get(addr) {
            Some(&i) => Some(&mut self.nodes[i].neighbor),
            None => None,
        }
    }

    /// Iterate entries, most recently seen first
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            dir: self,
            cur: self.head,
        }
    }

    /// Find the entry for `addr`, moving it to the front, or create it.
    ///
    /// A new entry gets its device descriptor, is optionally named from
    /// `name`, and is reported to the event consumer. Returns `None` if the
    /// address width does not match the directory.
    pub fn lookup_or_create(
        &mut self,
        link: &LinkInfo,
        addr: &[u8],
        name: Option<IpAddr>,
        vendors: &dyn VendorLookup,
        events: &dyn EventSink,
    ) -> Option<HwAddr> {
        if self.width == 0 && !addr.is_empty() {
            self.width = addr.len();
        }
        if addr.len() != self.width {
            debug!(
                "{}: ignoring {}-byte address in {}-byte directory",
                link.name,
                addr.len(),
                self.width
            );
            return None;
        }
        let hw = HwAddr::new(addr)?;
        if let Some(&i) = self.index.get(&hw) {
            self.unlink(i);
            self.push_front(i);
            return Some(hw);
        }
        if self.len() >= self.capacity {
            self.evict_tail();
        }
        let devname = describe(link, &hw, vendors);
        let mut neighbor = Neighbor::new(hw, devname);
        if let Some(ip) = name {
            neighbor.name = Some(ip.to_string());
        }
        neighbor.token = events.neighbor_observed(link, &neighbor);
        let i = match self.free.pop() {
            Some(i) => {
                self.nodes[i] = Node {
                    neighbor,
                    prev: NIL,
                    next: NIL,
                };
                i
            }
            None => {
                self.nodes.push(Node {
                    neighbor,
                    prev: NIL,
                    next: NIL,
                });
                self.nodes.len() - 1
            }
        };
        self.push_front(i);
        self.index.insert(hw, i);
        Some(hw)
    }

    /// Name an entry from a local protocol address. Names are sticky: an
    /// already-named entry is left unchanged.
    pub fn name_local(
        &mut self,
        link: &LinkInfo,
        addr: &HwAddr,
        ip: IpAddr,
        events: &dyn EventSink,
    ) -> bool {
        self.name_absolute(link, addr, &ip.to_string(), events)
    }

    /// Name an entry from a network address seen on the wire.
    ///
    /// Unicast entries are only named if `route` finds an on-link route to
    /// `ip`; otherwise the name stays unset.
    pub fn name_from_wire<F>(
        &mut self,
        link: &LinkInfo,
        addr: &HwAddr,
        ip: IpAddr,
        route: F,
        events: &dyn EventSink,
    ) -> bool
    where
        F: FnOnce(&IpAddr) -> Option<IpAddr>,
    {
        match self.get(addr) {
            Some(n) if n.name.is_none() => (),
            _ => return false,
        }
        if !addr.is_multicast() && route(&ip).is_none() {
            return false;
        }
        self.name_local(link, addr, ip, events)
    }

    /// Name an entry with a resolved name (sticky, like all names)
    pub fn name_absolute(
        &mut self,
        link: &LinkInfo,
        addr: &HwAddr,
        name: &str,
        events: &dyn EventSink,
    ) -> bool {
        let neighbor = match self.get_mut(addr) {
            Some(n) if n.name.is_none() => n,
            _ => return false,
        };
        neighbor.name = Some(name.to_owned());
        let token = events.neighbor_observed(link, neighbor);
        neighbor.token = token;
        true
    }

    fn unlink(&mut self, i: usize) {
        let (prev, next) = (self.nodes[i].prev, self.nodes[i].next);
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.nodes[i].prev = NIL;
        self.nodes[i].next = NIL;
    }

    fn push_front(&mut self, i: usize) {
        self.nodes[i].prev = NIL;
        self.nodes[i].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = i;
        } else {
            self.tail = i;
        }
        self.head = i;
    }

    fn evict_tail(&mut self) {
        let i = self.tail;
        if i == NIL {
            return;
        }
        self.unlink(i);
        let addr = self.nodes[i].neighbor.addr;
        self.index.remove(&addr);
        self.free.push(i);
        debug!("evicting least recently seen neighbor {}", addr);
    }
}

fn describe(link: &LinkInfo, hw: &HwAddr, vendors: &dyn VendorLookup) -> Option<String> {
    if link.broadcast() == Some(hw) {
        return Some(BROADCAST_DEVNAME.to_owned());
    }
    match link.arptype {
        ARPHRD_ETHER | ARPHRD_IEEE80211 | ARPHRD_IEEE80211_PRISM | ARPHRD_IEEE80211_RADIOTAP => hw
            .oui()
            .and_then(|oui| vendors.lookup(oui))
            .map(str::to_owned),
        _ => None,
    }
}

pub struct Iter<'a> {
    dir: &'a NeighborDirectory,
    cur: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Neighbor;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur == NIL {
            return None;
        }
        let node = &self.dir.nodes[self.cur];
        self.cur = node.next;
        Some(&node.neighbor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use crate::interface::IFF_BROADCAST;
    use std::net::Ipv4Addr;

    fn ether_link() -> LinkInfo {
        LinkInfo {
            index: 2,
            name: "eth0".to_owned(),
            hwaddr: HwAddr::new(&[0x00, 0x1b, 0x21, 0x00, 0x00, 0x01]),
            bcast: Some(HwAddr::broadcast(6)),
            flags: IFF_BROADCAST,
            arptype: ARPHRD_ETHER,
            ..LinkInfo::default()
        }
    }

    fn mac(last: u8) -> [u8; 6] {
        [0x02, 0, 0, 0, 0, last]
    }

    fn order(dir: &NeighborDirectory) -> Vec<u8> {
        dir.iter().map(|n| n.addr.as_bytes()[5]).collect()
    }

    #[test]
    fn recency_order_without_duplicates() {
        let link = ether_link();
        let mut dir = NeighborDirectory::new(6, 16);
        for b in [1, 2, 3, 2, 1, 4, 1] {
            dir.lookup_or_create(&link, &mac(b), None, &BuiltinVendors, &NullSink)
                .unwrap();
        }
        assert_eq!(order(&dir), vec![1, 4, 2, 3]);
        assert_eq!(dir.len(), 4);
    }

    #[test]
    fn eviction_drops_least_recent() {
        let link = ether_link();
        let mut dir = NeighborDirectory::new(6, 3);
        for b in [1, 2, 3, 1, 4] {
            dir.lookup_or_create(&link, &mac(b), None, &BuiltinVendors, &NullSink)
                .unwrap();
        }
        assert_eq!(order(&dir), vec![4, 1, 3]);
        assert!(dir.get(&HwAddr::new(&mac(2)).unwrap()).is_none());
        // slot reuse keeps the list consistent
        dir.lookup_or_create(&link, &mac(5), None, &BuiltinVendors, &NullSink)
            .unwrap();
        assert_eq!(order(&dir), vec![5, 4, 1]);
    }

    #[test]
    fn width_mismatch_rejected() {
        let link = ether_link();
        let mut dir = NeighborDirectory::new(6, 8);
        assert!(dir
            .lookup_or_create(&link, &[1, 2, 3, 4], None, &BuiltinVendors, &NullSink)
            .is_none());
        assert!(dir.is_empty());
    }

    #[test]
    fn categorize_addresses() {
        let link = ether_link();
        let own = link.hwaddr.unwrap();
        assert_eq!(categorize(&link, &own), Category::Local);
        assert_eq!(
            categorize(&link, &HwAddr::new(&mac(9)).unwrap()),
            Category::Unicast
        );
        assert_eq!(
            categorize(&link, &HwAddr::broadcast(6)),
            Category::Broadcast
        );
        let mcast = HwAddr::new(&[0x01, 0x00, 0x5e, 0, 0, 1]).unwrap();
        assert_eq!(categorize(&link, &mcast), Category::Multicast);
        let mut nobcast = link.clone();
        nobcast.flags = 0;
        assert_eq!(
            categorize(&nobcast, &HwAddr::broadcast(6)),
            Category::Multicast
        );
    }

    #[test]
    fn device_descriptors() {
        let link = ether_link();
        let mut dir = NeighborDirectory::new(6, 8);
        let b = dir
            .lookup_or_create(&link, &[0xff; 6], None, &BuiltinVendors, &NullSink)
            .unwrap();
        assert_eq!(dir.get(&b).unwrap().devname.as_deref(), Some("Link broadcast"));
        let v = dir
            .lookup_or_create(&link, &[0x00, 0x50, 0x56, 1, 2, 3], None, &BuiltinVendors, &NullSink)
            .unwrap();
        assert_eq!(dir.get(&v).unwrap().devname.as_deref(), Some("VMware"));
    }

    #[test]
    fn names_are_sticky_and_routed() {
        let link = ether_link();
        let mut dir = NeighborDirectory::new(6, 8);
        let ip1 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let ip2 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let hw = dir
            .lookup_or_create(&link, &mac(1), None, &BuiltinVendors, &NullSink)
            .unwrap();
        // no route: unicast stays unnamed
        assert!(!dir.name_from_wire(&link, &hw, ip1, |_| None, &NullSink));
        assert!(dir.get(&hw).unwrap().name.is_none());
        assert!(dir.name_from_wire(&link, &hw, ip1, |ip| Some(*ip), &NullSink));
        assert!(!dir.name_local(&link, &hw, ip2, &NullSink));
        assert_eq!(dir.get(&hw).unwrap().name.as_deref(), Some("10.0.0.1"));
        // multicast is named without a route
        let m = dir
            .lookup_or_create(&link, &[0x01, 0x00, 0x5e, 0, 0, 1], None, &BuiltinVendors, &NullSink)
            .unwrap();
        assert!(dir.name_from_wire(&link, &m, "224.0.0.1".parse().unwrap(), |_| None, &NullSink));
    }
}
