use crate::datalink::Datalink;
use crate::hwaddr::HwAddr;
use crate::neighbors::NeighborDirectory;
use crate::timestat::TimeStat;
use fnv::FnvHashMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

pub const IFF_UP: u32 = 0x1;
pub const IFF_BROADCAST: u32 = 0x2;
pub const IFF_LOOPBACK: u32 = 0x8;
pub const IFF_POINTOPOINT: u32 = 0x10;
pub const IFF_RUNNING: u32 = 0x40;
pub const IFF_NOARP: u32 = 0x80;
pub const IFF_PROMISC: u32 = 0x100;
pub const IFF_MULTICAST: u32 = 0x1000;
pub const IFF_LOWER_UP: u32 = 0x10000;

pub const ARPHRD_ETHER: u16 = 1;
pub const ARPHRD_LOOPBACK: u16 = 772;
pub const ARPHRD_IRDA: u16 = 783;
pub const ARPHRD_IEEE80211: u16 = 801;
pub const ARPHRD_IEEE80211_PRISM: u16 = 802;
pub const ARPHRD_IEEE80211_RADIOTAP: u16 = 803;
pub const ARPHRD_NONE: u16 = 0xfffe;

/// Human-readable name of an ARP hardware (media) type
pub fn media_name(arptype: u16) -> &'static str {
    match arptype {
        ARPHRD_ETHER => "Ethernet",
        ARPHRD_LOOPBACK => "Loopback",
        ARPHRD_IRDA => "IrDA",
        ARPHRD_IEEE80211 => "IEEE 802.11",
        ARPHRD_IEEE80211_PRISM => "IEEE 802.11 (Prism)",
        ARPHRD_IEEE80211_RADIOTAP => "IEEE 802.11 (radiotap)",
        ARPHRD_NONE => "None",
        _ => "Unknown",
    }
}

/// Link-level identity of an interface, as reported by the control plane
#[derive(Clone, Debug, Default, Serialize)]
pub struct LinkInfo {
    pub index: u32,
    pub name: String,
    pub hwaddr: Option<HwAddr>,
    pub bcast: Option<HwAddr>,
    pub mtu: u32,
    pub flags: u32,
    pub arptype: u16,
    pub operstate: u8,
}

impl LinkInfo {
    /// Hardware address width, or 0 if unknown
    pub fn addrlen(&self) -> usize {
        self.hwaddr.map(|a| a.len()).unwrap_or(0)
    }

    /// Broadcast address, if the link supports broadcast
    pub fn broadcast(&self) -> Option<&HwAddr> {
        if self.flags & IFF_BROADCAST != 0 {
            self.bcast.as_ref()
        } else {
            None
        }
    }

    #[inline]
    pub fn is_up(&self) -> bool {
        self.flags & IFF_UP != 0
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct Counters {
    pub frames: u64,
    pub bytes: u64,
    pub drops: u64,
    pub truncated: u64,
    pub truncated_recovered: u64,
    pub malformed: u64,
    pub noprotocol: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WirelessSettings {
    pub mode: u32,
    pub frequency: u64,
    pub bitrate: u32,
    pub last_event: Option<u16>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub enum MediaSettings {
    #[default]
    Unknown,
    Wired,
    Wireless(WirelessSettings),
}

/// A protocol address assigned to the interface
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct IfAddr {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl IfAddr {
    /// True if `other` is in the same subnet
    pub fn contains(&self, other: &IpAddr) -> bool {
        match (self.addr, other) {
            (IpAddr::V4(a), IpAddr::V4(b)) => {
                let plen = u32::from(std::cmp::min(self.prefix_len, 32));
                let mask = if plen == 0 { 0 } else { u32::MAX << (32 - plen) };
                u32::from(a) & mask == u32::from(*b) & mask
            }
            (IpAddr::V6(a), IpAddr::V6(b)) => {
                let plen = u32::from(std::cmp::min(self.prefix_len, 128));
                let mask = if plen == 0 { 0 } else { u128::MAX << (128 - plen) };
                u128::from(a) & mask == u128::from(*b) & mask
            }
            _ => false,
        }
    }
}

/// The first of `addresses` whose subnet contains `addr`
pub fn route_to(addresses: &[IfAddr], addr: &IpAddr) -> Option<IpAddr> {
    addresses.iter().find(|a| a.contains(addr)).map(|a| a.addr)
}

/// Geometry of a memory-mapped capture ring
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RingInfo {
    pub block_size: u32,
    pub block_nr: u32,
    pub frame_size: u32,
    pub frame_nr: u32,
}

impl RingInfo {
    pub fn total_size(&self) -> usize {
        self.block_size as usize * self.block_nr as usize
    }
}

/// All mutable state of one interface, guarded by the interface lock
pub struct InterfaceState {
    pub link: LinkInfo,
    pub settings: MediaSettings,
    pub addresses: Vec<IfAddr>,
    pub counters: Counters,
    pub fps: TimeStat,
    pub bps: TimeStat,
    /// Scratch buffer for truncation recovery reads
    pub truncbuf: Vec<u8>,
    pub ring: Option<RingInfo>,
    /// Datalink selected for a capture file
    pub datalink: Option<Datalink>,
    pub neighbors: NeighborDirectory,
}

impl InterfaceState {
    pub fn new(index: u32, neighbor_capacity: usize) -> Self {
        InterfaceState {
            link: LinkInfo {
                index,
                ..LinkInfo::default()
            },
            settings: MediaSettings::default(),
            addresses: Vec::new(),
            counters: Counters::default(),
            fps: TimeStat::default(),
            bps: TimeStat::default(),
            truncbuf: Vec::new(),
            ring: None,
            datalink: None,
            neighbors: NeighborDirectory::new(0, neighbor_capacity),
        }
    }

    /// On-link route lookup: the local address whose subnet contains `addr`
    pub fn route_to(&self, addr: &IpAddr) -> Option<IpAddr> {
        route_to(&self.addresses, addr)
    }

    /// Set the hardware address, keeping the neighbor directory width consistent
    pub fn set_hwaddr(&mut self, addr: HwAddr) {
        if self.link.hwaddr.map(|a| a.len()) != Some(addr.len()) {
            self.neighbors.reset_width(addr.len());
        }
        self.link.hwaddr = Some(addr);
    }

    pub fn add_address(&mut self, addr: IfAddr) {
        if !self.addresses.contains(&addr) {
            self.addresses.push(addr);
        }
    }

    pub fn remove_address(&mut self, addr: &IfAddr) -> bool {
        let before = self.addresses.len();
        self.addresses.retain(|a| a != addr);
        before != self.addresses.len()
    }

    /// Statistics summary, for reporting
    pub fn summary(&self) -> Value {
        let neighbors: Vec<Value> = self
            .neighbors
            .iter()
            .map(|n| {
                json!({
                    "hwaddr": n.addr,
                    "name": n.name,
                    "device": n.devname,
                    "src_frames": n.srcpkt,
                    "dst_frames": n.dstpkt,
                })
            })
            .collect();
        json!({
            "index": self.link.index,
            "name": self.link.name,
            "media": media_name(self.link.arptype),
            "counters": self.counters,
            "fps_peak": self.fps.peak,
            "bps_peak": self.bps.peak,
            "neighbors": neighbors,
        })
    }
}

/// A network interface: its index and its locked state
pub struct Interface {
    index: u32,
    state: Mutex<InterfaceState>,
}

impl Interface {
    pub fn new(index: u32, neighbor_capacity: usize) -> Self {
        Interface {
            index,
            state: Mutex::new(InterfaceState::new(index, neighbor_capacity)),
        }
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Acquire the interface lock. A poisoned lock is recovered: state is
    /// only counters and caches, which stay usable.
    pub fn lock(&self) -> MutexGuard<'_, InterfaceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Process-wide directory of known interfaces
pub struct InterfaceTable {
    map: RwLock<FnvHashMap<u32, Arc<Interface>>>,
    neighbor_capacity: usize,
}

impl InterfaceTable {
    pub fn new(neighbor_capacity: usize) -> Self {
        InterfaceTable {
            map: RwLock::new(FnvHashMap::default()),
            neighbor_capacity,
        }
    }

    pub fn get(&self, index: u32) -> Option<Arc<Interface>> {
        let map = self.map.read().unwrap_or_else(PoisonError::into_inner);
        map.get(&index).cloned()
    }

    /// Look up an interface, creating it if needed. The boolean is true if it was created.
    pub fn get_or_create(&self, index: u32) -> (Arc<Interface>, bool) {
        if let Some(iface) = self.get(index) {
            return (iface, false);
        }
        let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
        let mut created = false;
        let iface = map
            .entry(index)
            .or_insert_with(|| {
                created = true;
                Arc::new(Interface::new(index, self.neighbor_capacity))
            })
            .clone();
        (iface, created)
    }

    pub fn remove(&self, index: u32) -> Option<Arc<Interface>> {
        let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
        map.remove(&index)
    }

    /// Known interface indices, sorted
    pub fn indices(&self) -> Vec<u32> {
        let map = self.map.read().unwrap_or_else(PoisonError::into_inner);
        let mut v: Vec<u32> = map.keys().copied().collect();
        v.sort_unstable();
        v
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn interface_table_create_once() {
        let table = InterfaceTable::new(16);
        let (a, created) = table.get_or_create(3);
        assert!(created);
        let (b, created) = table.get_or_create(3);
        assert!(!created);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.indices(), vec![3]);
        assert!(table.remove(3).is_some());
        assert!(table.get(3).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn route_lookup_on_link() {
        let mut state = InterfaceState::new(1, 16);
        state.add_address(IfAddr {
            addr: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
            prefix_len: 24,
        });
        assert_eq!(
            state.route_to(&IpAddr::V4(Ipv4Addr::new(192, 168, 1, 77))),
            Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)))
        );
        assert_eq!(state.route_to(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))), None);
        assert_eq!(state.route_to(&"fe80::1".parse().unwrap()), None);
    }

    #[test]
    fn default_prefix_matches_everything() {
        let a = IfAddr {
            addr: "2001:db8::1".parse().unwrap(),
            prefix_len: 0,
        };
        assert!(a.contains(&"fe80::2".parse().unwrap()));
        assert!(!a.contains(&IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }
}
