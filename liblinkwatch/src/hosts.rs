//! Contract of the protocol (L3) address table
//!
//! The dissection pipeline only needs insert-or-lookup by address, per-address
//! counters and naming. `HostTable` is the default in-memory implementation.

use crate::hwaddr::HwAddr;
use indexmap::IndexMap;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};

/// Handle to an entry of an `AddressTable`
pub type L3Handle = usize;

/// Confidence of a name. Higher levels replace lower ones.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum NameLevel {
    #[default]
    None,
    Local,
    Multicast,
    ReverseDns,
    Static,
}

impl NameLevel {
    /// Level at which a pending resolution is considered done
    pub const CONFIRMED: NameLevel = NameLevel::ReverseDns;
}

#[derive(Clone, Debug, Serialize)]
pub struct L3Host {
    pub ifindex: u32,
    pub addr: IpAddr,
    pub neighbor: Option<HwAddr>,
    pub name: Option<String>,
    pub level: NameLevel,
    pub srcpkt: u64,
    pub dstpkt: u64,
}

pub trait AddressTable: Send + Sync {
    /// Find or insert the entry for `addr` on interface `ifindex`. The boolean is
    /// true if the entry was created.
    fn lookup_or_create(&self, ifindex: u32, neighbor: Option<HwAddr>, addr: IpAddr)
        -> (L3Handle, bool);

    fn count_source(&self, handle: L3Handle);

    fn count_destination(&self, handle: L3Handle);

    /// Name an entry. Returns false if the entry already has a name of equal or
    /// higher level.
    fn set_name(&self, handle: L3Handle, name: &str, level: NameLevel) -> bool;

    fn get(&self, handle: L3Handle) -> Option<L3Host>;
}

/// Default address table: insertion-ordered, never shrinks
#[derive(Default)]
pub struct HostTable {
    hosts: Mutex<IndexMap<(u32, IpAddr), L3Host>>,
}

impl HostTable {
    pub fn new() -> Self {
        HostTable::default()
    }

    pub fn len(&self) -> usize {
        self.hosts.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of all entries, in insertion order
    pub fn snapshot(&self) -> Vec<L3Host> {
        let hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        hosts.values().cloned().collect()
    }
}

impl AddressTable for HostTable {
    fn lookup_or_create(
        &self,
        ifindex: u32,
        neighbor: Option<HwAddr>,
        addr: IpAddr,
    ) -> (L3Handle, bool) {
        let mut hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = hosts.entry((ifindex, addr));
        let index = entry.index();
        let created = matches!(entry, indexmap::map::Entry::Vacant(_));
        entry
            .and_modify(|h| {
                if h.neighbor.is_none() {
                    h.neighbor = neighbor;
                }
            })
            .or_insert_with(|| L3Host {
                ifindex,
                addr,
                neighbor,
                name: None,
                level: NameLevel::None,
                srcpkt: 0,
                dstpkt: 0,
            });
        (index, created)
    }

    fn count_source(&self, handle: L3Handle) {
        let mut hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, h)) = hosts.get_index_mut(handle) {
            h.srcpkt += 1;
        }
    }

    fn count_destination(&self, handle: L3Handle) {
        let mut hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, h)) = hosts.get_index_mut(handle) {
            h.dstpkt += 1;
        }
    }

    fn set_name(&self, handle: L3Handle, name: &str, level: NameLevel) -> bool {
        let mut hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        match hosts.get_index_mut(handle) {
            Some((_, h)) if h.name.is_none() || level > h.level => {
                h.name = Some(name.to_owned());
                h.level = level;
                true
            }
            _ => false,
        }
    }

    fn get(&self, handle: L3Handle) -> Option<L3Host> {
        let hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        hosts.get_index(handle).map(|(_, h)| h.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_table_lookup_and_naming() {
        let table = HostTable::new();
        let addr: IpAddr = "192.0.2.7".parse().unwrap();
        let (h, created) = table.lookup_or_create(1, None, addr);
        assert!(created);
        let (h2, created) = table.lookup_or_create(1, None, addr);
        assert!(!created);
        assert_eq!(h, h2);
        let (h3, created) = table.lookup_or_create(2, None, addr);
        assert!(created);
        assert_ne!(h, h3);

        assert!(table.set_name(h, "local", NameLevel::Local));
        assert!(!table.set_name(h, "again", NameLevel::Local));
        assert!(table.set_name(h, "host.example", NameLevel::ReverseDns));
        table.count_source(h);
        let host = table.get(h).unwrap();
        assert_eq!(host.name.as_deref(), Some("host.example"));
        assert_eq!(host.level, NameLevel::ReverseDns);
        assert_eq!(host.srcpkt, 1);
        assert_eq!(table.len(), 2);
    }
}
