//! Name resolution queue and resolver list
//!
//! The DNS client is external: it takes pending records from the queue and
//! offers answers back, possibly from another thread.

use crate::hosts::{L3Handle, NameLevel};
use crate::hwaddr::HwAddr;
use indexmap::IndexMap;
use liblinkwatch_tools::Error;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A protocol address waiting for a name
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingResolution {
    pub ifindex: u32,
    pub neighbor: Option<HwAddr>,
    pub addr: IpAddr,
    pub host: L3Handle,
}

/// A name offered by a resolver
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolutionAnswer {
    pub addr: IpAddr,
    pub name: String,
    pub level: NameLevel,
}

/// Pending resolutions, newest last. One record per (interface, address).
#[derive(Default)]
pub struct ResolutionQueue {
    pending: Mutex<IndexMap<(u32, IpAddr), PendingResolution>>,
}

impl ResolutionQueue {
    pub fn new() -> Self {
        ResolutionQueue::default()
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<(u32, IpAddr), PendingResolution>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `addr` for resolution. A record already pending for the same
    /// interface and address becomes the newest one.
    pub fn enqueue(&self, ifindex: u32, neighbor: Option<HwAddr>, addr: IpAddr, host: L3Handle) {
        let mut pending = self.lock();
        let key = (ifindex, addr);
        let neighbor = match pending.shift_remove(&key) {
            Some(old) => neighbor.or(old.neighbor),
            None => neighbor,
        };
        pending.insert(
            key,
            PendingResolution {
                ifindex,
                neighbor,
                addr,
                host,
            },
        );
        trace!("resolution queued for {} ({} pending)", addr, pending.len());
    }

    /// Match an answer against the newest record for `addr`.
    ///
    /// The record is removed when `level` is at least confirmed, otherwise it
    /// stays queued for a later, better answer. Returns the matched record.
    pub fn offer(&self, addr: &IpAddr, level: NameLevel) -> Option<PendingResolution> {
        let mut pending = self.lock();
        let idx = pending
            .iter()
            .rposition(|((_, a), _)| a == addr)?;
        if level >= NameLevel::CONFIRMED {
            pending.shift_remove_index(idx).map(|(_, r)| r)
        } else {
            pending.get_index(idx).map(|(_, r)| r.clone())
        }
    }

    /// Drop all records of an interface, returning how many were dropped
    pub fn forget_interface(&self, ifindex: u32) -> usize {
        let mut pending = self.lock();
        let before = pending.len();
        pending.retain(|(idx, _), _| *idx != ifindex);
        before - pending.len()
    }

    /// Copy of the pending records, oldest first
    pub fn pending(&self) -> Vec<PendingResolution> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard all records, returning the number of outstanding resolutions
    pub fn shutdown(&self) -> usize {
        let mut pending = self.lock();
        let n = pending.len();
        if n > 0 {
            info!("{} resolutions still pending at shutdown", n);
        }
        pending.clear();
        n
    }
}

/// Name servers in use. Readers get a snapshot; a reload swaps the whole list.
#[derive(Default)]
pub struct ResolverList {
    servers: Mutex<Arc<Vec<IpAddr>>>,
}

impl ResolverList {
    pub fn new() -> Self {
        ResolverList::default()
    }

    pub fn current(&self) -> Arc<Vec<IpAddr>> {
        self.servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the list. The previous list is released after the lock.
    pub fn replace(&self, servers: Vec<IpAddr>) {
        let old = {
            let mut guard = self.servers.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *guard, Arc::new(servers))
        };
        drop(old);
    }

    /// Re-read a resolv.conf file. On error the current list is kept.
    pub fn reload<P: AsRef<Path>>(&self, path: P) -> Result<usize, Error> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            warn!("resolver configuration {}: {}", path.display(), e);
            e
        })?;
        let servers = parse_resolv_conf(&content);
        let n = servers.len();
        self.replace(servers);
        debug!("loaded {} name servers from {}", n, path.display());
        Ok(n)
    }
}

/// Extract `nameserver` addresses from a resolv.conf document
pub fn parse_resolv_conf(content: &str) -> Vec<IpAddr> {
    let mut servers = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let mut fields = line.split_whitespace();
        if fields.next() != Some("nameserver") {
            continue;
        }
        // scoped IPv6 addresses carry a zone suffix
        let addr = fields.next().map(|s| s.split('%').next().unwrap_or(s));
        match addr.map(str::parse::<IpAddr>) {
            Some(Ok(a)) => servers.push(a),
            _ => debug!("resolv.conf line {}: skipping {:?}", lineno + 1, line),
        }
    }
    servers
}
