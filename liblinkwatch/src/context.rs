use crate::datalink::Datalink;
use crate::dissect::Dissector;
use crate::events::EventSink;
use crate::hosts::{AddressTable, HostTable};
use crate::interface::{InterfaceState, InterfaceTable};
use crate::logger::FrameLogger;
use crate::neighbors::{BuiltinVendors, VendorLookup, DEFAULT_NEIGHBOR_CAPACITY};
use crate::packet::PacketContext;
use crate::resolv::{ResolutionAnswer, ResolutionQueue, ResolverList};
use crate::sll::SllHeader;
use crossbeam_channel::{Receiver, TryRecvError};
use liblinkwatch_tools::{Config, Duration, Error};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DEFAULT_RESOLV_CONF: &str = "/etc/resolv.conf";

/// State shared by all components of an observer: capture threads, control
/// plane, resolver, and the event consumer.
///
/// Each shared table carries its own lock; the context itself is immutable
/// once built and is shared behind an `Arc`.
pub struct ObserverContext {
    pub interfaces: InterfaceTable,
    pub resolution: ResolutionQueue,
    pub resolvers: ResolverList,
    resolver_conf: Option<PathBuf>,
    logger: Option<FrameLogger>,
    events: Arc<dyn EventSink>,
    hosts: Arc<dyn AddressTable>,
    vendors: Arc<dyn VendorLookup>,
}

impl ObserverContext {
    /// Build a context without diagnostics logging
    pub fn new(config: &Config, events: Arc<dyn EventSink>) -> Self {
        let capacity = config
            .get_usize("neighbors.capacity")
            .unwrap_or(DEFAULT_NEIGHBOR_CAPACITY);
        let resolver_conf = config
            .get("resolver.conf")
            .unwrap_or(DEFAULT_RESOLV_CONF);
        ObserverContext {
            interfaces: InterfaceTable::new(capacity),
            resolution: ResolutionQueue::new(),
            resolvers: ResolverList::new(),
            resolver_conf: Some(PathBuf::from(resolver_conf)),
            logger: None,
            events,
            hosts: Arc::new(HostTable::new()),
            vendors: Arc::new(BuiltinVendors),
        }
    }

    /// Build a context, opening the diagnostics capture file if configured and
    /// loading the resolver list.
    pub fn from_config(config: &Config, events: Arc<dyn EventSink>) -> Result<Self, Error> {
        let mut ctx = ObserverContext::new(config, events);
        if let Some(path) = config.get("diagnostics.pcap") {
            let path = match config.get("output_dir") {
                Some(dir) if Path::new(path).is_relative() => Path::new(dir).join(path),
                _ => PathBuf::from(path),
            };
            ctx.logger = Some(FrameLogger::create(&path)?);
        }
        // a missing resolver configuration is not fatal
        if let Err(e) = ctx.reload_resolvers() {
            info!("starting without resolvers: {}", e);
        }
        Ok(ctx)
    }

    pub fn with_address_table(mut self, hosts: Arc<dyn AddressTable>) -> Self {
        self.hosts = hosts;
        self
    }

    pub fn with_vendors(mut self, vendors: Arc<dyn VendorLookup>) -> Self {
        self.vendors = vendors;
        self
    }

    pub fn with_logger(mut self, logger: FrameLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_resolver_conf(mut self, path: Option<PathBuf>) -> Self {
        self.resolver_conf = path;
        self
    }

    #[inline]
    pub fn events(&self) -> &dyn EventSink {
        &*self.events
    }

    #[inline]
    pub fn hosts(&self) -> &dyn AddressTable {
        &*self.hosts
    }

    #[inline]
    pub fn vendors(&self) -> &dyn VendorLookup {
        &*self.vendors
    }

    pub fn logger(&self) -> Option<&FrameLogger> {
        self.logger.as_ref()
    }

    pub fn resolver_conf(&self) -> Option<&Path> {
        self.resolver_conf.as_deref()
    }

    /// Report a problem to the operator
    pub fn diagnostic(&self, msg: &str) {
        warn!("{}", msg);
        self.events.diagnostic(msg);
    }

    /// Classify one frame and account the classification
    pub fn dissect(
        &self,
        iface: &mut InterfaceState,
        datalink: Datalink,
        ts: Duration,
        data: &[u8],
    ) -> PacketContext {
        let pkt = Dissector::new(self, iface, ts).run(datalink, data);
        if pkt.malformed {
            iface.counters.malformed += 1;
        }
        if pkt.noproto {
            iface.counters.noprotocol += 1;
        }
        if let Some(hw) = pkt.l2s {
            if let Some(n) = iface.neighbors.get_mut(&hw) {
                n.srcpkt += 1;
            }
        }
        if let Some(hw) = pkt.l2d {
            if let Some(n) = iface.neighbors.get_mut(&hw) {
                n.dstpkt += 1;
            }
        }
        if let Some(h) = pkt.l3s {
            self.hosts.count_source(h);
        }
        if let Some(h) = pkt.l3d {
            self.hosts.count_destination(h);
        }
        pkt
    }

    /// Post-processing common to all capture backends: consumer notification
    /// and re-logging of frames that could not be fully classified.
    pub fn finish_frame(
        &self,
        iface: &InterfaceState,
        datalink: Datalink,
        pkt: &PacketContext,
        data: &[u8],
        wire_len: usize,
    ) {
        self.events.frame_observed(iface, pkt);
        if !pkt.is_interesting() {
            return;
        }
        if let Some(logger) = &self.logger {
            let res = if datalink == Datalink::LinuxCooked {
                logger.log_frame(pkt.ts, data, 0, None, wire_len)
            } else {
                let hdr = SllHeader::for_frame(&iface.link, pkt);
                logger.log_frame(pkt.ts, data, pkt.l2hlen, Some(&hdr), wire_len)
            };
            if let Err(e) = res {
                self.diagnostic(&format!("couldn't log frame on {}: {}", iface.link.name, e));
            }
        }
    }

    /// Dissect a frame, account its bytes and post-process it
    pub fn handle_frame(
        &self,
        iface: &mut InterfaceState,
        datalink: Datalink,
        ts: Duration,
        data: &[u8],
        wire_len: usize,
    ) -> PacketContext {
        let pkt = self.dissect(iface, datalink, ts, data);
        iface.counters.bytes += data.len() as u64;
        iface.bps.inc(ts, data.len() as u64);
        self.finish_frame(iface, datalink, &pkt, data, wire_len);
        pkt
    }

    /// Apply a resolver answer to the matching pending record. Returns false
    /// if nothing was waiting for this address.
    pub fn offer_resolution(&self, answer: &ResolutionAnswer) -> bool {
        let record = match self.resolution.offer(&answer.addr, answer.level) {
            Some(r) => r,
            None => {
                debug!("unsolicited resolution for {}", answer.addr);
                return false;
            }
        };
        self.hosts.set_name(record.host, &answer.name, answer.level);
        if let Some(hw) = record.neighbor {
            if let Some(iface) = self.interfaces.get(record.ifindex) {
                let mut state = iface.lock();
                let InterfaceState {
                    ref link,
                    ref mut neighbors,
                    ..
                } = *state;
                neighbors.name_absolute(link, &hw, &answer.name, &*self.events);
            }
        }
        true
    }

    /// Apply all answers available on `rx` without blocking. Returns the
    /// number of answers read, or `None` once the channel is disconnected.
    pub fn drain_answers(&self, rx: &Receiver<ResolutionAnswer>) -> Option<usize> {
        let mut n = 0;
        loop {
            match rx.try_recv() {
                Ok(answer) => {
                    self.offer_resolution(&answer);
                    n += 1;
                }
                Err(TryRecvError::Empty) => return Some(n),
                Err(TryRecvError::Disconnected) => {
                    return if n > 0 { Some(n) } else { None };
                }
            }
        }
    }

    /// Reload the resolver list from its configuration file
    pub fn reload_resolvers(&self) -> Result<usize, Error> {
        match &self.resolver_conf {
            Some(path) => self.resolvers.reload(path),
            None => Ok(0),
        }
    }

    /// Stop accepting work: flush the diagnostics file and drop pending
    /// resolutions. Returns the number of outstanding resolutions.
    pub fn shutdown(&self) -> usize {
        if let Some(logger) = &self.logger {
            if let Err(e) = logger.flush() {
                warn!("couldn't flush diagnostics file: {}", e);
            }
        }
        self.resolution.shutdown()
    }

    /// Statistics of all interfaces, for reporting
    pub fn summary(&self) -> Value {
        let interfaces: Vec<Value> = self
            .interfaces
            .indices()
            .into_iter()
            .filter_map(|idx| self.interfaces.get(idx))
            .map(|iface| iface.lock().summary())
            .collect();
        json!({
            "interfaces": interfaces,
            "pending_resolutions": self.resolution.len(),
            "logged_frames": self.logger.as_ref().map(|l| l.frames()).unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datalink::Datalink;
    use crate::events::NullSink;
    use crate::hosts::NameLevel;
    use crate::hwaddr::HwAddr;
    use crate::interface::IfAddr;
    use crossbeam_channel::unbounded;

    fn ipv4_frame(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut f = vec![0x02, 0, 0, 0, 0, 2, 0x02, 0, 0, 0, 0, 1, 0x08, 0x00];
        f.extend_from_slice(&[0x45, 0, 0, 28, 0, 0, 0, 0, 64, 17, 0, 0]);
        f.extend_from_slice(&src);
        f.extend_from_slice(&dst);
        // UDP, 8 bytes, from port 53
        f.extend_from_slice(&[0, 53, 0x80, 0, 0, 8, 0, 0]);
        f
    }

    #[test]
    fn resolver_configuration_is_optional() {
        let dir = std::env::temp_dir().join(format!("linkwatch-ctx-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let conf = dir.join("resolv.conf");

        let mut config = Config::default();
        config.set("resolver.conf", &*conf.to_string_lossy());
        let ctx = ObserverContext::from_config(&config, Arc::new(NullSink)).unwrap();
        assert!(ctx.resolvers.current().is_empty());

        std::fs::write(&conf, "nameserver 192.0.2.53\nnameserver 2001:db8::53\n").unwrap();
        let ctx = ObserverContext::from_config(&config, Arc::new(NullSink)).unwrap();
        assert_eq!(ctx.resolvers.current().len(), 2);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn wire_naming_needs_an_on_link_route() {
        let ctx = ObserverContext::new(&Config::default(), Arc::new(NullSink))
            .with_resolver_conf(None);
        let (iface, _) = ctx.interfaces.get_or_create(2);
        iface.lock().add_address(IfAddr {
            addr: "192.0.2.10".parse().unwrap(),
            prefix_len: 24,
        });
        let src = HwAddr::new(&[0x02, 0, 0, 0, 0, 1]).unwrap();

        let mut state = iface.lock();
        let off_link = ipv4_frame([198, 51, 100, 7], [192, 0, 2, 10]);
        ctx.handle_frame(&mut state, Datalink::Ethernet, Duration::new(1, 0), &off_link, off_link.len());
        assert!(state.neighbors.get(&src).unwrap().name.is_none());

        let on_link = ipv4_frame([192, 0, 2, 7], [192, 0, 2, 10]);
        ctx.handle_frame(&mut state, Datalink::Ethernet, Duration::new(2, 0), &on_link, on_link.len());
        assert_eq!(state.neighbors.get(&src).unwrap().name.as_deref(), Some("192.0.2.7"));
    }

    #[test]
    fn resolution_names_host_and_neighbor() {
        let ctx = ObserverContext::new(&Config::default(), Arc::new(NullSink))
            .with_resolver_conf(None);
        let (iface, _) = ctx.interfaces.get_or_create(2);
        let frame = ipv4_frame([198, 51, 100, 7], [192, 0, 2, 1]);
        {
            let mut state = iface.lock();
            let pkt = ctx.handle_frame(&mut state, Datalink::Ethernet, Duration::new(1, 0), &frame, frame.len());
            assert!(!pkt.malformed && !pkt.noproto);
            assert_eq!(state.counters.bytes, frame.len() as u64);
        }
        assert_eq!(ctx.resolution.len(), 2);

        let (tx, rx) = unbounded();
        tx.send(ResolutionAnswer {
            addr: "198.51.100.7".parse().unwrap(),
            name: "ns.example.net".to_owned(),
            level: NameLevel::ReverseDns,
        })
        .unwrap();
        assert_eq!(ctx.drain_answers(&rx), Some(1));
        assert_eq!(ctx.resolution.len(), 1);

        let src = HwAddr::new(&[0x02, 0, 0, 0, 0, 1]).unwrap();
        let state = iface.lock();
        let n = state.neighbors.get(&src).unwrap();
        assert_eq!(n.name.as_deref(), Some("ns.example.net"));
        assert_eq!(n.srcpkt, 1);
        drop(state);
        drop(tx);
        assert_eq!(ctx.drain_answers(&rx), None);
        assert_eq!(ctx.shutdown(), 1);
    }
}
