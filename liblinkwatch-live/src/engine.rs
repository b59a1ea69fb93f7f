use crate::error::LiveError;
use crate::netlink::{discover, ControlPlane, NetlinkSocket};
use crate::psocket::PacketSocket;
use crate::ring::{RingReader, SlotOutcome};
use crate::watch::watch_resolvers;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use liblinkwatch::liblinkwatch_tools::Config;
use liblinkwatch::{Datalink, Interface, ObserverContext, ResolutionAnswer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration as StdDuration;
use tracing::{debug, error, info, warn};

/// Link-layer headroom added to the MTU when sizing ring frames
const FRAME_HEADROOM: usize = 64;

#[derive(Clone, Copy, Debug)]
struct CaptureParams {
    ring_pages: usize,
    max_frame: usize,
    timeout_ms: i32,
}

/// Live observation: netlink control plane, resolver watcher, answer
/// consumer, and one ring capture thread per interface.
pub struct LiveEngine {
    ctx: Arc<ObserverContext>,
    params: CaptureParams,
    interfaces: Vec<String>,
    answers: Option<Receiver<ResolutionAnswer>>,
}

impl LiveEngine {
    pub fn new(ctx: Arc<ObserverContext>, config: &Config) -> Self {
        let timeout_ms = config.get_usize("live.poll_timeout_ms").unwrap_or(100);
        let params = CaptureParams {
            ring_pages: config.get_usize("live.ring_pages").unwrap_or(32768),
            max_frame: config.get_usize("live.max_frame").unwrap_or(0),
            timeout_ms: i32::try_from(timeout_ms).unwrap_or(i32::MAX),
        };
        LiveEngine {
            ctx,
            params,
            interfaces: Vec::new(),
            answers: None,
        }
    }

    /// Only capture on these interfaces (all up interfaces if empty)
    pub fn with_interfaces(mut self, names: Vec<String>) -> Self {
        self.interfaces = names;
        self
    }

    /// Consume name-resolution answers from this channel
    pub fn with_answers(mut self, rx: Receiver<ResolutionAnswer>) -> Self {
        self.answers = Some(rx);
        self
    }

    pub fn context(&self) -> &Arc<ObserverContext> {
        &self.ctx
    }

    fn spawn<F>(name: &str, f: F) -> Result<JoinHandle<()>, LiveError>
    where
        F: FnOnce() + Send + 'static,
    {
        Ok(thread::Builder::new().name(name.to_owned()).spawn(f)?)
    }

    /// Run until `stop` is set. On failure `stop` is set too, and every
    /// thread already started is joined before the error is returned.
    pub fn run(&mut self, stop: Arc<AtomicBool>) -> Result<(), LiveError> {
        let mut workers = Vec::new();
        let mut captures: HashMap<u32, (Arc<Interface>, JoinHandle<()>)> = HashMap::new();
        let mut res = self.start_workers(&stop, &mut workers);
        if res.is_ok() {
            let period = StdDuration::from_millis(self.params.timeout_ms as u64);
            res = supervise(&stop, period, || self.start_captures(&mut captures, &stop));
        }
        if let Err(ref e) = res {
            error!("live engine failed: {}", e);
        }
        info!("live engine stopping");
        let handles = captures.into_values().map(|(_, h)| h).chain(workers);
        finish(res, &stop, handles)
    }

    fn start_workers(
        &mut self,
        stop: &Arc<AtomicBool>,
        workers: &mut Vec<JoinHandle<()>>,
    ) -> Result<(), LiveError> {
        {
            let (ctx, stop) = (self.ctx.clone(), stop.clone());
            let timeout_ms = self.params.timeout_ms;
            workers.push(Self::spawn("netlink", move || {
                control_loop(ctx, stop, timeout_ms)
            })?);
        }
        if self.ctx.resolver_conf().is_some() {
            let (ctx, stop) = (self.ctx.clone(), stop.clone());
            let timeout_ms = self.params.timeout_ms;
            workers.push(Self::spawn("resolv-watch", move || {
                if let Err(e) = watch_resolvers(ctx, stop, timeout_ms) {
                    warn!("resolver watcher stopped: {}", e);
                }
            })?);
        }
        if let Some(rx) = self.answers.take() {
            let (ctx, stop) = (self.ctx.clone(), stop.clone());
            let timeout = StdDuration::from_millis(self.params.timeout_ms as u64);
            workers.push(Self::spawn("answers", move || {
                answer_loop(ctx, rx, stop, timeout)
            })?);
        }
        Ok(())
    }

    fn wanted(&self, name: &str) -> bool {
        self.interfaces.is_empty() || self.interfaces.iter().any(|n| n == name)
    }

    /// Start a capture thread on each new up interface with a supported media type
    fn start_captures(
        &self,
        captures: &mut HashMap<u32, (Arc<Interface>, JoinHandle<()>)>,
        stop: &Arc<AtomicBool>,
    ) -> Result<(), LiveError> {
        // forget captures of removed interfaces, so a re-created one is captured again
        captures.retain(|&index, (iface, handle)| {
            let present = self
                .ctx
                .interfaces
                .get(index)
                .map_or(false, |i| Arc::ptr_eq(&i, iface));
            present || !handle.is_finished()
        });
        for index in self.ctx.interfaces.indices() {
            if captures.contains_key(&index) {
                continue;
            }
            let iface = match self.ctx.interfaces.get(index) {
                Some(i) => i,
                None => continue,
            };
            let (name, datalink, mtu) = {
                let state = iface.lock();
                if !state.link.is_up() || !self.wanted(&state.link.name) {
                    continue;
                }
                match Datalink::from_arptype(state.link.arptype) {
                    Some(dl) => (state.link.name.clone(), dl, state.link.mtu as usize),
                    None => continue,
                }
            };
            let mut params = self.params;
            if params.max_frame == 0 {
                params.max_frame = std::cmp::max(mtu, 1500) + FRAME_HEADROOM;
            }
            info!("starting capture on {} ({:?})", name, datalink);
            let (ctx, stop, i) = (self.ctx.clone(), stop.clone(), iface.clone());
            let handle = Self::spawn(&format!("capture-{}", name), move || {
                if let Err(e) = capture(ctx.clone(), i, datalink, params, stop) {
                    ctx.diagnostic(&format!("capture on {} failed: {}", name, e));
                }
            })?;
            captures.insert(index, (iface, handle));
        }
        Ok(())
    }
}

/// Call `step` every `period` until `stop` is set or `step` fails
fn supervise<F>(stop: &AtomicBool, period: StdDuration, mut step: F) -> Result<(), LiveError>
where
    F: FnMut() -> Result<(), LiveError>,
{
    while !stop.load(Ordering::SeqCst) {
        step()?;
        thread::sleep(period);
    }
    Ok(())
}

/// Stop and join all threads, then hand back the run result
fn finish<I>(res: Result<(), LiveError>, stop: &AtomicBool, handles: I) -> Result<(), LiveError>
where
    I: IntoIterator<Item = JoinHandle<()>>,
{
    stop.store(true, Ordering::SeqCst);
    for h in handles {
        if h.join().is_err() {
            error!("a live thread panicked");
        }
    }
    res
}

fn removed(ctx: &ObserverContext, iface: &Arc<Interface>) -> bool {
    ctx.interfaces
        .get(iface.index())
        .map_or(true, |i| !Arc::ptr_eq(&i, iface))
}

fn capture(
    ctx: Arc<ObserverContext>,
    iface: Arc<Interface>,
    datalink: Datalink,
    params: CaptureParams,
    stop: Arc<AtomicBool>,
) -> Result<(), LiveError> {
    let sock = PacketSocket::open(iface.index())?;
    let ring = sock.map_rx_ring(params.max_frame, params.ring_pages)?;
    iface.lock().ring = Some(ring.info());
    let mut reader = RingReader::new(ctx.clone(), iface.clone(), datalink, ring, params.timeout_ms);
    let res = loop {
        if stop.load(Ordering::SeqCst) {
            break Ok(());
        }
        match reader.next_frame(&sock) {
            Ok(SlotOutcome::Handled) => (),
            Ok(SlotOutcome::Wait) => {
                if removed(&ctx, &iface) {
                    debug!("interface {} removed, ending capture", iface.index());
                    break Ok(());
                }
            }
            Err(e) => break Err(e),
        }
    };
    iface.lock().ring = None;
    res
}

fn control_session(
    ctx: &Arc<ObserverContext>,
    stop: &AtomicBool,
    timeout_ms: i32,
) -> Result<(), LiveError> {
    let mut sock = NetlinkSocket::open()?;
    let mut cp = ControlPlane::new(ctx.clone());
    discover(&mut sock, &mut cp, timeout_ms)?;
    info!("discovered {} interfaces", ctx.interfaces.len());
    while !stop.load(Ordering::SeqCst) {
        if sock.poll(timeout_ms)? {
            cp.drain(&mut sock)?;
        }
    }
    Ok(())
}

/// Netlink reader, reopened after each transport failure
fn control_loop(ctx: Arc<ObserverContext>, stop: Arc<AtomicBool>, timeout_ms: i32) {
    while !stop.load(Ordering::SeqCst) {
        match control_session(&ctx, &stop, timeout_ms) {
            Ok(()) => break,
            Err(e) => {
                ctx.diagnostic(&format!("netlink session failed, reopening: {}", e));
                thread::sleep(StdDuration::from_secs(1));
            }
        }
    }
}

fn answer_loop(
    ctx: Arc<ObserverContext>,
    rx: Receiver<ResolutionAnswer>,
    stop: Arc<AtomicBool>,
    timeout: StdDuration,
) {
    while !stop.load(Ordering::SeqCst) {
        match rx.recv_timeout(timeout) {
            Ok(answer) => {
                ctx.offer_resolution(&answer);
                if ctx.drain_answers(&rx).is_none() {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("resolution answer consumer done");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use liblinkwatch::{NameLevel, NullSink};
    use std::net::IpAddr;

    #[test]
    fn engine_parameters_from_config() {
        let mut config = Config::default();
        config.set("live.ring_pages", 64);
        config.set("live.poll_timeout_ms", 20);
        let ctx = Arc::new(ObserverContext::new(&config, Arc::new(NullSink)).with_resolver_conf(None));
        let engine = LiveEngine::new(ctx, &config).with_interfaces(vec!["eth0".to_owned()]);
        assert_eq!(engine.params.ring_pages, 64);
        assert_eq!(engine.params.timeout_ms, 20);
        assert_eq!(engine.params.max_frame, 0);
        assert!(engine.wanted("eth0"));
        assert!(!engine.wanted("wlan0"));
    }

    #[test]
    fn answer_consumer_ends_on_disconnect() {
        let ctx = Arc::new(
            ObserverContext::new(&Config::default(), Arc::new(NullSink)).with_resolver_conf(None),
        );
        let (tx, rx) = unbounded();
        let addr: IpAddr = "192.0.2.1".parse().unwrap();
        tx.send(ResolutionAnswer {
            addr,
            name: "gw.example".to_owned(),
            level: NameLevel::ReverseDns,
        })
        .unwrap();
        drop(tx);
        answer_loop(
            ctx,
            rx,
            Arc::new(AtomicBool::new(false)),
            StdDuration::from_millis(10),
        );
    }

    #[test]
    fn failed_supervision_stops_and_joins_workers() {
        let stop = Arc::new(AtomicBool::new(false));
        let exited = Arc::new(AtomicBool::new(false));
        let worker = {
            let (stop, exited) = (stop.clone(), exited.clone());
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    thread::sleep(StdDuration::from_millis(1));
                }
                exited.store(true, Ordering::SeqCst);
            })
        };
        let mut steps = 0;
        let res = supervise(&stop, StdDuration::from_millis(1), || {
            steps += 1;
            if steps == 3 {
                Err(LiveError::Ring("no ring".to_owned()))
            } else {
                Ok(())
            }
        });
        assert!(matches!(res, Err(LiveError::Ring(_))));
        assert_eq!(steps, 3);
        assert!(!stop.load(Ordering::SeqCst));
        let res = finish(res, &stop, vec![worker]);
        assert!(res.is_err());
        assert!(stop.load(Ordering::SeqCst));
        assert!(exited.load(Ordering::SeqCst));
    }

    #[test]
    fn supervision_ends_when_stopped() {
        let stop = AtomicBool::new(false);
        let mut steps = 0;
        let res = supervise(&stop, StdDuration::from_millis(1), || {
            steps += 1;
            stop.store(true, Ordering::SeqCst);
            Ok(())
        });
        assert!(res.is_ok());
        assert_eq!(steps, 1);
    }

    #[test]
    fn removed_interfaces_are_detected() {
        let ctx = ObserverContext::new(&Config::default(), Arc::new(NullSink)).with_resolver_conf(None);
        let (iface, _) = ctx.interfaces.get_or_create(3);
        assert!(!removed(&ctx, &iface));
        ctx.interfaces.remove(3);
        assert!(removed(&ctx, &iface));
        // same index, new interface
        ctx.interfaces.get_or_create(3);
        assert!(removed(&ctx, &iface));
    }
}
