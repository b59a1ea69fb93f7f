use crate::context::ObserverContext;
use crate::datalink::Datalink;
use crate::hwaddr::HwAddr;
use crate::interface::{Interface, ARPHRD_NONE, IFF_BROADCAST, IFF_UP};
use liblinkwatch_tools::{Error, Frame, FrameAnalyzer, Linktype};
use std::sync::Arc;
use tracing::Span;

struct ReplayInterface {
    iface: Arc<Interface>,
    datalink: Datalink,
}

/// Replay backend: feeds the frames of a capture file to the dissection
/// pipeline.
///
/// Each interface declared by the file becomes an entry of the interface
/// table, numbered from `base_index`.
pub struct ReplayAnalyzer {
    ctx: Arc<ObserverContext>,
    name: String,
    base_index: u32,
    interfaces: Vec<Option<ReplayInterface>>,
    span: Span,
}

impl ReplayAnalyzer {
    pub fn new(ctx: Arc<ObserverContext>, name: &str, base_index: u32) -> Self {
        let span = tracing::info_span!("replay", file = name);
        ReplayAnalyzer {
            ctx,
            name: name.to_owned(),
            base_index,
            interfaces: Vec::new(),
            span,
        }
    }

    pub fn context(&self) -> &Arc<ObserverContext> {
        &self.ctx
    }

    /// Interface table indices of the interfaces declared so far
    pub fn indices(&self) -> Vec<u32> {
        self.interfaces
            .iter()
            .flatten()
            .map(|r| r.iface.index())
            .collect()
    }
}

impl FrameAnalyzer for ReplayAnalyzer {
    fn handle_interface(&mut self, if_id: u32, link_type: Linktype, snaplen: u32) -> Result<(), Error> {
        let _enter = self.span.enter();
        let datalink = match Datalink::from_linktype(link_type) {
            Some(d) => d,
            None => {
                warn!("{}: unhandled datalink type {}", self.name, link_type);
                return Err(Error::Generic("Unhandled datalink type"));
            }
        };
        let index = self.base_index.saturating_add(if_id);
        let (iface, created) = self.ctx.interfaces.get_or_create(index);
        {
            let mut state = iface.lock();
            state.link.name = if if_id == 0 {
                self.name.clone()
            } else {
                format!("{}:{}", self.name, if_id)
            };
            state.link.mtu = snaplen;
            state.link.flags = IFF_UP;
            state.datalink = Some(datalink);
            match datalink.file_addressing() {
                Some((addrlen, arptype)) => {
                    state.link.arptype = arptype;
                    state.link.flags |= IFF_BROADCAST;
                    state.link.bcast = Some(HwAddr::broadcast(addrlen));
                    if let Some(zero) = HwAddr::new(&vec![0u8; addrlen]) {
                        state.set_hwaddr(zero);
                    }
                }
                None => {
                    state.link.arptype = ARPHRD_NONE;
                }
            }
            debug!(
                "{}: interface {} ({:?}, snaplen {})",
                state.link.name, index, datalink, snaplen
            );
            if created {
                self.ctx.events().interface_added(&state.link);
            }
        }
        let id = if_id as usize;
        if self.interfaces.len() <= id {
            self.interfaces.resize_with(id + 1, || None);
        }
        self.interfaces[id] = Some(ReplayInterface { iface, datalink });
        Ok(())
    }

    fn handle_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        let _enter = self.span.enter();
        let replay = match self.interfaces.get(frame.interface as usize) {
            Some(Some(r)) => r,
            _ => {
                warn!(
                    "{}: frame {} on undeclared interface {}",
                    self.name, frame.index, frame.interface
                );
                return Ok(());
            }
        };
        let mut state = replay.iface.lock();
        state.counters.frames += 1;
        state.fps.inc(frame.ts, 1);
        if frame.is_truncated() {
            // accounted, not dissected
            state.counters.truncated += 1;
            trace!(
                "{}: frame {} truncated ({}/{})",
                self.name,
                frame.index,
                frame.caplen,
                frame.origlen
            );
            return Ok(());
        }
        self.ctx.handle_frame(
            &mut state,
            replay.datalink,
            frame.ts,
            frame.data,
            frame.origlen as usize,
        );
        Ok(())
    }

    fn teardown(&mut self) {
        let _enter = self.span.enter();
        for r in self.interfaces.iter().flatten() {
            let state = r.iface.lock();
            info!(
                "{}: {} frames, {} bytes, {} truncated, {} malformed, {} unclassified",
                state.link.name,
                state.counters.frames,
                state.counters.bytes,
                state.counters.truncated,
                state.counters.malformed,
                state.counters.noprotocol
            );
        }
        if let Some(logger) = self.ctx.logger() {
            if let Err(e) = logger.flush() {
                warn!("couldn't flush diagnostics file: {}", e);
            }
        }
    }
}
