//! Memory-mapped receive ring (TPACKET_V1)

use crate::error::LiveError;
use liblinkwatch::liblinkwatch_tools::Duration;
use liblinkwatch::{Datalink, Interface, ObserverContext, PacketContext, RingInfo};
use std::io;
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

pub const TP_STATUS_KERNEL: libc::c_ulong = 0;
pub const TP_STATUS_USER: libc::c_ulong = 1;
pub const TP_STATUS_COPY: libc::c_ulong = 2;
pub const TP_STATUS_LOSING: libc::c_ulong = 4;

const TPACKET_ALIGNMENT: usize = 16;

/// `struct tpacket_hdr`, at the start of every frame slot
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TpacketHdr {
    pub tp_status: libc::c_ulong,
    pub tp_len: libc::c_uint,
    pub tp_snaplen: libc::c_uint,
    pub tp_mac: libc::c_ushort,
    pub tp_net: libc::c_ushort,
    pub tp_sec: libc::c_uint,
    pub tp_usec: libc::c_uint,
}

#[inline]
pub const fn tpacket_align(x: usize) -> usize {
    (x + TPACKET_ALIGNMENT - 1) & !(TPACKET_ALIGNMENT - 1)
}

/// Bytes of slot metadata preceding the frame
pub fn tpacket_hdrlen() -> usize {
    tpacket_align(std::mem::size_of::<TpacketHdr>()) + std::mem::size_of::<libc::sockaddr_ll>()
}

/// Compute the ring geometry for frames of up to `max_frame` bytes, in a ring
/// of about `target_pages` pages.
///
/// Blocks are the smallest power-of-two multiple of the page size holding one
/// frame; frames grow to use the whole block.
pub fn ring_geometry(page_size: usize, max_frame: usize, target_pages: usize) -> Option<RingInfo> {
    if page_size == 0 {
        return None;
    }
    let mut frame_size = tpacket_align(tpacket_hdrlen() + max_frame);
    let mut block_size = page_size;
    while block_size < frame_size {
        block_size = block_size.checked_mul(2)?;
    }
    let per_block = block_size / frame_size;
    frame_size = block_size / per_block;
    let block_nr = target_pages / (block_size / page_size);
    if block_nr == 0 {
        return None;
    }
    Some(RingInfo {
        block_size: u32::try_from(block_size).ok()?,
        block_nr: u32::try_from(block_nr).ok()?,
        frame_size: u32::try_from(frame_size).ok()?,
        frame_nr: u32::try_from(per_block.checked_mul(block_nr)?).ok()?,
    })
}

/// A ring mapping shared with the kernel
pub struct RingBuffer {
    base: NonNull<u8>,
    info: RingInfo,
    unmap: bool,
}

// SAFETY: the mapping is only accessed through the reader owning it
unsafe impl Send for RingBuffer {}

impl RingBuffer {
    /// Wrap an existing mapping.
    ///
    /// # Safety
    ///
    /// `base` must point to `info.total_size()` bytes, readable and writable,
    /// aligned for `TpacketHdr`, and valid for the lifetime of the buffer. If
    /// `unmap` is true, the region was obtained with `mmap` and is released on
    /// drop.
    pub unsafe fn from_raw(base: NonNull<u8>, info: RingInfo, unmap: bool) -> RingBuffer {
        RingBuffer { base, info, unmap }
    }

    pub fn info(&self) -> RingInfo {
        self.info
    }

    pub fn frames(&self) -> usize {
        self.info.frame_nr as usize
    }

    fn slot_offset(&self, i: usize) -> usize {
        let per_block = (self.info.block_size / self.info.frame_size) as usize;
        (i / per_block) * self.info.block_size as usize
            + (i % per_block) * self.info.frame_size as usize
    }

    fn slot_ptr(&self, i: usize) -> *mut TpacketHdr {
        // SAFETY: offset is within the mapping for i < frame_nr
        unsafe { self.base.as_ptr().add(self.slot_offset(i)) as *mut TpacketHdr }
    }

    /// Current owner of slot `i`
    pub fn status(&self, i: usize) -> libc::c_ulong {
        let hdr = self.slot_ptr(i);
        // SAFETY: hdr is a valid, aligned slot header; the kernel writes it concurrently
        let status = unsafe { ptr::read_volatile(ptr::addr_of!((*hdr).tp_status)) };
        fence(Ordering::Acquire);
        status
    }

    /// Header of slot `i`. Only meaningful once the slot is user-owned.
    pub fn header(&self, i: usize) -> TpacketHdr {
        // SAFETY: as in `status`
        unsafe { ptr::read_volatile(self.slot_ptr(i)) }
    }

    /// Frame bytes of slot `i`, or `None` if the header points outside the slot
    pub fn frame(&self, i: usize, hdr: &TpacketHdr) -> Option<&[u8]> {
        let start = usize::from(hdr.tp_mac);
        let end = start.checked_add(hdr.tp_snaplen as usize)?;
        if end > self.info.frame_size as usize {
            return None;
        }
        // SAFETY: [start, end) lies within slot i, which is user-owned until released
        unsafe {
            let p = self.base.as_ptr().add(self.slot_offset(i) + start);
            Some(std::slice::from_raw_parts(p, end - start))
        }
    }

    /// Hand slot `i` back to the kernel
    pub fn release(&self, i: usize) {
        let hdr = self.slot_ptr(i);
        fence(Ordering::Release);
        // SAFETY: as in `status`
        unsafe { ptr::write_volatile(ptr::addr_of_mut!((*hdr).tp_status), TP_STATUS_KERNEL) };
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        if self.unmap {
            // SAFETY: the region was mapped with this size, see from_raw
            let r = unsafe {
                libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.info.total_size())
            };
            if r != 0 {
                debug!("munmap: {}", io::Error::last_os_error());
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollResult {
    Ready,
    Timeout,
    Interrupted,
    /// Error condition on the socket (device removed, for ex.)
    Hangup,
}

/// The socket behind a ring
pub trait RingSocket {
    fn poll(&self, timeout_ms: i32) -> io::Result<PollResult>;
    /// Read and reset the kernel drop counter
    fn drops(&self) -> io::Result<u32>;
    /// Read the next frame directly, returning its full wire length
    fn recv_truncated(&self, buf: &mut [u8]) -> io::Result<usize>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotOutcome {
    Handled,
    /// Nothing ready: the caller should check for cancellation and call again
    Wait,
}

/// Consumes frames of one interface ring, in slot order
pub struct RingReader {
    ctx: Arc<ObserverContext>,
    iface: Arc<Interface>,
    datalink: Datalink,
    ring: RingBuffer,
    cur: usize,
    timeout_ms: i32,
}

impl RingReader {
    pub fn new(
        ctx: Arc<ObserverContext>,
        iface: Arc<Interface>,
        datalink: Datalink,
        ring: RingBuffer,
        timeout_ms: i32,
    ) -> Self {
        RingReader {
            ctx,
            iface,
            datalink,
            ring,
            cur: 0,
            timeout_ms,
        }
    }

    pub fn position(&self) -> usize {
        self.cur
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    fn tick(&self) {
        let ts = Duration::now();
        let mut state = self.iface.lock();
        state.fps.inc(ts, 0);
        state.bps.inc(ts, 0);
        let pkt = PacketContext::new(self.iface.index(), ts);
        self.ctx.events().frame_observed(&state, &pkt);
    }

    /// Process the current slot. The interface lock is not held while waiting.
    pub fn next_frame<S: RingSocket>(&mut self, sock: &S) -> Result<SlotOutcome, LiveError> {
        let i = self.cur;
        while self.ring.status(i) == TP_STATUS_KERNEL {
            match sock.poll(self.timeout_ms)? {
                PollResult::Ready => (),
                PollResult::Timeout => {
                    self.tick();
                    return Ok(SlotOutcome::Wait);
                }
                PollResult::Interrupted => return Ok(SlotOutcome::Wait),
                PollResult::Hangup => {
                    return Err(LiveError::Ring(format!(
                        "error polling socket of interface {}",
                        self.iface.index()
                    )))
                }
            }
        }
        let hdr = self.ring.header(i);
        self.handle_slot(sock, i, &hdr);
        self.ring.release(i);
        self.cur = (i + 1) % self.ring.frames();
        Ok(SlotOutcome::Handled)
    }

    fn handle_slot<S: RingSocket>(&self, sock: &S, i: usize, hdr: &TpacketHdr) {
        let mut guard = self.iface.lock();
        let state = &mut *guard;
        state.counters.frames += 1;
        let ts = Duration::new(hdr.tp_sec, hdr.tp_usec);
        state.fps.inc(ts, 1);
        if hdr.tp_status & TP_STATUS_LOSING != 0 {
            match sock.drops() {
                Ok(0) => (),
                Ok(n) => {
                    state.counters.drops += u64::from(n);
                    self.ctx.diagnostic(&format!(
                        "[{}] {}/{} drops",
                        state.link.name, n, state.counters.drops
                    ));
                }
                Err(e) => self
                    .ctx
                    .diagnostic(&format!("error reading stats on {}: {}", state.link.name, e)),
            }
        }
        let partial = match self.ring.frame(i, hdr) {
            Some(f) => f,
            None => {
                self.ctx.diagnostic(&format!(
                    "invalid ring slot on {} (mac {} snaplen {})",
                    state.link.name, hdr.tp_mac, hdr.tp_snaplen
                ));
                return;
            }
        };
        let wire_len = hdr.tp_len as usize;
        if hdr.tp_status & TP_STATUS_COPY == 0 && hdr.tp_snaplen == hdr.tp_len {
            trace!("{}: {} bytes", state.link.name, wire_len);
            self.ctx.handle_frame(state, self.datalink, ts, partial, wire_len);
            return;
        }
        state.counters.truncated += 1;
        // the direct read returns the next queued frame, which is not
        // guaranteed to be the one in this slot
        let mut buf = std::mem::take(&mut state.truncbuf);
        if buf.len() < wire_len {
            buf.resize(wire_len, 0);
        }
        let recovered = match sock.recv_truncated(&mut buf) {
            Ok(n) if n > buf.len() => {
                self.ctx.diagnostic(&format!(
                    "couldn't recover truncated frame ({} > {})",
                    n,
                    buf.len()
                ));
                None
            }
            Ok(0) => None,
            Ok(n) => Some(n),
            Err(e) => {
                debug!("recvfrom on {}: {}", state.link.name, e);
                None
            }
        };
        match recovered {
            Some(n) => {
                state.counters.truncated_recovered += 1;
                self.ctx.handle_frame(state, self.datalink, ts, &buf[..n], n);
            }
            None => {
                self.ctx.diagnostic(&format!(
                    "partial capture on {} ({}/{}b)",
                    state.link.name, hdr.tp_snaplen, hdr.tp_len
                ));
                self.ctx.handle_frame(state, self.datalink, ts, partial, wire_len);
            }
        }
        state.truncbuf = buf;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liblinkwatch::liblinkwatch_tools::Config;
    use liblinkwatch::NullSink;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    const FRAME: usize = 256;
    const MAC: u16 = 64;

    struct Scripted {
        polls: RefCell<VecDeque<PollResult>>,
        npolls: Cell<usize>,
        drops: u32,
        recovery: Option<Vec<u8>>,
    }

    impl Scripted {
        fn new(polls: &[PollResult]) -> Self {
            Scripted {
                polls: RefCell::new(polls.iter().copied().collect()),
                npolls: Cell::new(0),
                drops: 0,
                recovery: None,
            }
        }
    }

    impl RingSocket for Scripted {
        fn poll(&self, _timeout_ms: i32) -> io::Result<PollResult> {
            self.npolls.set(self.npolls.get() + 1);
            Ok(self.polls.borrow_mut().pop_front().unwrap_or(PollResult::Timeout))
        }
        fn drops(&self) -> io::Result<u32> {
            Ok(self.drops)
        }
        fn recv_truncated(&self, buf: &mut [u8]) -> io::Result<usize> {
            match &self.recovery {
                Some(f) => {
                    buf[..f.len()].copy_from_slice(f);
                    Ok(f.len())
                }
                None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            }
        }
    }

    fn ether_frame() -> Vec<u8> {
        let mut f = vec![0xff; 6];
        f.extend_from_slice(&[0x02, 0, 0, 0, 0, 9]);
        f.extend_from_slice(&[0x88, 0xb5]);
        f.resize(60, 0);
        f
    }

    struct Fixture {
        // backing store, kept alive while the ring points into it
        _mem: Vec<u64>,
        reader: RingReader,
        iface: Arc<Interface>,
        base: *mut u8,
    }

    impl Fixture {
        fn new() -> Fixture {
            let info = RingInfo {
                block_size: 2 * FRAME as u32,
                block_nr: 1,
                frame_size: FRAME as u32,
                frame_nr: 2,
            };
            let mut mem = vec![0u64; 2 * FRAME / 8];
            let base = mem.as_mut_ptr() as *mut u8;
            let ring = unsafe { RingBuffer::from_raw(NonNull::new(base).unwrap(), info, false) };
            let ctx = Arc::new(
                ObserverContext::new(&Config::default(), Arc::new(NullSink)).with_resolver_conf(None),
            );
            let (iface, _) = ctx.interfaces.get_or_create(2);
            iface.lock().link.name = "eth0".to_owned();
            let reader = RingReader::new(ctx, iface.clone(), Datalink::Ethernet, ring, 10);
            Fixture {
                _mem: mem,
                reader,
                iface,
                base,
            }
        }

        fn fill(&mut self, slot: usize, status: libc::c_ulong, frame: &[u8], wire_len: usize) {
            let hdr = TpacketHdr {
                tp_status: status,
                tp_len: wire_len as u32,
                tp_snaplen: frame.len() as u32,
                tp_mac: MAC,
                tp_net: MAC + 14,
                tp_sec: 1_700_000_000,
                tp_usec: 5,
            };
            unsafe {
                let p = self.base.add(slot * FRAME);
                ptr::write(p as *mut TpacketHdr, hdr);
                ptr::copy_nonoverlapping(frame.as_ptr(), p.add(MAC as usize), frame.len());
            }
        }
    }

    #[test]
    fn geometry_fills_blocks() {
        assert_eq!(tpacket_hdrlen(), 52);
        let info = ring_geometry(4096, 1514, 32768).unwrap();
        assert_eq!(info.block_size, 4096);
        assert_eq!(info.frame_size, 2048);
        assert_eq!(info.block_nr, 32768);
        assert_eq!(info.frame_nr, 65536);
        let info = ring_geometry(4096, 9000, 32768).unwrap();
        assert_eq!(info.block_size, 16384);
        assert_eq!(info.frame_size, 16384);
        assert_eq!(info.block_nr, 8192);
        assert_eq!(info.frame_nr, 8192);
        assert!(ring_geometry(4096, 9000, 2).is_none());
    }

    #[test]
    fn kernel_owned_slot_waits_on_poll() {
        let mut fx = Fixture::new();
        let sock = Scripted::new(&[PollResult::Ready, PollResult::Timeout]);
        assert_eq!(fx.reader.next_frame(&sock).unwrap(), SlotOutcome::Wait);
        assert_eq!(sock.npolls.get(), 2);
        assert_eq!(fx.reader.position(), 0);
        assert_eq!(fx.iface.lock().counters.frames, 0);

        let sock = Scripted::new(&[PollResult::Interrupted]);
        assert_eq!(fx.reader.next_frame(&sock).unwrap(), SlotOutcome::Wait);
        let sock = Scripted::new(&[PollResult::Hangup]);
        assert!(matches!(fx.reader.next_frame(&sock), Err(LiveError::Ring(_))));
    }

    #[test]
    fn ready_slot_is_dissected_and_returned() {
        let mut fx = Fixture::new();
        let frame = ether_frame();
        fx.fill(0, TP_STATUS_USER, &frame, frame.len());
        let sock = Scripted::new(&[]);
        assert_eq!(fx.reader.next_frame(&sock).unwrap(), SlotOutcome::Handled);
        assert_eq!(sock.npolls.get(), 0);
        assert_eq!(fx.reader.ring().status(0), TP_STATUS_KERNEL);
        assert_eq!(fx.reader.position(), 1);
        {
            let state = fx.iface.lock();
            assert_eq!(state.counters.frames, 1);
            assert_eq!(state.counters.bytes, 60);
            assert_eq!(state.counters.noprotocol, 1);
            assert_eq!(state.counters.truncated, 0);
        }
        fx.fill(1, TP_STATUS_USER, &frame, frame.len());
        fx.reader.next_frame(&sock).unwrap();
        assert_eq!(fx.reader.position(), 0);
    }

    #[test]
    fn truncated_frame_is_recovered() {
        let mut fx = Fixture::new();
        let frame = ether_frame();
        fx.fill(0, TP_STATUS_USER | TP_STATUS_COPY, &frame[..20], frame.len());
        let mut sock = Scripted::new(&[]);
        sock.recovery = Some(frame.clone());
        fx.reader.next_frame(&sock).unwrap();
        let state = fx.iface.lock();
        assert_eq!(state.counters.truncated, 1);
        assert_eq!(state.counters.truncated_recovered, 1);
        assert_eq!(state.counters.bytes, 60);
    }

    #[test]
    fn failed_recovery_uses_partial_frame() {
        let mut fx = Fixture::new();
        let frame = ether_frame();
        fx.fill(0, TP_STATUS_USER, &frame[..20], frame.len());
        let sock = Scripted::new(&[]);
        assert_eq!(fx.reader.next_frame(&sock).unwrap(), SlotOutcome::Handled);
        let state = fx.iface.lock();
        assert_eq!(state.counters.frames, 1);
        assert_eq!(state.counters.truncated, 1);
        assert_eq!(state.counters.truncated_recovered, 0);
        assert_eq!(state.counters.bytes, 20);
    }

    #[test]
    fn ring_loss_adds_drops() {
        let mut fx = Fixture::new();
        let frame = ether_frame();
        fx.fill(0, TP_STATUS_USER | TP_STATUS_LOSING, &frame, frame.len());
        let mut sock = Scripted::new(&[]);
        sock.drops = 5;
        fx.reader.next_frame(&sock).unwrap();
        assert_eq!(fx.iface.lock().counters.drops, 5);
    }
}
