use crate::sll::{SllHeader, SLL_HDR_LEN};
use liblinkwatch_tools::{Duration, Linktype, PcapWriter};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

const LOG_SNAPLEN: usize = 65535;

/// Re-logs interesting frames to a capture file, in Linux cooked framing.
///
/// The link-layer header of each frame is replaced by a synthesized cooked
/// header. All writes go through one lock.
pub struct FrameLogger {
    writer: Mutex<PcapWriter<Box<dyn Write + Send>>>,
    frames: AtomicU64,
}

impl FrameLogger {
    /// Write the file header to `w` and return the logger
    pub fn new(w: Box<dyn Write + Send>) -> Result<FrameLogger, io::Error> {
        let mut writer = PcapWriter::new(w);
        writer.init_file(LOG_SNAPLEN, Linktype::LINUX_SLL)?;
        Ok(FrameLogger {
            writer: Mutex::new(writer),
            frames: AtomicU64::new(0),
        })
    }

    pub fn create<P: AsRef<Path>>(path: P) -> Result<FrameLogger, io::Error> {
        let f = File::create(path.as_ref())?;
        debug!("logging diagnostic frames to {}", path.as_ref().display());
        FrameLogger::new(Box::new(BufWriter::new(f)))
    }

    /// Log one frame.
    ///
    /// `l2hlen` bytes of link-layer header are replaced by `hdr`. Without a
    /// header the frame is already in cooked framing and is written unchanged.
    pub fn log_frame(
        &self,
        ts: Duration,
        data: &[u8],
        l2hlen: usize,
        hdr: Option<&SllHeader>,
        wire_len: usize,
    ) -> Result<(), io::Error> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        match hdr {
            None => {
                writer.write_frame(ts, data, wire_len)?;
            }
            Some(hdr) => {
                let l2hlen = l2hlen.min(data.len());
                let payload = &data[l2hlen..];
                let mut buf = Vec::with_capacity(SLL_HDR_LEN + payload.len());
                buf.extend_from_slice(&hdr.to_bytes());
                buf.extend_from_slice(payload);
                let origlen = wire_len.saturating_sub(l2hlen) + SLL_HDR_LEN;
                writer.write_frame(ts, &buf, origlen)?;
            }
        }
        self.frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Number of frames written
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn flush(&self) -> Result<(), io::Error> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }
}
