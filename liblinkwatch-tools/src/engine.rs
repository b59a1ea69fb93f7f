use crate::analyzer::FrameAnalyzer;
use crate::config::Config;
use crate::duration::{Duration, MICROS_PER_SEC};
use crate::error::Error;
use crate::frame::Frame;
use pcap_parser::{Block, Linktype, PcapBlockOwned, PcapError};
use std::io::Read;

#[derive(Clone, Copy)]
struct InterfaceInfo {
    link_type: Linktype,
    nanosecond: bool,
}

/// Capture file (pcap or pcap-ng) reader engine
///
/// `CaptureFileEngine` iterates over a capture input, abstracts the format
/// (legacy pcap or pcap-ng, timestamp precision, block padding) and calls its
/// `FrameAnalyzer` for every declared interface and every frame.
///
/// Timestamps of pcap-ng enhanced packets are read as microseconds.
///
/// ## example
///
/// ```
/// use liblinkwatch_tools::{CaptureFileEngine, Config, Error, Frame, FrameAnalyzer, Linktype};
/// #[derive(Default)]
/// pub struct CountingAnalyzer {
///     frames: usize,
/// }
///
/// impl FrameAnalyzer for CountingAnalyzer {
///     fn handle_interface(&mut self, _id: u32, _lt: Linktype, _snaplen: u32) -> Result<(), Error> {
///         Ok(())
///     }
///     fn handle_frame(&mut self, _frame: &Frame) -> Result<(), Error> {
///         self.frames += 1;
///         Ok(())
///     }
/// }
///
/// let config = Config::default();
/// let mut engine = CaptureFileEngine::new(CountingAnalyzer::default(), &config);
///
/// // `engine.run()` can take any `mut Read` as input
/// use std::io::Cursor;
/// let mut input = Cursor::new(vec![1, 2, 3, 4, 5]);
/// let res = engine.run(&mut input);
/// assert!(res.is_err());
/// ```
pub struct CaptureFileEngine<A: FrameAnalyzer> {
    analyzer: A,
    capacity: usize,

    interfaces: Vec<InterfaceInfo>,
    frame_index: usize,
}

impl<A: FrameAnalyzer> CaptureFileEngine<A> {
    pub fn new(analyzer: A, config: &Config) -> Self {
        let capacity = config
            .get_usize("buffer_initial_capacity")
            .unwrap_or(128 * 1024);
        CaptureFileEngine {
            analyzer,
            capacity,
            interfaces: Vec::new(),
            frame_index: 0,
        }
    }

    pub fn analyzer(&self) -> &A {
        &self.analyzer
    }

    pub fn analyzer_mut(&mut self) -> &mut A {
        &mut self.analyzer
    }

    pub fn into_analyzer(self) -> A {
        self.analyzer
    }

    /// Main function: given a reader, read all capture data and call analyzer for each frame
    pub fn run(&mut self, reader: &mut (dyn Read + Send)) -> Result<(), Error> {
        let mut reader = pcap_parser::create_reader(self.capacity, reader)?;

        self.analyzer.init()?;
        self.interfaces.clear();
        self.frame_index = 0;
        let mut block_index = 0usize;
        let mut last_incomplete_index = None;

        loop {
            match reader.next() {
                Ok((offset, block)) => {
                    self.handle_block(&block)?;
                    block_index += 1;
                    reader.consume_noshift(offset);
                    continue;
                }
                Err(PcapError::Eof) => break,
                Err(PcapError::Incomplete { .. }) => {
                    if last_incomplete_index == Some(block_index) {
                        warn!(
                            "Could not read complete data block (block_index={})",
                            block_index
                        );
                        warn!(
                            "  Buffer: consumed={} position={}",
                            reader.consumed(),
                            reader.position()
                        );
                        warn!("Hint: the reader buffer size may be too small, or the input file may be truncated.");
                        break;
                    }
                    last_incomplete_index = Some(block_index);
                    debug!("need refill");
                    self.analyzer.before_refill();
                    reader.refill().map_err(|e| e.to_owned_vec())?;
                    continue;
                }
                Err(e) => {
                    let e = e.to_owned_vec();
                    error!("error while reading: {:?}", e);
                    error!(
                        "  Buffer: consumed={} position={}",
                        reader.consumed(),
                        reader.position()
                    );
                    return Err(Error::Pcap(e));
                }
            }
        }

        self.analyzer.teardown();
        Ok(())
    }

    fn handle_block(&mut self, block: &PcapBlockOwned) -> Result<(), Error> {
        let frame = match block {
            PcapBlockOwned::LegacyHeader(ref hdr) => {
                let info = InterfaceInfo {
                    link_type: hdr.network,
                    nanosecond: hdr.is_nanosecond_precision(),
                };
                self.interfaces = vec![info];
                trace!("Legacy pcap, link type: {}", hdr.network);
                return self.analyzer.handle_interface(0, hdr.network, hdr.snaplen);
            }
            PcapBlockOwned::Legacy(ref b) => {
                let info = self
                    .interfaces
                    .first()
                    .copied()
                    .ok_or(Error::Generic("Frame before capture file header"))?;
                let micros = if info.nanosecond {
                    b.ts_usec / 1000
                } else {
                    b.ts_usec
                };
                self.frame_index += 1;
                Frame {
                    interface: 0,
                    ts: Duration::new(b.ts_sec, micros),
                    link_type: info.link_type,
                    data: clamp(b.data, b.caplen),
                    caplen: b.caplen,
                    origlen: b.origlen,
                    index: self.frame_index,
                }
            }
            PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                // interface identifiers are scoped to their section
                self.interfaces.clear();
                return Ok(());
            }
            PcapBlockOwned::NG(Block::InterfaceDescription(ref idb)) => {
                let if_id = self.interfaces.len() as u32;
                self.interfaces.push(InterfaceInfo {
                    link_type: idb.linktype,
                    nanosecond: false,
                });
                trace!("pcap-ng interface {}, link type: {}", if_id, idb.linktype);
                return self
                    .analyzer
                    .handle_interface(if_id, idb.linktype, idb.snaplen);
            }
            PcapBlockOwned::NG(Block::EnhancedPacket(ref epb)) => {
                let info = self
                    .interfaces
                    .get(epb.if_id as usize)
                    .copied()
                    .ok_or(Error::Generic("Enhanced packet references unknown interface"))?;
                let ts = (u64::from(epb.ts_high) << 32) | u64::from(epb.ts_low);
                let secs = (ts / u64::from(MICROS_PER_SEC)) as u32;
                let micros = (ts % u64::from(MICROS_PER_SEC)) as u32;
                self.frame_index += 1;
                Frame {
                    interface: epb.if_id,
                    ts: Duration::new(secs, micros),
                    link_type: info.link_type,
                    data: clamp(epb.data, epb.caplen),
                    caplen: epb.caplen,
                    origlen: epb.origlen,
                    index: self.frame_index,
                }
            }
            PcapBlockOwned::NG(_) => {
                trace!("ignoring pcap-ng block");
                return Ok(());
            }
        };
        trace!(
            "frame {}: time {}.{:06}, caplen {}, origlen {}",
            frame.index,
            frame.ts.secs,
            frame.ts.micros,
            frame.caplen,
            frame.origlen
        );
        self.analyzer.handle_frame(&frame)
    }
}

/// Remove block padding, never reading past the captured bytes
fn clamp(data: &[u8], caplen: u32) -> &[u8] {
    let len = std::cmp::min(data.len(), caplen as usize);
    &data[..len]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::PcapWriter;

    #[derive(Default)]
    struct Recorder {
        interfaces: Vec<(u32, Linktype, u32)>,
        frames: Vec<(Duration, Vec<u8>, bool)>,
        torn_down: bool,
    }

    impl FrameAnalyzer for Recorder {
        fn handle_interface(&mut self, id: u32, lt: Linktype, snaplen: u32) -> Result<(), Error> {
            self.interfaces.push((id, lt, snaplen));
            Ok(())
        }
        fn handle_frame(&mut self, frame: &Frame) -> Result<(), Error> {
            self.frames
                .push((frame.ts, frame.data.to_vec(), frame.is_truncated()));
            Ok(())
        }
        fn teardown(&mut self) {
            self.torn_down = true;
        }
    }

    #[test]
    fn engine_reads_legacy_file() {
        let mut out = Vec::new();
        {
            let mut w = PcapWriter::new(&mut out);
            w.init_file(65535, Linktype::ETHERNET).unwrap();
            w.write_frame(Duration::new(10, 20), &[1, 2, 3], 3).unwrap();
            w.write_frame(Duration::new(11, 0), &[4, 5], 60).unwrap();
        }
        let mut engine = CaptureFileEngine::new(Recorder::default(), &Config::default());
        engine.run(&mut out.as_slice()).unwrap();
        let rec = engine.into_analyzer();
        assert!(rec.torn_down);
        assert_eq!(rec.interfaces, vec![(0, Linktype::ETHERNET, 65535)]);
        assert_eq!(rec.frames.len(), 2);
        assert_eq!(rec.frames[0], (Duration::new(10, 20), vec![1, 2, 3], false));
        assert_eq!(rec.frames[1].1, vec![4, 5]);
        assert!(rec.frames[1].2);
    }

    #[test]
    fn engine_rejects_garbage() {
        let mut engine = CaptureFileEngine::new(Recorder::default(), &Config::default());
        let input = [0u8; 64];
        assert!(engine.run(&mut &input[..]).is_err());
    }
}
