use crate::duration::Duration;
use pcap_parser::{LegacyPcapBlock, Linktype, ToVec};
use std::io::{self, Error, ErrorKind, Write};

/// Writer for the legacy pcap format
pub struct PcapWriter<W>
where
    W: Write,
{
    w: W,
}

impl<W: Write> PcapWriter<W> {
    pub fn new(w: W) -> Self {
        PcapWriter { w }
    }

    /// Write the file header
    pub fn init_file(&mut self, snaplen: usize, linktype: Linktype) -> Result<usize, io::Error> {
        let mut hdr = pcap_parser::PcapHeader::new();
        hdr.snaplen = snaplen as u32;
        hdr.network = linktype;
        let s = hdr
            .to_vec()
            .map_err(|_| Error::new(ErrorKind::Other, "Pcap header serialization failed"))?;
        self.w.write_all(&s)?;
        Ok(s.len())
    }

    /// Write one record. `origlen` is the on-wire length, which may exceed `data.len()`.
    pub fn write_frame(&mut self, ts: Duration, data: &[u8], origlen: usize) -> Result<usize, io::Error> {
        let record = LegacyPcapBlock {
            ts_sec: ts.secs,
            ts_usec: ts.micros,
            caplen: data.len() as u32,
            origlen: std::cmp::max(origlen, data.len()) as u32,
            data,
        };
        let s = record
            .to_vec_raw()
            .map_err(|_| Error::new(ErrorKind::Other, "Pcap block serialization failed"))?;
        self.w.write_all(&s)?;
        Ok(s.len())
    }

    pub fn flush(&mut self) -> Result<(), io::Error> {
        self.w.flush()
    }

    pub fn into_inner(self) -> W {
        self.w
    }
}
