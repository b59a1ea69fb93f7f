use crate::duration::Duration;
use pcap_parser::Linktype;

/// One link-layer frame, as read from a capture file
#[derive(Debug)]
pub struct Frame<'a> {
    /// Capture interface identifier inside the file (always 0 for legacy pcap)
    pub interface: u32,
    pub ts: Duration,
    pub link_type: Linktype,
    /// Captured bytes, starting at the link-layer header
    pub data: &'a [u8],
    pub caplen: u32,
    pub origlen: u32,
    /// Index of the frame in the file, starting at 1
    pub index: usize,
}

impl Frame<'_> {
    /// True if fewer bytes were captured than were on the wire
    #[inline]
    pub fn is_truncated(&self) -> bool {
        self.caplen != self.origlen
    }
}
