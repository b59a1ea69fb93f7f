use crate::error::Error;
use crate::frame::Frame;
use pcap_parser::Linktype;

/// Common trait for capture file consumers
pub trait FrameAnalyzer {
    /// Initialization function, called before reading data (optional)
    fn init(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Called for every capture interface declared by the file, before its frames.
    ///
    /// Legacy pcap files declare exactly one interface (`if_id` 0).
    fn handle_interface(&mut self, if_id: u32, link_type: Linktype, snaplen: u32)
        -> Result<(), Error>;

    /// Callback function for every frame containing data
    fn handle_frame(&mut self, frame: &Frame) -> Result<(), Error>;

    /// Teardown function, called after reading data (optional)
    fn teardown(&mut self) {}

    fn before_refill(&mut self) {}
}
