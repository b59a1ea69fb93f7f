use pcap_parser::PcapError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Generic(&'static str),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("capture file error: {0:?}")]
    Pcap(PcapError<&'static [u8]>),
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<&'static str> for Error {
    fn from(s: &'static str) -> Self {
        Error::Generic(s)
    }
}

impl<'a> From<PcapError<&'a [u8]>> for Error {
    fn from(e: PcapError<&'a [u8]>) -> Self {
        Error::Pcap(e.to_owned_vec())
    }
}
