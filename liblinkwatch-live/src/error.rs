use std::io;
use thiserror::Error;

/// Failures of a live component. The component must be restarted.
#[derive(Debug, Error)]
pub enum LiveError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("EOF on netlink socket")]
    Eof,
    #[error("unterminated multipart netlink message")]
    UnterminatedMultipart,
    #[error("capture ring: {0}")]
    Ring(String),
    #[error(transparent)]
    Tools(#[from] liblinkwatch_tools::Error),
}

/// Problems with a single netlink message. These are logged, and the stream
/// continues with the next message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("invalid interface index {0}")]
    UnknownInterface(i32),
    #[error("message type {0} too short ({1} bytes)")]
    Truncated(u16, usize),
    #[error("attribute {0} overflows its message")]
    AttributeOverflow(u16),
    #[error("kernel error {errno} for message {seq}")]
    Kernel { errno: i32, seq: u32 },
    #[error("unknown message type {0}")]
    UnknownType(u16),
}
