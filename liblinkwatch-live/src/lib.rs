//! Live observation on Linux: the routing netlink control plane, packet
//! rings, and resolver configuration watching.

mod engine;
mod error;
pub mod netlink;
pub mod psocket;
pub mod ring;
pub mod watch;

pub use engine::LiveEngine;
pub use error::{LiveError, MessageError};
