#[macro_use]
extern crate log;

mod analyzer;
mod config;
mod duration;
mod engine;
mod error;
mod frame;
mod writer;

pub use analyzer::*;
pub use config::Config;
pub use duration::{Duration, MICROS_PER_SEC};
pub use engine::*;
pub use error::*;
pub use frame::*;
pub use writer::PcapWriter;

pub use pcap_parser;
pub use pcap_parser::Linktype;
