#[macro_use]
extern crate log;

mod context;
mod datalink;
mod dissect;
mod ethernet;
mod events;
mod hosts;
mod hwaddr;
mod interface;
mod ip;
mod irda;
mod logger;
mod neighbors;
mod packet;
mod radiotap;
mod replay;
mod resolv;
mod sll;
mod timestat;
mod transport;
mod wireless;

pub use context::ObserverContext;
pub use datalink::*;
pub use dissect::Dissector;
pub use ethernet::check_ethernet_padup;
pub use events::*;
pub use hosts::*;
pub use hwaddr::*;
pub use interface::*;
pub use ip::{prep_ipv4_header, prep_ipv6_header};
pub use logger::FrameLogger;
pub use neighbors::*;
pub use packet::PacketContext;
pub use radiotap::parse_radiotap;
pub use replay::ReplayAnalyzer;
pub use resolv::*;
pub use sll::*;
pub use timestat::TimeStat;
pub use wireless::*;

pub use liblinkwatch_tools;
