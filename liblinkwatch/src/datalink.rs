use crate::interface::{ARPHRD_ETHER, ARPHRD_IEEE80211_RADIOTAP, ARPHRD_IRDA, ARPHRD_LOOPBACK};
use liblinkwatch_tools::Linktype;

pub const LINKTYPE_ETHERNET: i32 = 1;
pub const LINKTYPE_LINUX_SLL: i32 = 113;
pub const LINKTYPE_IEEE802_11_RADIOTAP: i32 = 127;
pub const LINKTYPE_LINUX_IRDA: i32 = 144;

/// Supported link-layer framings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Datalink {
    Ethernet,
    /// radiotap header followed by an IEEE 802.11 frame
    Radiotap,
    /// Linux IrDA pseudo-header followed by IrLAP
    Irda,
    /// IrLAP frames without pseudo-header (live IrDA sockets)
    IrLap,
    /// Linux "cooked" capture header
    LinuxCooked,
}

impl Datalink {
    pub fn from_linktype(linktype: Linktype) -> Option<Datalink> {
        match linktype.0 {
            LINKTYPE_ETHERNET => Some(Datalink::Ethernet),
            LINKTYPE_IEEE802_11_RADIOTAP => Some(Datalink::Radiotap),
            LINKTYPE_LINUX_IRDA => Some(Datalink::Irda),
            LINKTYPE_LINUX_SLL => Some(Datalink::LinuxCooked),
            _ => None,
        }
    }

    /// Datalink of frames read from a live interface of this media type
    pub fn from_arptype(arptype: u16) -> Option<Datalink> {
        match arptype {
            ARPHRD_ETHER | ARPHRD_LOOPBACK => Some(Datalink::Ethernet),
            ARPHRD_IEEE80211_RADIOTAP => Some(Datalink::Radiotap),
            ARPHRD_IRDA => Some(Datalink::IrLap),
            _ => None,
        }
    }

    pub fn linktype(self) -> Linktype {
        match self {
            Datalink::Ethernet => Linktype(LINKTYPE_ETHERNET),
            Datalink::Radiotap => Linktype(LINKTYPE_IEEE802_11_RADIOTAP),
            Datalink::Irda | Datalink::IrLap => Linktype(LINKTYPE_LINUX_IRDA),
            Datalink::LinuxCooked => Linktype(LINKTYPE_LINUX_SLL),
        }
    }

    /// Addressing of a capture file interface: hardware address width and
    /// media type. Cooked captures carry their own addressing in each frame.
    pub fn file_addressing(self) -> Option<(usize, u16)> {
        match self {
            Datalink::Ethernet => Some((6, ARPHRD_ETHER)),
            Datalink::Radiotap => Some((6, ARPHRD_IEEE80211_RADIOTAP)),
            Datalink::Irda | Datalink::IrLap => Some((4, ARPHRD_IRDA)),
            Datalink::LinuxCooked => None,
        }
    }
}
