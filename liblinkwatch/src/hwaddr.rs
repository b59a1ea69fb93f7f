use pnet_base::MacAddr;
use serde::{Serialize, Serializer};
use std::fmt;

/// Longest hardware address we track
pub const MAX_HWADDR_LEN: usize = 8;

/// A hardware (link-layer) address of up to `MAX_HWADDR_LEN` bytes
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HwAddr {
    len: u8,
    bytes: [u8; MAX_HWADDR_LEN],
}

impl HwAddr {
    /// Build an address from raw bytes. Returns `None` if the input is too long.
    pub fn new(addr: &[u8]) -> Option<HwAddr> {
        if addr.len() > MAX_HWADDR_LEN {
            return None;
        }
        let mut bytes = [0u8; MAX_HWADDR_LEN];
        bytes[..addr.len()].copy_from_slice(addr);
        Some(HwAddr {
            len: addr.len() as u8,
            bytes,
        })
    }

    /// An address of `len` bytes, all set to 0xff
    pub fn broadcast(len: usize) -> HwAddr {
        let len = std::cmp::min(len, MAX_HWADDR_LEN);
        let mut bytes = [0u8; MAX_HWADDR_LEN];
        bytes[..len].fill(0xff);
        HwAddr {
            len: len as u8,
            bytes,
        }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Group bit of the first octet (IEEE 802 multicast)
    #[inline]
    pub fn is_multicast(&self) -> bool {
        self.len > 0 && self.bytes[0] & 0x01 != 0
    }

    /// Organizationally unique identifier, for addresses of at least 3 bytes
    pub fn oui(&self) -> Option<[u8; 3]> {
        if self.len < 3 {
            return None;
        }
        Some([self.bytes[0], self.bytes[1], self.bytes[2]])
    }
}

impl From<MacAddr> for HwAddr {
    fn from(m: MacAddr) -> HwAddr {
        let mut bytes = [0u8; MAX_HWADDR_LEN];
        bytes[..6].copy_from_slice(&m.octets());
        HwAddr { len: 6, bytes }
    }
}

impl fmt::Display for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, b) in self.as_bytes().iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "HwAddr({})", self)
    }
}

impl Serialize for HwAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hwaddr_format() {
        let a = HwAddr::new(&[0x00, 0x1b, 0x21, 0xaa, 0x0b, 0xff]).unwrap();
        assert_eq!(a.to_string(), "00:1b:21:aa:0b:ff");
        assert_eq!(a.oui(), Some([0x00, 0x1b, 0x21]));
        assert!(!a.is_multicast());
        assert_eq!(HwAddr::broadcast(4).to_string(), "ff:ff:ff:ff");
        let m = HwAddr::from(MacAddr(0x01, 0x00, 0x5e, 0, 0, 0xfb));
        assert!(m.is_multicast());
        assert_eq!(m.len(), 6);
    }

    #[test]
    fn hwaddr_too_long() {
        assert!(HwAddr::new(&[0; 9]).is_none());
        assert!(HwAddr::new(&[]).unwrap().is_empty());
    }
}
