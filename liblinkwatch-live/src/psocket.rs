//! AF_PACKET sockets

use crate::error::LiveError;
use crate::ring::{ring_geometry, PollResult, RingBuffer, RingSocket};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;
use tracing::{debug, warn};

const PACKET_ADD_MEMBERSHIP: libc::c_int = 1;
const PACKET_RX_RING: libc::c_int = 5;
const PACKET_STATISTICS: libc::c_int = 6;
const PACKET_COPY_THRESH: libc::c_int = 7;
const PACKET_MR_ALLMULTI: libc::c_ushort = 2;

#[repr(C)]
#[derive(Default)]
struct TpacketReq {
    tp_block_size: libc::c_uint,
    tp_block_nr: libc::c_uint,
    tp_frame_size: libc::c_uint,
    tp_frame_nr: libc::c_uint,
}

#[repr(C)]
#[derive(Default)]
struct TpacketStats {
    tp_packets: libc::c_uint,
    tp_drops: libc::c_uint,
}

#[repr(C)]
#[derive(Default)]
struct PacketMreq {
    mr_ifindex: libc::c_int,
    mr_type: libc::c_ushort,
    mr_alen: libc::c_ushort,
    mr_address: [libc::c_uchar; 8],
}

fn setsockopt<T>(fd: &OwnedFd, level: libc::c_int, name: libc::c_int, val: &T) -> io::Result<()> {
    // SAFETY: val points to a live T of the given size
    let r = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            level,
            name,
            val as *const T as *const libc::c_void,
            std::mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory effects
    let r = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if r <= 0 {
        4096
    } else {
        r as usize
    }
}

/// A raw packet socket bound to one interface (or all, for index 0)
pub struct PacketSocket {
    fd: OwnedFd,
    ifindex: i32,
}

impl PacketSocket {
    pub fn open(ifindex: u32) -> Result<PacketSocket, LiveError> {
        let ifindex = i32::try_from(ifindex)
            .map_err(|_| LiveError::Ring(format!("invalid interface index {}", ifindex)))?;
        let proto = (libc::ETH_P_ALL as u16).to_be();
        // SAFETY: plain socket(2) call, result checked
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::c_int::from(proto),
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: fd is a freshly opened descriptor we own
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        if ifindex > 0 {
            // SAFETY: sockaddr_ll is plain data
            let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
            sll.sll_family = libc::AF_PACKET as libc::c_ushort;
            sll.sll_protocol = proto;
            sll.sll_ifindex = ifindex;
            // SAFETY: sll is a valid sockaddr_ll of the given size
            let r = unsafe {
                libc::bind(
                    fd.as_raw_fd(),
                    &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
                )
            };
            if r < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(PacketSocket { fd, ifindex })
    }

    /// Configure and map a receive ring for frames of up to `max_frame` bytes
    pub fn map_rx_ring(&self, max_frame: usize, target_pages: usize) -> Result<RingBuffer, LiveError> {
        let page = page_size();
        let info = ring_geometry(page, max_frame, target_pages).ok_or_else(|| {
            LiveError::Ring(format!(
                "no ring geometry for {}b frames in {} pages",
                max_frame, target_pages
            ))
        })?;
        let req = TpacketReq {
            tp_block_size: info.block_size,
            tp_block_nr: info.block_nr,
            tp_frame_size: info.frame_size,
            tp_frame_nr: info.frame_nr,
        };
        setsockopt(&self.fd, libc::SOL_PACKET, PACKET_RX_RING, &req)?;
        let size = info.total_size();
        // SAFETY: mapping a ring set up on this socket, result checked
        let map = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd.as_raw_fd(),
                0,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        let base = NonNull::new(map as *mut u8)
            .ok_or_else(|| LiveError::Ring("mmap returned a null mapping".to_owned()))?;
        // SAFETY: the kernel mapped `size` bytes, page aligned
        let ring = unsafe { RingBuffer::from_raw(base, info, true) };
        debug!(
            "ring on {}: {} blocks of {}b, {} frames of {}b",
            self.ifindex, info.block_nr, info.block_size, info.frame_nr, info.frame_size
        );
        // the ring is unmapped on drop if the next steps fail
        let thresh: libc::c_int = 1;
        setsockopt(&self.fd, libc::SOL_PACKET, PACKET_COPY_THRESH, &thresh)?;
        let mreq = PacketMreq {
            mr_ifindex: self.ifindex,
            mr_type: PACKET_MR_ALLMULTI,
            ..PacketMreq::default()
        };
        if let Err(e) = setsockopt(&self.fd, libc::SOL_PACKET, PACKET_ADD_MEMBERSHIP, &mreq) {
            warn!("couldn't PACKET_ADD_MEMBERSHIP on {}: {}", self.ifindex, e);
            return Err(e.into());
        }
        Ok(ring)
    }
}

impl RingSocket for PacketSocket {
    fn poll(&self, timeout_ms: i32) -> io::Result<PollResult> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN | libc::POLLRDNORM | libc::POLLERR,
            revents: 0,
        };
        // SAFETY: one valid pollfd
        let r = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if r < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(PollResult::Interrupted);
            }
            return Err(e);
        }
        if r == 0 {
            return Ok(PollResult::Timeout);
        }
        if pfd.revents & libc::POLLERR != 0 {
            return Ok(PollResult::Hangup);
        }
        Ok(PollResult::Ready)
    }

    fn drops(&self) -> io::Result<u32> {
        let mut stats = TpacketStats::default();
        let mut len = std::mem::size_of::<TpacketStats>() as libc::socklen_t;
        // SAFETY: stats is a writable TpacketStats, len its size
        let r = unsafe {
            libc::getsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_PACKET,
                PACKET_STATISTICS,
                &mut stats as *mut TpacketStats as *mut libc::c_void,
                &mut len,
            )
        };
        if r < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(stats.tp_drops)
    }

    fn recv_truncated(&self, buf: &mut [u8]) -> io::Result<usize> {
        // MSG_TRUNC: the return value is the real length of the frame
        // SAFETY: buf is a valid writable buffer of buf.len() bytes
        let r = unsafe {
            libc::recvfrom(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT | libc::MSG_TRUNC,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if r < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(r as usize)
    }
}
