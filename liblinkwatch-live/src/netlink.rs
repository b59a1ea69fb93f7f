//! Routing netlink: interface, address and neighbor tables

use crate::error::{LiveError, MessageError};
use liblinkwatch::{
    handle_wireless_event, HwAddr, IfAddr, InterfaceState, MediaSettings, ObserverContext,
    ARPHRD_ETHER, ARPHRD_IEEE80211, ARPHRD_IEEE80211_PRISM, ARPHRD_IEEE80211_RADIOTAP,
    ARPHRD_LOOPBACK, WirelessSettings,
};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

pub const NLMSG_HDRLEN: usize = 16;
const NLMSG_ALIGNTO: usize = 4;
const RTA_HDRLEN: usize = 4;

pub const NLMSG_NOOP: u16 = 1;
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;

pub const RTM_NEWLINK: u16 = 16;
pub const RTM_DELLINK: u16 = 17;
pub const RTM_GETLINK: u16 = 18;
pub const RTM_NEWADDR: u16 = 20;
pub const RTM_DELADDR: u16 = 21;
pub const RTM_GETADDR: u16 = 22;
pub const RTM_NEWNEIGH: u16 = 28;
pub const RTM_DELNEIGH: u16 = 29;
pub const RTM_GETNEIGH: u16 = 30;

pub const NLM_F_REQUEST: u16 = 0x1;
pub const NLM_F_MULTI: u16 = 0x2;
pub const NLM_F_ACK: u16 = 0x4;
pub const NLM_F_DUMP: u16 = 0x300;

pub const IFLA_ADDRESS: u16 = 1;
pub const IFLA_BROADCAST: u16 = 2;
pub const IFLA_IFNAME: u16 = 3;
pub const IFLA_MTU: u16 = 4;
pub const IFLA_WIRELESS: u16 = 11;
pub const IFLA_OPERSTATE: u16 = 16;

pub const IFA_ADDRESS: u16 = 1;
pub const IFA_LOCAL: u16 = 2;

pub const NDA_DST: u16 = 1;
pub const NDA_LLADDR: u16 = 2;

pub const RTMGRP_LINK: u32 = 0x1;
pub const RTMGRP_NEIGH: u32 = 0x4;
pub const RTMGRP_IPV4_IFADDR: u32 = 0x10;
pub const RTMGRP_IPV6_IFADDR: u32 = 0x100;

const AF_INET: u8 = 2;
const AF_INET6: u8 = 10;

#[inline]
const fn nlmsg_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

fn ne_u16(b: &[u8], off: usize) -> u16 {
    u16::from_ne_bytes([b[off], b[off + 1]])
}

fn ne_u32(b: &[u8], off: usize) -> u32 {
    u32::from_ne_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

/// Fixed-size family header following the netlink header of a request
pub trait RequestBody {
    const LEN: usize;
    /// Offset of the address family byte
    const FAMILY_OFFSET: usize = 0;
}

/// `struct ifinfomsg`
pub struct IfInfoMsg;
impl RequestBody for IfInfoMsg {
    const LEN: usize = 16;
}

/// `struct ifaddrmsg`
pub struct IfAddrMsg;
impl RequestBody for IfAddrMsg {
    const LEN: usize = 8;
}

/// `struct ndmsg`
pub struct NdMsg;
impl RequestBody for NdMsg {
    const LEN: usize = 12;
}

/// Build a dump request (all families, acknowledged) for `msg_type`
pub fn dump_request<B: RequestBody>(msg_type: u16, seq: u32) -> Vec<u8> {
    let len = NLMSG_HDRLEN + B::LEN;
    let mut msg = vec![0u8; nlmsg_align(len)];
    msg[0..4].copy_from_slice(&(len as u32).to_ne_bytes());
    msg[4..6].copy_from_slice(&msg_type.to_ne_bytes());
    msg[6..8].copy_from_slice(&(NLM_F_REQUEST | NLM_F_ACK | NLM_F_DUMP).to_ne_bytes());
    msg[8..12].copy_from_slice(&seq.to_ne_bytes());
    // AF_UNSPEC
    msg[NLMSG_HDRLEN + B::FAMILY_OFFSET] = 0;
    msg
}

/// One netlink message of a received buffer
#[derive(Debug)]
pub struct Message<'a> {
    pub msg_type: u16,
    pub flags: u16,
    pub seq: u32,
    pub payload: &'a [u8],
}

/// Iterator over the messages of a buffer. Stops at the first message whose
/// length is inconsistent with the buffer.
pub struct MessageIter<'a> {
    buf: &'a [u8],
}

impl<'a> MessageIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        MessageIter { buf }
    }
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = Message<'a>;

    fn next(&mut self) -> Option<Message<'a>> {
        if self.buf.len() < NLMSG_HDRLEN {
            return None;
        }
        let len = ne_u32(self.buf, 0) as usize;
        if len < NLMSG_HDRLEN || len > self.buf.len() {
            if !self.buf.is_empty() {
                debug!("netlink: {} trailing bytes", self.buf.len());
            }
            self.buf = &[];
            return None;
        }
        let msg = Message {
            msg_type: ne_u16(self.buf, 4),
            flags: ne_u16(self.buf, 6),
            seq: ne_u32(self.buf, 8),
            payload: &self.buf[NLMSG_HDRLEN..len],
        };
        let next = std::cmp::min(nlmsg_align(len), self.buf.len());
        self.buf = &self.buf[next..];
        Some(msg)
    }
}

/// Iterator over routing attributes (`struct rtattr` records)
pub struct Attributes<'a> {
    buf: &'a [u8],
}

impl<'a> Attributes<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Attributes { buf }
    }
}

impl<'a> Iterator for Attributes<'a> {
    type Item = Result<(u16, &'a [u8]), MessageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < RTA_HDRLEN {
            return None;
        }
        let len = usize::from(ne_u16(self.buf, 0));
        let rta_type = ne_u16(self.buf, 2);
        if len < RTA_HDRLEN || len > self.buf.len() {
            self.buf = &[];
            return Some(Err(MessageError::AttributeOverflow(rta_type)));
        }
        let data = &self.buf[RTA_HDRLEN..len];
        let next = std::cmp::min(nlmsg_align(len), self.buf.len());
        self.buf = &self.buf[next..];
        Some(Ok((rta_type, data)))
    }
}

fn ip_from_bytes(family: u8, b: &[u8]) -> Option<IpAddr> {
    match (family, b.len()) {
        (AF_INET, 4) => Some(IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3]))),
        (AF_INET6, 16) => {
            let mut a = [0u8; 16];
            a.copy_from_slice(b);
            Some(IpAddr::V6(Ipv6Addr::from(a)))
        }
        _ => None,
    }
}

fn c_string(b: &[u8]) -> String {
    let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
    String::from_utf8_lossy(&b[..end]).into_owned()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MultipartState {
    Idle,
    InMultipart,
}

/// Source of netlink datagrams
pub trait NetlinkSource {
    /// Non-blocking receive: `Ok(None)` if no data is available, `Ok(Some(0))`
    /// on EOF.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;
}

/// Applies routing netlink messages to the interface table
pub struct ControlPlane {
    ctx: Arc<ObserverContext>,
    state: MultipartState,
    buf: Vec<u8>,
}

impl ControlPlane {
    pub fn new(ctx: Arc<ObserverContext>) -> Self {
        ControlPlane {
            ctx,
            state: MultipartState::Idle,
            buf: vec![0u8; 32 * 1024],
        }
    }

    pub fn state(&self) -> MultipartState {
        self.state
    }

    /// Read all available messages, returning how many were applied
    pub fn pump<S: NetlinkSource>(&mut self, sock: &mut S) -> Result<usize, LiveError> {
        let mut count = 0;
        loop {
            let mut buf = std::mem::take(&mut self.buf);
            let res = match sock.recv(&mut buf) {
                Ok(Some(0)) => Err(LiveError::Eof),
                Ok(Some(n)) => {
                    count += self.handle_buffer(&buf[..n]);
                    Ok(true)
                }
                Ok(None) => Ok(false),
                Err(e) => Err(LiveError::Io(e)),
            };
            self.buf = buf;
            match res {
                Ok(true) => (),
                Ok(false) => return Ok(count),
                Err(e) => {
                    self.state = MultipartState::Idle;
                    return Err(e);
                }
            }
        }
    }

    /// End of a read: a multipart response still open is an error, and the
    /// dump must be requested again.
    pub fn finish_read(&mut self) -> Result<(), LiveError> {
        if self.state == MultipartState::InMultipart {
            warn!("unterminated multipart netlink response");
            self.state = MultipartState::Idle;
            return Err(LiveError::UnterminatedMultipart);
        }
        Ok(())
    }

    /// Read all available messages, then check that no response is left open
    pub fn drain<S: NetlinkSource>(&mut self, sock: &mut S) -> Result<usize, LiveError> {
        let count = self.pump(sock)?;
        self.finish_read()?;
        Ok(count)
    }

    /// Handle the messages of one datagram, returning how many were applied
    pub fn handle_buffer(&mut self, buf: &[u8]) -> usize {
        let mut count = 0;
        for msg in MessageIter::new(buf) {
            match self.handle_message(&msg) {
                Ok(()) => count += 1,
                Err(e) => warn!("netlink message type {}: {}", msg.msg_type, e),
            }
        }
        count
    }

    pub fn handle_message(&mut self, msg: &Message) -> Result<(), MessageError> {
        if msg.flags & NLM_F_MULTI != 0 {
            self.state = MultipartState::InMultipart;
        }
        match msg.msg_type {
            RTM_NEWLINK => self.handle_newlink(msg.payload),
            RTM_DELLINK => self.handle_dellink(msg.payload),
            RTM_NEWADDR => self.handle_addr(msg.payload, true),
            RTM_DELADDR => self.handle_addr(msg.payload, false),
            RTM_NEWNEIGH => self.handle_newneigh(msg.payload),
            RTM_DELNEIGH => self.handle_delneigh(msg.payload),
            NLMSG_DONE => {
                if self.state != MultipartState::InMultipart {
                    debug!("netlink DONE outside multipart");
                }
                self.state = MultipartState::Idle;
                Ok(())
            }
            NLMSG_ERROR => {
                if msg.payload.len() < 4 + NLMSG_HDRLEN {
                    return Err(MessageError::Truncated(NLMSG_ERROR, msg.payload.len()));
                }
                let errno = ne_u32(msg.payload, 0) as i32;
                let seq = ne_u32(msg.payload, 4 + 8);
                if errno == 0 {
                    trace!("netlink ACK for message {}", seq);
                    Ok(())
                } else {
                    Err(MessageError::Kernel { errno: -errno, seq })
                }
            }
            NLMSG_NOOP => Ok(()),
            t => Err(MessageError::UnknownType(t)),
        }
    }

    fn handle_newlink(&mut self, payload: &[u8]) -> Result<(), MessageError> {
        if payload.len() < IfInfoMsg::LEN {
            return Err(MessageError::Truncated(RTM_NEWLINK, payload.len()));
        }
        let arptype = ne_u16(payload, 2);
        let index = ne_u32(payload, 4) as i32;
        let flags = ne_u32(payload, 8);
        if index <= 0 {
            return Err(MessageError::UnknownInterface(index));
        }
        let (iface, created) = self.ctx.interfaces.get_or_create(index as u32);
        let mut state = iface.lock();
        state.link.arptype = arptype;
        state.link.flags = flags;
        match arptype {
            ARPHRD_ETHER | ARPHRD_LOOPBACK => {
                if state.settings == MediaSettings::Unknown {
                    state.settings = MediaSettings::Wired;
                }
            }
            ARPHRD_IEEE80211 | ARPHRD_IEEE80211_PRISM | ARPHRD_IEEE80211_RADIOTAP => {
                if !matches!(state.settings, MediaSettings::Wireless(_)) {
                    state.settings = MediaSettings::Wireless(WirelessSettings::default());
                }
            }
            _ => (),
        }
        for attr in Attributes::new(&payload[IfInfoMsg::LEN..]) {
            let (rta_type, data) = attr?;
            self.apply_link_attribute(&mut state, rta_type, data)?;
        }
        debug!(
            "link {} ({}) type {} mtu {} flags {:#x}",
            index, state.link.name, arptype, state.link.mtu, flags
        );
        if created {
            self.ctx.events().interface_added(&state.link);
        }
        Ok(())
    }

    fn apply_link_attribute(
        &self,
        state: &mut InterfaceState,
        rta_type: u16,
        data: &[u8],
    ) -> Result<(), MessageError> {
        match rta_type {
            IFLA_ADDRESS => {
                let addr = HwAddr::new(data).ok_or(MessageError::AttributeOverflow(rta_type))?;
                state.set_hwaddr(addr);
            }
            IFLA_BROADCAST => {
                state.link.bcast = HwAddr::new(data);
            }
            IFLA_IFNAME => {
                state.link.name = c_string(data);
            }
            IFLA_MTU => {
                if data.len() != 4 {
                    return Err(MessageError::AttributeOverflow(rta_type));
                }
                state.link.mtu = ne_u32(data, 0);
            }
            IFLA_OPERSTATE => {
                if let Some(&op) = data.first() {
                    state.link.operstate = op;
                }
            }
            IFLA_WIRELESS => {
                handle_wireless_event(state, data, self.ctx.events());
            }
            // link, qdisc, stats and other attributes we do not track
            5..=10 | 12..=15 | 17..=60 => (),
            _ => debug!("{}: unknown link attribute {}", state.link.name, rta_type),
        }
        Ok(())
    }

    fn handle_dellink(&mut self, payload: &[u8]) -> Result<(), MessageError> {
        if payload.len() < IfInfoMsg::LEN {
            return Err(MessageError::Truncated(RTM_DELLINK, payload.len()));
        }
        let index = ne_u32(payload, 4) as i32;
        let iface = if index > 0 {
            self.ctx.interfaces.remove(index as u32)
        } else {
            None
        };
        let iface = iface.ok_or(MessageError::UnknownInterface(index))?;
        let state = iface.lock();
        info!("link {} ({}) was removed", index, state.link.name);
        self.ctx.resolution.forget_interface(index as u32);
        self.ctx.events().interface_removed(&state.link);
        Ok(())
    }

    fn handle_addr(&mut self, payload: &[u8], add: bool) -> Result<(), MessageError> {
        let msg_type = if add { RTM_NEWADDR } else { RTM_DELADDR };
        if payload.len() < IfAddrMsg::LEN {
            return Err(MessageError::Truncated(msg_type, payload.len()));
        }
        let family = payload[0];
        let prefix_len = payload[1];
        let index = ne_u32(payload, 4) as i32;
        let iface = (index > 0)
            .then(|| self.ctx.interfaces.get(index as u32))
            .flatten()
            .ok_or(MessageError::UnknownInterface(index))?;
        let mut local = None;
        let mut address = None;
        for attr in Attributes::new(&payload[IfAddrMsg::LEN..]) {
            match attr? {
                (IFA_LOCAL, data) => local = ip_from_bytes(family, data),
                (IFA_ADDRESS, data) => address = ip_from_bytes(family, data),
                _ => (),
            }
        }
        // IFA_LOCAL is the local address on point-to-point links
        let addr = match local.or(address) {
            Some(a) => a,
            None => return Ok(()),
        };
        let ifaddr = IfAddr { addr, prefix_len };
        let mut state = iface.lock();
        if add {
            debug!("{}: address {}/{}", state.link.name, addr, prefix_len);
            state.add_address(ifaddr);
        } else {
            debug!("{}: address {}/{} removed", state.link.name, addr, prefix_len);
            state.remove_address(&ifaddr);
        }
        Ok(())
    }

    fn parse_neigh<'p>(
        &self,
        payload: &'p [u8],
        msg_type: u16,
    ) -> Result<(i32, Option<IpAddr>, Option<&'p [u8]>), MessageError> {
        if payload.len() < NdMsg::LEN {
            return Err(MessageError::Truncated(msg_type, payload.len()));
        }
        let family = payload[0];
        let index = ne_u32(payload, 4) as i32;
        let mut dst = None;
        let mut lladdr = None;
        for attr in Attributes::new(&payload[NdMsg::LEN..]) {
            match attr? {
                (NDA_DST, data) => dst = ip_from_bytes(family, data),
                (NDA_LLADDR, data) => lladdr = Some(data),
                _ => (),
            }
        }
        Ok((index, dst, lladdr))
    }

    fn handle_newneigh(&mut self, payload: &[u8]) -> Result<(), MessageError> {
        let (index, dst, lladdr) = self.parse_neigh(payload, RTM_NEWNEIGH)?;
        let iface = (index > 0)
            .then(|| self.ctx.interfaces.get(index as u32))
            .flatten()
            .ok_or(MessageError::UnknownInterface(index))?;
        // incomplete entries carry no hardware address
        let (ip, lladdr) = match (dst, lladdr) {
            (Some(ip), Some(ll)) if !ll.is_empty() => (ip, ll),
            _ => return Ok(()),
        };
        let mut guard = iface.lock();
        let state = &mut *guard;
        let link = &state.link;
        let neighbors = &mut state.neighbors;
        let events = self.ctx.events();
        if let Some(hw) = neighbors.lookup_or_create(link, lladdr, Some(ip), self.ctx.vendors(), events) {
            neighbors.name_local(link, &hw, ip, events);
            trace!("{}: kernel neighbor {} is {}", link.name, hw, ip);
        }
        Ok(())
    }

    fn handle_delneigh(&mut self, payload: &[u8]) -> Result<(), MessageError> {
        let (index, dst, _) = self.parse_neigh(payload, RTM_DELNEIGH)?;
        let iface = (index > 0)
            .then(|| self.ctx.interfaces.get(index as u32))
            .flatten()
            .ok_or(MessageError::UnknownInterface(index))?;
        let state = iface.lock();
        debug!("{}: kernel neighbor {:?} deleted", state.link.name, dst);
        Ok(())
    }
}

/// A NETLINK_ROUTE socket subscribed to link, address and neighbor changes
pub struct NetlinkSocket {
    fd: OwnedFd,
    seq: u32,
}

impl NetlinkSocket {
    pub fn open() -> Result<NetlinkSocket, LiveError> {
        // SAFETY: plain socket(2) call, result checked
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_ROUTE,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: fd is a freshly opened descriptor we own
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        // SAFETY: sockaddr_nl is plain data
        let mut sa: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        sa.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        sa.nl_groups = RTMGRP_LINK | RTMGRP_NEIGH | RTMGRP_IPV4_IFADDR | RTMGRP_IPV6_IFADDR;
        // SAFETY: sa is a valid sockaddr_nl of the given size
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &sa as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(NetlinkSocket { fd, seq: 1 })
    }

    /// Request a dump of a kernel table
    pub fn request_dump<B: RequestBody>(&mut self, msg_type: u16) -> Result<(), LiveError> {
        let msg = dump_request::<B>(msg_type, self.seq);
        self.seq = self.seq.wrapping_add(1);
        // SAFETY: msg is a valid buffer of msg.len() bytes
        let r = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                0,
            )
        };
        if r < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Wait until data is available, for at most `timeout_ms`
    pub fn poll(&self, timeout_ms: i32) -> Result<bool, LiveError> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: one valid pollfd
        let r = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if r < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(e.into());
        }
        Ok(r > 0)
    }
}

impl NetlinkSource for NetlinkSocket {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        // SAFETY: buf is a valid writable buffer of buf.len() bytes
        let r = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if r < 0 {
            let e = io::Error::last_os_error();
            return match e.kind() {
                io::ErrorKind::WouldBlock => Ok(None),
                io::ErrorKind::Interrupted => Ok(None),
                _ => Err(e),
            };
        }
        Ok(Some(r as usize))
    }
}

/// Dump the link, address and neighbor tables, one after the other
pub fn discover(sock: &mut NetlinkSocket, cp: &mut ControlPlane, timeout_ms: i32) -> Result<(), LiveError> {
    let dumps: [(u16, fn(&mut NetlinkSocket, u16) -> Result<(), LiveError>); 3] = [
        (RTM_GETLINK, NetlinkSocket::request_dump::<IfInfoMsg>),
        (RTM_GETADDR, NetlinkSocket::request_dump::<IfAddrMsg>),
        (RTM_GETNEIGH, NetlinkSocket::request_dump::<NdMsg>),
    ];
    for (msg_type, request) in dumps {
        // the kernel answers one dump at a time
        request(sock, msg_type)?;
        while sock.poll(timeout_ms)? {
            cp.pump(sock)?;
            if cp.state() == MultipartState::Idle {
                break;
            }
        }
        cp.finish_read()?;
    }
    Ok(())
}
