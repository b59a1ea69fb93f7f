//! Resolver configuration hot reload (inotify)

use crate::error::LiveError;
use liblinkwatch::ObserverContext;
use std::ffi::{CString, OsStr};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const IN_CLOSE_WRITE: u32 = 0x0000_0008;
pub const IN_MOVED_TO: u32 = 0x0000_0080;
pub const IN_CREATE: u32 = 0x0000_0100;
pub const IN_DELETE: u32 = 0x0000_0200;

const WATCH_MASK: u32 = IN_CLOSE_WRITE | IN_MOVED_TO | IN_CREATE | IN_DELETE;
// wd, mask, cookie, len
const EVENT_HDRLEN: usize = 16;

/// True if the buffer of `struct inotify_event` records holds a change of
/// the file `name`. The watch is on the parent directory, since the file is
/// usually replaced rather than rewritten.
pub fn touches(buf: &[u8], name: &OsStr) -> bool {
    let mut rem = buf;
    let mut found = false;
    while rem.len() >= EVENT_HDRLEN {
        let mask = u32::from_ne_bytes([rem[4], rem[5], rem[6], rem[7]]);
        let len = u32::from_ne_bytes([rem[12], rem[13], rem[14], rem[15]]) as usize;
        let end = match EVENT_HDRLEN.checked_add(len) {
            Some(e) if e <= rem.len() => e,
            _ => break,
        };
        let raw = &rem[EVENT_HDRLEN..end];
        let nlen = raw.iter().position(|&c| c == 0).unwrap_or(raw.len());
        if mask & WATCH_MASK != 0 && &raw[..nlen] == name.as_bytes() {
            found = true;
        }
        rem = &rem[end..];
    }
    found
}

/// Watches the directory of a file for changes to that file
pub struct FileWatcher {
    fd: OwnedFd,
    path: PathBuf,
    buf: Vec<u8>,
}

impl FileWatcher {
    pub fn open(path: &Path) -> Result<FileWatcher, LiveError> {
        let dir = match path.parent() {
            Some(d) if !d.as_os_str().is_empty() => d,
            _ => Path::new("."),
        };
        if path.file_name().is_none() {
            return Err(LiveError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "watched path has no file name",
            )));
        }
        let cdir = CString::new(dir.as_os_str().as_bytes())
            .map_err(|e| LiveError::Io(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        // SAFETY: plain inotify_init1 call, result checked
        let fd = unsafe { libc::inotify_init1(libc::IN_CLOEXEC | libc::IN_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: fd is a freshly opened descriptor we own
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        // SAFETY: cdir is a valid NUL-terminated string
        let wd = unsafe { libc::inotify_add_watch(fd.as_raw_fd(), cdir.as_ptr(), WATCH_MASK) };
        if wd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        debug!("watching {} for changes", path.display());
        Ok(FileWatcher {
            fd,
            path: path.to_path_buf(),
            buf: vec![0u8; 4096],
        })
    }

    /// Wait up to `timeout_ms` for a change. Returns true if the file changed.
    pub fn wait(&mut self, timeout_ms: i32) -> Result<bool, LiveError> {
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
        if r == 0 {
            return Ok(false);
        }
        let name = self.path.file_name().unwrap_or_default();
        let mut changed = false;
        loop {
            // SAFETY: buf is a valid writable buffer of buf.len() bytes
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    self.buf.as_mut_ptr() as *mut libc::c_void,
                    self.buf.len(),
                )
            };
            if n < 0 {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::WouldBlock {
                    break;
                }
                return Err(e.into());
            }
            if n == 0 {
                break;
            }
            changed |= touches(&self.buf[..n as usize], name);
        }
        Ok(changed)
    }
}

/// Reload the resolver list each time its file changes, until `stop` is set
pub fn watch_resolvers(
    ctx: Arc<ObserverContext>,
    stop: Arc<AtomicBool>,
    timeout_ms: i32,
) -> Result<(), LiveError> {
    let path = match ctx.resolver_conf() {
        Some(p) => p.to_path_buf(),
        None => return Ok(()),
    };
    let mut watcher = FileWatcher::open(&path)?;
    while !stop.load(Ordering::SeqCst) {
        if !watcher.wait(timeout_ms)? {
            continue;
        }
        match ctx.reload_resolvers() {
            Ok(n) => info!("reloaded {} resolvers from {}", n, path.display()),
            Err(e) => warn!("keeping previous resolvers, {}: {}", path.display(), e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    fn event(mask: u32, name: &str, padded: usize) -> Vec<u8> {
        let mut e = Vec::new();
        e.extend_from_slice(&1i32.to_ne_bytes());
        e.extend_from_slice(&mask.to_ne_bytes());
        e.extend_from_slice(&0u32.to_ne_bytes());
        e.extend_from_slice(&(padded as u32).to_ne_bytes());
        let mut n = name.as_bytes().to_vec();
        n.resize(padded, 0);
        e.extend_from_slice(&n);
        e
    }

    #[test]
    fn change_to_watched_file() {
        let name = OsString::from("resolv.conf");
        let mut buf = event(IN_CREATE, "hosts", 16);
        assert!(!touches(&buf, &name));
        buf.extend(event(IN_MOVED_TO, "resolv.conf", 16));
        assert!(touches(&buf, &name));
        // a prefix of the name does not match
        assert!(!touches(&event(IN_CLOSE_WRITE, "resolv.con", 16), &name));
        // access events are ignored
        assert!(!touches(&event(0x1, "resolv.conf", 16), &name));
    }

    #[test]
    fn truncated_event_buffer() {
        let name = OsString::from("resolv.conf");
        let buf = event(IN_DELETE, "resolv.conf", 16);
        assert!(!touches(&buf[..20], &name));
        assert!(touches(&buf, &name));
    }
}
