//! Readiness notification over epoll.
//!
//! Descriptors are registered one-shot: once reported, a descriptor stays
//! silent until its consumer calls [`Poller::rearm`]. A readable socket is
//! therefore handed to exactly one shard loop at a time, and a notification
//! that was dropped can be recovered by rearming.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

/// Result of one [`Poller::wait`]; the two lists never share a descriptor.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Readiness {
    pub readable: Vec<RawFd>,
    pub closed: Vec<RawFd>,
}

impl Readiness {
    pub fn is_empty(&self) -> bool {
        self.readable.is_empty() && self.closed.is_empty()
    }
}

pub trait Poller: Send + Sync + 'static {
    /// Registers `fd` for read or hangup readiness.
    fn add(&self, fd: RawFd) -> io::Result<()>;

    fn remove(&self, fd: RawFd) -> io::Result<()>;

    /// Re-enables reporting for `fd` after its last notification was consumed.
    fn rearm(&self, fd: RawFd) -> io::Result<()>;

    /// Blocks until something is ready or the poll timeout passes.
    fn wait(&self) -> io::Result<Readiness>;
}

const INTEREST: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLONESHOT) as u32;
const HANGUP: u32 = (libc::EPOLLHUP | libc::EPOLLERR) as u32;

#[derive(Debug)]
pub struct Epoll {
    epfd: OwnedFd,
    timeout_ms: libc::c_int,
    events: Mutex<Vec<libc::epoll_event>>,
}

impl Epoll {
    pub fn new(timeout: Duration, max_events: usize) -> io::Result<Self> {
        // SAFETY: plain syscall, the returned descriptor is checked below.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` is a freshly created descriptor nobody else owns.
        let epfd = unsafe { OwnedFd::from_raw_fd(fd) };
        let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

        Ok(Epoll {
            epfd,
            timeout_ms,
            events: Mutex::new(vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)]),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: INTEREST,
            u64: fd as u64,
        };
        let event_ptr = if op == libc::EPOLL_CTL_DEL {
            std::ptr::null_mut()
        } else {
            &mut event as *mut libc::epoll_event
        };
        // SAFETY: `event_ptr` is null for DEL or points at a live local.
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, event_ptr) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Poller for Epoll {
    fn add(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd)
    }

    fn remove(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd)
    }

    fn rearm(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd)
    }

    fn wait(&self) -> io::Result<Readiness> {
        let mut events = self.events.lock();
        // SAFETY: the buffer holds `events.len()` initialized entries and
        // the kernel writes at most that many.
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                self.timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Readiness::default());
            }
            return Err(err);
        }

        let mut readiness = Readiness::default();
        for event in &events[..n as usize] {
            let flags = event.events;
            let fd = event.u64 as RawFd;
            if flags & HANGUP != 0 {
                readiness.closed.push(fd);
            } else {
                readiness.readable.push(fd);
            }
        }
        trace!(
            "epoll reported {} readable, {} closed",
            readiness.readable.len(),
            readiness.closed.len()
        );
        Ok(readiness)
    }
}
