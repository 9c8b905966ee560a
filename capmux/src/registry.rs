//! The epoll wait set both event sources are registered with.

use std::{
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    time::Duration,
};

use libc::{EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLLERR, EPOLLHUP, EPOLLIN, epoll_event};
use tracing::{info, trace};

use crate::error::{Error, Result};

/// Readiness a descriptor is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
}

impl Interest {
    fn bits(self) -> u32 {
        match self {
            Interest::Readable => EPOLLIN as u32,
        }
    }
}

/// A descriptor reported ready by [`EventRegistry::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub fd: RawFd,
    bits: u32,
}

impl Ready {
    pub fn is_readable(&self) -> bool {
        self.bits & EPOLLIN as u32 != 0
    }

    /// Error or hang-up on the descriptor; it still gets dispatched so the
    /// owning handler sees the failure on its next read.
    pub fn is_error(&self) -> bool {
        self.bits & (EPOLLERR | EPOLLHUP) as u32 != 0
    }
}

/// Reusable buffer for one `wait` call.
pub struct Events {
    buf: Vec<epoll_event>,
    len: usize,
}

impl Events {
    /// `capacity` bounds how many ready descriptors one wait may report.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![epoll_event { events: 0, u64: 0 }; capacity.max(1)],
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Ready descriptors in the order the kernel reported them.
    pub fn iter(&self) -> impl Iterator<Item = Ready> + '_ {
        self.buf[..self.len].iter().map(|ev| {
            // copy out of the packed struct before use
            let token = ev.u64;
            let bits = ev.events;
            Ready {
                fd: token as RawFd,
                bits,
            }
        })
    }
}

/// Owns the epoll descriptor plus the (descriptor, interest) pairs added to it.
///
/// Registrations are never removed: both sources live until teardown, and the
/// registry holds their raw descriptor numbers without owning them.
pub struct EventRegistry {
    epoll: OwnedFd,
    entries: Vec<(RawFd, Interest)>,
}

impl EventRegistry {
    pub fn create() -> Result<Self> {
        // SAFETY: epoll_create1 takes no pointers; the result is checked below.
        let fd = unsafe { libc::epoll_create1(EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(Error::last_os_error("epoll_create"));
        }
        // SAFETY: fd was just returned by epoll_create1 and is owned by nobody else.
        let epoll = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self {
            epoll,
            entries: Vec::new(),
        })
    }

    /// Add `fd` to the wait set. Fails on duplicates, invalid descriptors and
    /// descriptors epoll cannot watch (regular files).
    pub fn register(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        let mut ev = epoll_event {
            events: interest.bits(),
            u64: fd as u64,
        };

        info!(
            event.name = "registry.fd_added",
            fd,
            interest = ?interest,
            "adding fd {fd} to epoll"
        );

        // SAFETY: epoll and fd are plain descriptors; ev lives across the call.
        let rc = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), EPOLL_CTL_ADD, fd, &mut ev) };
        if rc == -1 {
            return Err(Error::last_os_error("epoll_ctl"));
        }

        self.entries.push((fd, interest));
        Ok(())
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.entries.iter().any(|(registered, _)| *registered == fd)
    }

    pub fn entries(&self) -> &[(RawFd, Interest)] {
        &self.entries
    }

    /// Block until at least one registered descriptor is ready, or `timeout`
    /// elapses (`None` waits forever).
    ///
    /// An interrupted wait is not an error: it returns zero ready descriptors
    /// and the caller simply waits again.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> Result<usize> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
        };

        // SAFETY: the buffer holds `buf.len()` initialised epoll_event slots.
        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                events.buf.as_mut_ptr(),
                events.buf.len() as i32,
                timeout_ms,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            events.len = 0;
            if err.kind() == io::ErrorKind::Interrupted {
                trace!(event.name = "registry.wait_interrupted", "epoll_wait interrupted");
                return Ok(0);
            }
            return Err(Error::system("epoll_wait", err));
        }

        events.len = n as usize;
        Ok(events.len)
    }
}

impl AsRawFd for EventRegistry {
    fn as_raw_fd(&self) -> RawFd {
        self.epoll.as_raw_fd()
    }
}
