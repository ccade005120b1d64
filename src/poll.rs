//! Thin epoll wrapper providing the event queue contract the connection core
//! consumes: `watch` (first registration), `adjust` (change interest),
//! `forget` (deregister), and a blocking `wait` that surfaces readiness.
//!
//! Registration is edge-triggered. The connection core drives every syscall
//! to `EAGAIN` before suspending and arms writable interest only while a
//! write is actually parked, so it stays correct if this file is swapped for
//! a level-triggered backend.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::event::{EventKey, EventSet};

pub(crate) struct Poller {
    epfd: RawFd,
    scratch: Vec<libc::epoll_event>,
}

impl Poller {
    pub fn new(batch: usize) -> io::Result<Poller> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Poller {
            epfd,
            scratch: vec![libc::epoll_event { events: 0, u64: 0 }; batch.max(1)],
        })
    }

    /// First-time registration of `fd` with the given interest mask.
    pub fn watch(&self, fd: RawFd, interest: EventSet, key: EventKey) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest, key)
    }

    /// Change the interest mask of an already-watched `fd`. The empty mask is
    /// legal and leaves only error/hangup delivery armed.
    pub fn adjust(&self, fd: RawFd, interest: EventSet, key: EventKey) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest, key)
    }

    /// Remove `fd`; no further events for it are delivered after this returns.
    pub fn forget(&self, fd: RawFd) -> io::Result<()> {
        let ret = unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: EventSet, key: EventKey) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interest_bits(interest),
            u64: key.raw(),
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Wait for readiness, appending `(key, events)` pairs to `out`.
    /// `timeout` of `None` blocks until at least one event arrives.
    /// Returns the number of events appended; `EINTR` yields zero.
    pub fn wait(
        &mut self,
        out: &mut Vec<(EventKey, EventSet)>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let timeout_ms: libc::c_int = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        };

        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.scratch.as_mut_ptr(),
                self.scratch.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }

        for ev in &self.scratch[..n as usize] {
            out.push((EventKey::from_raw(ev.u64), event_bits(ev.events)));
        }
        Ok(n as usize)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

fn interest_bits(interest: EventSet) -> u32 {
    let mut bits = libc::EPOLLET as u32;
    if interest.readable() {
        bits |= libc::EPOLLIN as u32;
    }
    if interest.writable() {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

fn event_bits(raw: u32) -> EventSet {
    let mut set = EventSet::empty();
    if raw & libc::EPOLLIN as u32 != 0 {
        set |= EventSet::READABLE;
    }
    if raw & libc::EPOLLOUT as u32 != 0 {
        set |= EventSet::WRITABLE;
    }
    if raw & libc::EPOLLERR as u32 != 0 {
        set |= EventSet::ERROR;
    }
    if raw & (libc::EPOLLHUP as u32 | libc::EPOLLRDHUP as u32) != 0 {
        set |= EventSet::HANGUP;
    }
    set
}
