//! Bound, listening, non-blocking TCP acceptor.
//!
//! A `Listener` is constructed standalone and then attached to an
//! [`EventLoop`](crate::event_loop::EventLoop), which registers it for
//! readable events and drains `accept` on each one. Bind failure does not
//! abort: the listener comes back *defunct* and every later operation on it
//! is a no-op, so an embedding server can still run its orderly shutdown
//! path instead of dying with storage in an inconsistent state.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use crate::config::Config;
use crate::connection::INVALID_FD;
use crate::error::Error;

/// Result of a single non-blocking `accept` attempt.
pub(crate) enum AcceptOutcome {
    /// A new socket, already non-blocking and close-on-exec.
    Accepted(RawFd, Option<SocketAddr>),
    /// The backlog is drained.
    WouldBlock,
    /// Transient or protocol-level failure; skip to the next attempt.
    Retry,
}

/// A bound, listening, non-blocking TCP socket.
pub struct Listener {
    fd: RawFd,
    defunct: bool,
}

impl Listener {
    /// Bind to `INADDR_ANY:port` and start listening.
    ///
    /// On bind failure (typically `EADDRINUSE`) the returned listener is
    /// defunct rather than an error. Failure of any other setup step —
    /// socket creation, socket options, `listen`, `O_NONBLOCK` — is a real
    /// error.
    pub fn bind(port: u16, config: &Config) -> Result<Listener, Error> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        if let Err(e) = set_sockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1) {
            unsafe { libc::close(fd) };
            return Err(Error::Io(e));
        }

        // NODELAY on the listening socket so accepted sockets inherit it:
        // Nagle holds small pipelined replies for up to ~40ms waiting for a
        // full window, which is fatal for request/response latency.
        if config.tcp_nodelay {
            if let Err(e) = set_sockopt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1) {
                unsafe { libc::close(fd) };
                return Err(Error::Io(e));
            }
        }

        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();

        let ret = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            let err = io::Error::last_os_error();
            log::warn!("could not bind to port {port}: {err}; listener is defunct");
            unsafe { libc::close(fd) };
            return Ok(Listener {
                fd: INVALID_FD,
                defunct: true,
            });
        }

        let ret = unsafe { libc::listen(fd, config.backlog) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Io(err));
        }

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Io(err));
        }

        Ok(Listener { fd, defunct: false })
    }

    /// Whether bind failed and this listener performs no I/O.
    pub fn is_defunct(&self) -> bool {
        self.defunct
    }

    /// The locally bound port, from `getsockname`. `None` when defunct.
    pub fn local_port(&self) -> Option<u16> {
        if self.defunct {
            return None;
        }
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(self.fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if ret != 0 {
            return None;
        }
        Some(u16::from_be(addr.sin_port))
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    /// One non-blocking `accept` attempt, classifying errno per the accept
    /// policy: transient failures are skipped, anything else is logged and
    /// skipped — a bad accept must never take the server down.
    pub(crate) fn try_accept(&self) -> AcceptOutcome {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        let fd = unsafe {
            libc::accept4(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut addr_len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };

        if fd < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                // EWOULDBLOCK aliases EAGAIN on Linux
                Some(libc::EAGAIN) => AcceptOutcome::WouldBlock,
                Some(
                    libc::EPROTO
                    | libc::ENOPROTOOPT
                    | libc::ENETDOWN
                    | libc::ENONET
                    | libc::ENETUNREACH
                    | libc::EINTR,
                ) => AcceptOutcome::Retry,
                _ => {
                    log::error!("cannot accept new connection: {err}");
                    AcceptOutcome::Retry
                }
            };
        }

        AcceptOutcome::Accepted(fd, sockaddr_to_socket_addr(&storage))
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if self.defunct || self.fd == INVALID_FD {
            return;
        }
        unsafe {
            libc::shutdown(self.fd, libc::SHUT_RDWR);
            libc::close(self.fd);
        }
    }
}

fn set_sockopt(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Convert a `sockaddr_storage` filled by `accept4` to a Rust `SocketAddr`.
fn sockaddr_to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            let port = u16::from_be(sa.sin_port);
            Some(SocketAddr::from((ip, port)))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sa.sin6_addr.s6_addr);
            let port = u16::from_be(sa.sin6_port);
            Some(SocketAddr::from((ip, port)))
        }
        _ => None,
    }
}
