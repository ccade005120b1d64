//! Connection tokens, callback sinks, and the operation context.
//!
//! All connection operations go through [`NetCtx`], a short-lived borrow of
//! the event loop's internals. Sinks receive a `&mut NetCtx` so they can
//! re-enter the core — start another read or write, shut a half down, or
//! destroy the connection — before the core's own stack frame unwinds.
//! After every sink call the core re-validates the token generation; a
//! mismatch means the sink destroyed the connection and the slot is not
//! touched again.

use std::io;
use std::net::SocketAddr;

use crate::connection::{
    ConnectionTable, ExternalRead, ExternalWrite, INVALID_FD, ReadMode, WriteMode,
};
use crate::error::Error;
use crate::event::{EventKey, EventSet, SourceTag};
use crate::metrics;
use crate::poll::Poller;

/// Opaque connection token handed to sinks and application code.
/// Encodes the slot index and generation for stale detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnToken {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ConnToken {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        ConnToken { index, generation }
    }

    /// Returns the connection slot index. Useful for indexing into
    /// per-connection application state.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// Completion sink for [`NetCtx::read_exact`].
///
/// Exactly one of the two methods fires, consuming the sink: `on_complete`
/// once the buffer is full, or `on_close` if the peer closes (or a fatal
/// read error occurs) first.
pub trait ReadSink {
    /// The requested bytes are in `buf` (the same allocation passed to
    /// `read_exact`, now fully filled).
    fn on_complete(self: Box<Self>, net: &mut NetCtx<'_>, conn: ConnToken, buf: Vec<u8>);
    /// The read side closed before the request completed.
    fn on_close(self: Box<Self>, net: &mut NetCtx<'_>, conn: ConnToken);
}

/// Offer sink for [`NetCtx::read_buffered`].
///
/// `on_data` is called whenever buffered bytes are available for inspection
/// via [`NetCtx::buffered`]; the sink either commits a prefix with
/// [`NetCtx::accept_buffer`] (completing the read) or returns without
/// committing, which means "not enough data yet" and triggers another kernel
/// read followed by a re-offer. The first offer may present an empty buffer.
pub trait BufferedSink {
    fn on_data(&mut self, net: &mut NetCtx<'_>, conn: ConnToken);
    /// The read side closed while the offer was pending.
    fn on_close(self: Box<Self>, net: &mut NetCtx<'_>, conn: ConnToken);
}

/// Completion sink for [`NetCtx::write_all`].
pub trait WriteSink {
    fn on_complete(self: Box<Self>, net: &mut NetCtx<'_>, conn: ConnToken);
    /// The write side closed before all bytes were sent.
    fn on_close(self: Box<Self>, net: &mut NetCtx<'_>, conn: ConnToken);
}

/// Sink receiving connections accepted by an attached listener. Ownership of
/// each accepted connection transfers to the sink: it wires up reads/writes
/// and eventually destroys the connection.
pub trait AcceptSink {
    fn on_accept(&mut self, net: &mut NetCtx<'_>, conn: ConnToken);
}

/// Pending read-side notification taken out of a slot during shutdown.
enum PendingRead {
    External(Box<dyn ReadSink>),
    Buffered(Box<dyn BufferedSink>),
}

/// Outcome of one buffered-read offer.
enum Offer {
    /// `accept_buffer` ran; the read is complete.
    Accepted,
    /// The sink returned without committing; read more and re-offer.
    Rejected,
    /// The sink destroyed the connection.
    Destroyed,
}

/// Step decided while holding the slot borrow during a read/write drain.
enum IoStep {
    WouldBlock,
    PeerClosed,
    /// Expected peer/network errno; shut down the half quietly.
    PeerError,
    Failed(io::Error),
    Progress,
    Complete,
}

/// The context provided to sinks and application code for issuing
/// connection operations.
///
/// This is a short-lived borrow into the event loop's internal state; obtain
/// one outside of callbacks with [`EventLoop::ctx`](crate::EventLoop::ctx).
pub struct NetCtx<'a> {
    pub(crate) poller: &'a Poller,
    pub(crate) connections: &'a mut ConnectionTable,
    pub(crate) shutdown_requested: &'a mut bool,
}

impl<'a> NetCtx<'a> {
    // ── Observers ────────────────────────────────────────────────────

    /// Whether the read half is still open. Stale tokens answer `false`.
    pub fn is_read_open(&self, conn: ConnToken) -> bool {
        self.connections
            .get(conn.index, conn.generation)
            .map(|s| !s.read_shut)
            .unwrap_or(false)
    }

    /// Whether the write half is still open. Stale tokens answer `false`.
    pub fn is_write_open(&self, conn: ConnToken) -> bool {
        self.connections
            .get(conn.index, conn.generation)
            .map(|s| !s.write_shut)
            .unwrap_or(false)
    }

    /// Peer address captured at accept time.
    pub fn peer_addr(&self, conn: ConnToken) -> Option<SocketAddr> {
        self.connections
            .get(conn.index, conn.generation)
            .and_then(|s| s.peer_addr)
    }

    /// Number of live connections on this loop.
    pub fn active_connections(&self) -> usize {
        self.connections.active_count()
    }

    /// Stop the event loop's `run()` after the current dispatch batch.
    pub fn request_shutdown(&mut self) {
        *self.shutdown_requested = true;
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Read exactly `buf.len()` bytes, then hand `buf` back via
    /// [`ReadSink::on_complete`].
    ///
    /// Bytes already in the peek buffer are drained first, so switching from
    /// buffered reads loses nothing. The sink may fire synchronously, from
    /// inside this call, when the request is satisfied without blocking; it
    /// may start another read or shut the connection down from there.
    ///
    /// # Panics
    ///
    /// If the read side is shut down or another read is outstanding.
    pub fn read_exact<S: ReadSink + 'static>(
        &mut self,
        conn: ConnToken,
        mut buf: Vec<u8>,
        sink: S,
    ) -> Result<(), Error> {
        {
            let state = self
                .connections
                .get(conn.index, conn.generation)
                .ok_or(Error::InvalidConnection)?;
            assert!(!state.read_shut, "read_exact after read shutdown");
            assert!(
                state.read_mode == ReadMode::Idle,
                "a read is already outstanding"
            );
        }
        self.register_if_needed(conn)?;

        // A previous buffered read may have pulled more bytes than it
        // consumed; they are the front of the stream and must go out first.
        let state = self
            .connections
            .get_mut(conn.index, conn.generation)
            .ok_or(Error::InvalidConnection)?;
        let filled = state.peek.drain_into(&mut buf[..]);

        if filled == buf.len() {
            Box::new(sink).on_complete(self, conn, buf);
            return Ok(());
        }

        state.read_mode = ReadMode::External;
        state.external_read = Some(ExternalRead {
            buf,
            filled,
            sink: Box::new(sink),
        });
        self.drive_external_read(conn.index, conn.generation);
        Ok(())
    }

    /// Start a buffered read: offer currently-buffered bytes to `sink`,
    /// reading more from the kernel after each rejected offer.
    ///
    /// # Panics
    ///
    /// If the read side is shut down or another read is outstanding.
    pub fn read_buffered<S: BufferedSink + 'static>(
        &mut self,
        conn: ConnToken,
        sink: S,
    ) -> Result<(), Error> {
        {
            let state = self
                .connections
                .get(conn.index, conn.generation)
                .ok_or(Error::InvalidConnection)?;
            assert!(!state.read_shut, "read_buffered after read shutdown");
            assert!(
                state.read_mode == ReadMode::Idle,
                "a read is already outstanding"
            );
        }
        self.register_if_needed(conn)?;

        let state = self
            .connections
            .get_mut(conn.index, conn.generation)
            .ok_or(Error::InvalidConnection)?;
        state.read_mode = ReadMode::Buffered;
        state.buffered_sink = Some(Box::new(sink));

        // Offer immediately: bytes may already be buffered, or the sink may
        // be satisfied by an empty buffer.
        match self.offer(conn.index, conn.generation) {
            Offer::Accepted | Offer::Destroyed => {}
            Offer::Rejected => self.drive_buffered_read(conn.index, conn.generation),
        }
        Ok(())
    }

    /// The bytes currently held in the peek buffer, as one contiguous slice.
    /// Stale tokens yield an empty slice.
    pub fn buffered(&self, conn: ConnToken) -> &[u8] {
        self.connections
            .get(conn.index, conn.generation)
            .map(|s| s.peek.data())
            .unwrap_or(&[])
    }

    /// Consume the first `n` buffered bytes, completing the buffered read.
    /// Legal only from inside [`BufferedSink::on_data`], at most once per
    /// offer. The sink may start a new read immediately afterwards.
    ///
    /// # Panics
    ///
    /// If called outside an offer callback, or with `n` larger than the
    /// buffered byte count.
    pub fn accept_buffer(&mut self, conn: ConnToken, n: usize) {
        let state = self
            .connections
            .get_mut(conn.index, conn.generation)
            .expect("accept_buffer on a destroyed connection");
        assert!(
            state.in_buffered_cb,
            "accept_buffer is only legal inside a buffered-read callback"
        );
        debug_assert_eq!(state.read_mode, ReadMode::Buffered);
        assert!(
            n <= state.peek.len(),
            "accept_buffer({n}) exceeds buffered byte count {}",
            state.peek.len()
        );
        state.peek.consume(n);
        state.in_buffered_cb = false;
        state.read_mode = ReadMode::Idle;
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Send all of `buf`, then fire [`WriteSink::on_complete`].
    ///
    /// On `would-block` the write parks and writable interest is armed;
    /// progress resumes on the next writable event. Writable interest is
    /// disarmed again before the completion fires, so an idle connection
    /// never spins a level-triggered backend.
    ///
    /// # Panics
    ///
    /// If the write side is shut down or another write is outstanding.
    pub fn write_all<S: WriteSink + 'static>(
        &mut self,
        conn: ConnToken,
        buf: Vec<u8>,
        sink: S,
    ) -> Result<(), Error> {
        {
            let state = self
                .connections
                .get(conn.index, conn.generation)
                .ok_or(Error::InvalidConnection)?;
            assert!(!state.write_shut, "write_all after write shutdown");
            assert!(
                state.write_mode == WriteMode::Idle,
                "a write is already outstanding"
            );
        }
        self.register_if_needed(conn)?;

        if buf.is_empty() {
            Box::new(sink).on_complete(self, conn);
            return Ok(());
        }

        let state = self
            .connections
            .get_mut(conn.index, conn.generation)
            .ok_or(Error::InvalidConnection)?;
        state.write_mode = WriteMode::External;
        state.external_write = Some(ExternalWrite {
            buf,
            written: 0,
            sink: Box::new(sink),
        });
        self.drive_external_write(conn.index, conn.generation);
        Ok(())
    }

    // ── Half-shutdown and destruction ────────────────────────────────

    /// Shut down the read half. A pending read is notified with `on_close`.
    /// No-op on a stale token.
    ///
    /// # Panics
    ///
    /// If the read side is already shut, or if called from inside a
    /// buffered-read callback that has not called `accept_buffer` (commit or
    /// reject the offer first).
    pub fn shutdown_read(&mut self, conn: ConnToken) {
        let Some(state) = self.connections.get_mut(conn.index, conn.generation) else {
            return;
        };
        assert!(
            !state.in_buffered_cb,
            "shutdown_read inside a buffered-read callback requires accept_buffer first"
        );
        assert!(!state.read_shut, "read side already shut down");

        let ret = unsafe { libc::shutdown(state.fd, libc::SHUT_RD) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOTCONN) {
                log::error!("could not shutdown socket for reading: {err}");
            }
        }
        self.finish_read_shut(conn.index, conn.generation);
    }

    /// Shut down the write half. A pending write is notified with
    /// `on_close`; its unsent bytes are dropped. No-op on a stale token.
    ///
    /// # Panics
    ///
    /// If the write side is already shut.
    pub fn shutdown_write(&mut self, conn: ConnToken) {
        let Some(state) = self.connections.get_mut(conn.index, conn.generation) else {
            return;
        };
        assert!(!state.write_shut, "write side already shut down");

        let ret = unsafe { libc::shutdown(state.fd, libc::SHUT_WR) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOTCONN) {
                log::error!("could not shutdown socket for writing: {err}");
            }
        }
        self.finish_write_shut(conn.index, conn.generation);
    }

    /// Close the socket and release the slot. Legal from inside any sink;
    /// the core detects the destruction and stops touching the connection.
    /// No-op on a stale token.
    ///
    /// # Panics
    ///
    /// If either half is still open.
    pub fn destroy(&mut self, conn: ConnToken) {
        let Some(state) = self.connections.get_mut(conn.index, conn.generation) else {
            return;
        };
        assert!(
            state.read_shut && state.write_shut,
            "destroy requires both halves shut down"
        );
        debug_assert!(!state.registered, "poller forgot the fd when the second half shut");

        let fd = state.fd;
        state.fd = INVALID_FD;
        if fd != INVALID_FD {
            let ret = unsafe { libc::close(fd) };
            if ret != 0 {
                log::error!("close() failed: {}", io::Error::last_os_error());
            }
        }
        self.connections.release(conn.index);
        metrics::CONNECTIONS_CLOSED.increment();
        metrics::CONNECTIONS_ACTIVE.decrement();
    }

    // ── Event dispatch ───────────────────────────────────────────────

    /// Handle a readiness event batch entry for a connection slot. Called by
    /// the event loop; `generation` comes from the event key, so events for
    /// slots recycled earlier in the same batch fall out here.
    pub(crate) fn dispatch_conn(&mut self, index: u32, generation: u32, events: EventSet) {
        let Some(state) = self.connections.get(index, generation) else {
            return;
        };

        if events.readable() && !state.read_shut {
            match state.read_mode {
                // Bytes stay in the kernel until the next read request.
                ReadMode::Idle => {}
                ReadMode::External => self.drive_external_read(index, generation),
                ReadMode::Buffered => self.drive_buffered_read(index, generation),
            }
            if self.connections.get(index, generation).is_none() {
                return;
            }
        }

        // Re-fetch: a read sink may have shut the write side down.
        let Some(state) = self.connections.get(index, generation) else {
            return;
        };
        if events.writable() && !state.write_shut {
            match state.write_mode {
                WriteMode::Idle => {
                    // Writable interest is armed only while a write is
                    // parked; tolerate a stray event by disarming.
                    if state.write_interest {
                        if let Some(state) =
                            self.connections.get_mut(index, generation)
                        {
                            state.write_interest = false;
                        }
                        self.update_interest(index, generation);
                    }
                }
                WriteMode::External => self.drive_external_write(index, generation),
            }
            if self.connections.get(index, generation).is_none() {
                return;
            }
        }

        let Some(state) = self.connections.get(index, generation) else {
            return;
        };
        if events.error() && events.hangup() {
            // Peer hung up while our send buffer still holds undelivered
            // data. The read and write paths surface the closure on their
            // own; acting here would double-report it.
            log::debug!(
                "ignoring error+hangup pair for connection {index} ({:?})",
                state.peer_addr
            );
        } else if events.error() {
            log::error!("unexpected error event on connection {index}: {events:?}");
            let token = ConnToken::new(index, generation);
            if !state.read_shut {
                self.shutdown_read(token);
            }
            // The read sink's on_close may have destroyed the connection.
            let Some(state) = self.connections.get(index, generation) else {
                return;
            };
            if !state.write_shut {
                self.shutdown_write(token);
            }
        }
    }

    // ── Internals ────────────────────────────────────────────────────

    /// Register the socket with the poller on the first read or write.
    fn register_if_needed(&mut self, conn: ConnToken) -> Result<(), Error> {
        let state = self
            .connections
            .get_mut(conn.index, conn.generation)
            .ok_or(Error::InvalidConnection)?;
        if state.registered {
            return Ok(());
        }
        let fd = state.fd;
        state.registered = true;
        let key = EventKey::encode(SourceTag::Conn, conn.index, conn.generation);
        if let Err(err) = self.poller.watch(fd, EventSet::READABLE, key) {
            if let Some(state) = self.connections.get_mut(conn.index, conn.generation) {
                state.registered = false;
            }
            return Err(Error::Io(err));
        }
        Ok(())
    }

    /// Recompute the interest mask from actual demand: readable while the
    /// read half is open, writable only while a write is parked. A half
    /// with nothing pending contributes nothing, so no latent interest is
    /// left to generate spurious wakeups.
    fn update_interest(&self, index: u32, generation: u32) {
        let Some(state) = self.connections.get(index, generation) else {
            return;
        };
        if !state.registered {
            return;
        }
        let mut interest = EventSet::empty();
        if !state.read_shut {
            interest |= EventSet::READABLE;
        }
        if state.write_interest {
            interest |= EventSet::WRITABLE;
        }
        let key = EventKey::encode(SourceTag::Conn, index, generation);
        if let Err(err) = self.poller.adjust(state.fd, interest, key) {
            log::error!("could not adjust poller interest: {err}");
        }
    }

    /// Drain `read(2)` into the parked external buffer until the request
    /// completes, the socket would block, or the read side closes.
    fn drive_external_read(&mut self, index: u32, generation: u32) {
        loop {
            let step = {
                let Some(state) = self.connections.get_mut(index, generation) else {
                    return;
                };
                debug_assert_eq!(state.read_mode, ReadMode::External);
                let fd = state.fd;
                let er = state.external_read.as_mut().expect("external read armed");
                let remaining = er.buf.len() - er.filled;
                debug_assert!(remaining > 0);

                let res = unsafe {
                    libc::read(
                        fd,
                        er.buf.as_mut_ptr().add(er.filled) as *mut libc::c_void,
                        remaining,
                    )
                };
                if res > 0 {
                    metrics::BYTES_RECEIVED.add(res as u64);
                    er.filled += res as usize;
                    if er.filled == er.buf.len() {
                        IoStep::Complete
                    } else {
                        IoStep::Progress
                    }
                } else if res == 0 {
                    IoStep::PeerClosed
                } else {
                    classify_read_errno(io::Error::last_os_error())
                }
            };

            match step {
                IoStep::WouldBlock => return, // resumed by the next readable event
                IoStep::PeerClosed | IoStep::PeerError => {
                    self.finish_read_shut(index, generation);
                    return;
                }
                IoStep::Failed(err) => {
                    log::error!("could not read from socket: {err}");
                    self.finish_read_shut(index, generation);
                    return;
                }
                IoStep::Progress => {}
                IoStep::Complete => {
                    let state = self
                        .connections
                        .get_mut(index, generation)
                        .expect("slot live across syscall");
                    let er = state.external_read.take().expect("external read armed");
                    state.read_mode = ReadMode::Idle;
                    let token = ConnToken::new(index, generation);
                    er.sink.on_complete(self, token, er.buf);
                    return;
                }
            }
        }
    }

    /// Read kernel bytes into the peek buffer and re-offer until the sink
    /// accepts, the socket would block, or the read side closes.
    fn drive_buffered_read(&mut self, index: u32, generation: u32) {
        loop {
            let step = {
                let Some(state) = self.connections.get_mut(index, generation) else {
                    return;
                };
                debug_assert_eq!(state.read_mode, ReadMode::Buffered);
                let fd = state.fd;
                let old = state.peek.len();
                let spare = state.peek.grow_for_read();
                let res =
                    unsafe { libc::read(fd, spare.as_mut_ptr() as *mut libc::c_void, spare.len()) };
                if res > 0 {
                    metrics::BYTES_RECEIVED.add(res as u64);
                    state.peek.commit(old, res as usize);
                    IoStep::Progress
                } else {
                    state.peek.commit(old, 0);
                    if res == 0 {
                        IoStep::PeerClosed
                    } else {
                        classify_read_errno(io::Error::last_os_error())
                    }
                }
            };

            match step {
                IoStep::WouldBlock => return, // re-offered on the next readable event
                IoStep::PeerClosed | IoStep::PeerError => {
                    self.finish_read_shut(index, generation);
                    return;
                }
                IoStep::Failed(err) => {
                    log::error!("could not read from socket: {err}");
                    self.finish_read_shut(index, generation);
                    return;
                }
                IoStep::Progress => match self.offer(index, generation) {
                    Offer::Accepted | Offer::Destroyed => return,
                    // The kernel may hold more; keep reading.
                    Offer::Rejected => {}
                },
                IoStep::Complete => unreachable!(),
            }
        }
    }

    /// Run one offer cycle: present the peek buffer to the buffered sink and
    /// observe whether it committed a prefix, rejected the offer, or
    /// destroyed the connection.
    fn offer(&mut self, index: u32, generation: u32) -> Offer {
        let Some(state) = self.connections.get_mut(index, generation) else {
            return Offer::Destroyed;
        };
        debug_assert!(!state.in_buffered_cb);
        state.in_buffered_cb = true;
        let mut sink = state.buffered_sink.take().expect("buffered sink armed");

        let token = ConnToken::new(index, generation);
        sink.on_data(self, token);

        let Some(state) = self.connections.get_mut(index, generation) else {
            // The sink destroyed the connection; nothing may touch the slot.
            return Offer::Destroyed;
        };
        if state.in_buffered_cb {
            // accept_buffer was not called; the offer was rejected.
            state.in_buffered_cb = false;
            state.buffered_sink = Some(sink);
            Offer::Rejected
        } else {
            // accept_buffer completed the read and may have started another
            // one already; the slot is not necessarily idle.
            Offer::Accepted
        }
    }

    /// Drain `write(2)` from the parked external buffer until the request
    /// completes, the socket would block, or the write side closes.
    fn drive_external_write(&mut self, index: u32, generation: u32) {
        loop {
            let mut park = false;
            let step = {
                let Some(state) = self.connections.get_mut(index, generation) else {
                    return;
                };
                debug_assert_eq!(state.write_mode, WriteMode::External);
                let fd = state.fd;
                let ew = state.external_write.as_mut().expect("external write armed");
                let remaining = ew.buf.len() - ew.written;
                debug_assert!(remaining > 0);

                let res = unsafe {
                    libc::write(
                        fd,
                        ew.buf.as_ptr().add(ew.written) as *const libc::c_void,
                        remaining,
                    )
                };
                if res > 0 {
                    metrics::BYTES_SENT.add(res as u64);
                    ew.written += res as usize;
                    if ew.written == ew.buf.len() {
                        IoStep::Complete
                    } else {
                        IoStep::Progress
                    }
                } else if res == 0 {
                    IoStep::Failed(io::Error::other("write() returned 0"))
                } else {
                    let err = io::Error::last_os_error();
                    match err.raw_os_error() {
                        Some(libc::EAGAIN) => {
                            // Arm writable interest only now, while a write
                            // is actually parked: leaving it armed while
                            // idle makes level-triggered backends spin and
                            // starve everything else on the loop.
                            if !state.write_interest {
                                state.write_interest = true;
                                park = true;
                            }
                            IoStep::WouldBlock
                        }
                        Some(
                            libc::EPIPE
                            | libc::ENOTCONN
                            | libc::EHOSTUNREACH
                            | libc::ENETDOWN
                            | libc::EHOSTDOWN
                            | libc::ECONNRESET,
                        ) => IoStep::PeerError,
                        _ => IoStep::Failed(err),
                    }
                }
            };

            match step {
                IoStep::WouldBlock => {
                    if park {
                        self.update_interest(index, generation);
                    }
                    return; // resumed by the next writable event
                }
                IoStep::PeerClosed | IoStep::PeerError => {
                    self.finish_write_shut(index, generation);
                    return;
                }
                IoStep::Failed(err) => {
                    log::error!("could not write to socket: {err}");
                    self.finish_write_shut(index, generation);
                    return;
                }
                IoStep::Progress => {}
                IoStep::Complete => {
                    let state = self
                        .connections
                        .get_mut(index, generation)
                        .expect("slot live across syscall");
                    let ew = state.external_write.take().expect("external write armed");
                    state.write_mode = WriteMode::Idle;
                    // Disarm writable interest before completing, so an idle
                    // socket generates no further writable wakeups.
                    let disarm = state.write_interest;
                    if disarm {
                        state.write_interest = false;
                        self.update_interest(index, generation);
                    }
                    let token = ConnToken::new(index, generation);
                    ew.sink.on_complete(self, token);
                    return;
                }
            }
        }
    }

    /// Common read-half teardown: mark the flag, fix poller interest, and
    /// notify whichever read is pending with `on_close`.
    fn finish_read_shut(&mut self, index: u32, generation: u32) {
        let pending = {
            let Some(state) = self.connections.get_mut(index, generation) else {
                return;
            };
            assert!(!state.read_shut);
            state.read_shut = true;

            let pending = match state.read_mode {
                ReadMode::Idle => None,
                ReadMode::External => state
                    .external_read
                    .take()
                    .map(|er| PendingRead::External(er.sink)),
                ReadMode::Buffered => state.buffered_sink.take().map(PendingRead::Buffered),
            };
            state.read_mode = ReadMode::Idle;

            if state.registered && state.write_shut {
                state.registered = false;
                let fd = state.fd;
                if let Err(err) = self.poller.forget(fd) {
                    log::error!("could not forget socket: {err}");
                }
            }
            pending
        };

        self.update_interest(index, generation);

        let token = ConnToken::new(index, generation);
        match pending {
            Some(PendingRead::External(sink)) => sink.on_close(self, token),
            Some(PendingRead::Buffered(sink)) => sink.on_close(self, token),
            None => {}
        }
    }

    /// Common write-half teardown, mirror of `finish_read_shut`.
    fn finish_write_shut(&mut self, index: u32, generation: u32) {
        let pending = {
            let Some(state) = self.connections.get_mut(index, generation) else {
                return;
            };
            assert!(!state.write_shut);
            state.write_shut = true;
            state.write_interest = false;

            let pending = match state.write_mode {
                WriteMode::Idle => None,
                WriteMode::External => state.external_write.take().map(|ew| ew.sink),
            };
            state.write_mode = WriteMode::Idle;

            if state.registered && state.read_shut {
                state.registered = false;
                let fd = state.fd;
                if let Err(err) = self.poller.forget(fd) {
                    log::error!("could not forget socket: {err}");
                }
            }
            pending
        };

        self.update_interest(index, generation);

        if let Some(sink) = pending {
            let token = ConnToken::new(index, generation);
            sink.on_close(self, token);
        }
    }
}

/// Map a read errno to a drain step: `EAGAIN` parks, expected peer errnos
/// close the half quietly, anything else is logged and closes the half —
/// one connection's surprise errno must never take the server down.
fn classify_read_errno(err: io::Error) -> IoStep {
    match err.raw_os_error() {
        Some(libc::EAGAIN) => IoStep::WouldBlock, // EWOULDBLOCK aliases EAGAIN on Linux
        Some(libc::ECONNRESET | libc::ENOTCONN) => IoStep::PeerError,
        _ => IoStep::Failed(err),
    }
}
