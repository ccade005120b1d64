//! eventline — readiness-driven non-blocking TCP connection core for Linux.
//!
//! eventline is the network layer of a single-threaded, event-driven server:
//! an epoll-backed [`EventLoop`], a [`Listener`] that feeds accepted
//! connections to a sink, and per-connection operations with callback sinks.
//! Connections offer two read disciplines — exact-size reads into a caller
//! buffer and peek-buffered reads with an offer/accept protocol — plus
//! exact-size writes with on-demand writable interest, and independent
//! read/write half-shutdown.
//!
//! Connections are addressed by [`ConnToken`]s (slot index + generation), so
//! a sink may destroy its own connection mid-callback; the core detects the
//! stale token and backs off.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use eventline::{
//!     AcceptSink, BufferedSink, Config, ConnToken, EventLoop, Listener, NetCtx, WriteSink,
//! };
//!
//! struct Echo;
//!
//! impl BufferedSink for Echo {
//!     fn on_data(&mut self, net: &mut NetCtx<'_>, conn: ConnToken) {
//!         let line_len = {
//!             let data = net.buffered(conn);
//!             match data.iter().position(|&b| b == b'\n') {
//!                 Some(pos) => pos + 1,
//!                 None => return, // need more data
//!             }
//!         };
//!         let line = net.buffered(conn)[..line_len].to_vec();
//!         net.accept_buffer(conn, line_len);
//!         net.write_all(conn, line, EchoDone).unwrap();
//!     }
//!     fn on_close(self: Box<Self>, net: &mut NetCtx<'_>, conn: ConnToken) {
//!         if net.is_write_open(conn) {
//!             net.shutdown_write(conn);
//!         }
//!         net.destroy(conn);
//!     }
//! }
//!
//! struct EchoDone;
//!
//! impl WriteSink for EchoDone {
//!     fn on_complete(self: Box<Self>, net: &mut NetCtx<'_>, conn: ConnToken) {
//!         net.read_buffered(conn, Echo).unwrap();
//!     }
//!     fn on_close(self: Box<Self>, _net: &mut NetCtx<'_>, _conn: ConnToken) {}
//! }
//!
//! struct Acceptor;
//!
//! impl AcceptSink for Acceptor {
//!     fn on_accept(&mut self, net: &mut NetCtx<'_>, conn: ConnToken) {
//!         net.read_buffered(conn, Echo).unwrap();
//!     }
//! }
//!
//! fn main() -> Result<(), eventline::Error> {
//!     let config = Config::default();
//!     let listener = Listener::bind(7878, &config)?;
//!     let mut event_loop = EventLoop::new(config)?;
//!     event_loop.attach(listener, Acceptor)?;
//!     event_loop.run()
//! }
//! ```
//!
//! # Platform
//!
//! Linux only (epoll, `accept4`). The poller registers edge-triggered, but
//! the connection core drives every syscall to `would-block` before
//! suspending and arms writable interest only while a write is parked, so it
//! is correct under level-triggered delivery as well.

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod buffer;
pub(crate) mod connection;
pub(crate) mod event;
pub(crate) mod poll;

// ── Public modules ──────────────────────────────────────────────────────
pub mod config;
pub mod error;
pub mod event_loop;
pub mod handler;
pub mod listener;
pub mod metrics;

// ── Re-exports ──────────────────────────────────────────────────────────

/// Read chunk used to grow the peek buffer on each kernel read.
pub use buffer::IO_BUFFER_SIZE;
/// Runtime configuration.
pub use config::Config;
/// Builder for [`Config`] with discoverable methods and `build()` validation.
pub use config::ConfigBuilder;
/// Core errors.
pub use error::Error;
/// The single-threaded readiness event loop.
pub use event_loop::EventLoop;
/// Handle for a listener attached to an [`EventLoop`].
pub use event_loop::ListenerToken;
/// Sink receiving accepted connections.
pub use handler::AcceptSink;
/// Offer sink for buffered reads.
pub use handler::BufferedSink;
/// Opaque connection handle.
pub use handler::ConnToken;
/// Operation context passed to sinks (and available via [`EventLoop::ctx`]).
pub use handler::NetCtx;
/// Completion sink for exact-size reads.
pub use handler::ReadSink;
/// Completion sink for exact-size writes.
pub use handler::WriteSink;
/// A bound, listening, non-blocking TCP socket.
pub use listener::Listener;
