//! The event loop that owns the poller, the connection table, and any
//! attached listeners, and drives readiness events into the connection core.
//!
//! Single-threaded by construction: the loop holds non-`Send` sinks, so it
//! and every connection it owns are confined to the thread that created it.
//! Mutual exclusion comes from dispatch, not from locks.

use std::time::Duration;

use crate::config::Config;
use crate::connection::ConnectionTable;
use crate::error::Error;
use crate::event::{EventKey, EventSet, SourceTag};
use crate::handler::{AcceptSink, ConnToken, NetCtx};
use crate::listener::{AcceptOutcome, Listener};
use crate::metrics;
use crate::poll::Poller;

/// Handle for a listener attached to an [`EventLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerToken(u32);

struct ListenerSlot {
    listener: Listener,
    sink: Option<Box<dyn AcceptSink>>,
}

/// A single-threaded readiness event loop.
pub struct EventLoop {
    poller: Poller,
    connections: ConnectionTable,
    listeners: Vec<Option<ListenerSlot>>,
    pending: Vec<(EventKey, EventSet)>,
    shutdown_requested: bool,
}

impl EventLoop {
    pub fn new(config: Config) -> Result<EventLoop, Error> {
        config.validate()?;
        Ok(EventLoop {
            poller: Poller::new(config.event_batch)?,
            connections: ConnectionTable::new(config.max_connections),
            listeners: Vec::new(),
            pending: Vec::new(),
            shutdown_requested: false,
        })
    }

    /// Attach a listener, registering it for readable events, and wire its
    /// accepted connections to `sink`. A listener can only ever be attached
    /// once (it is moved into the loop). Attaching a defunct listener
    /// succeeds but registers nothing and never accepts.
    pub fn attach<S: AcceptSink + 'static>(
        &mut self,
        listener: Listener,
        sink: S,
    ) -> Result<ListenerToken, Error> {
        let index = self.listeners.len() as u32;
        if !listener.is_defunct() {
            let key = EventKey::encode(SourceTag::Listener, index, 0);
            self.poller
                .watch(listener.fd(), EventSet::READABLE, key)
                .map_err(Error::Io)?;
        }
        self.listeners.push(Some(ListenerSlot {
            listener,
            sink: Some(Box::new(sink)),
        }));
        Ok(ListenerToken(index))
    }

    /// Detach a listener: deregister it and close its socket. Connections it
    /// already emitted are unaffected.
    pub fn detach(&mut self, token: ListenerToken) {
        if let Some(slot) = self
            .listeners
            .get_mut(token.0 as usize)
            .and_then(|entry| entry.take())
        {
            if !slot.listener.is_defunct() {
                if let Err(err) = self.poller.forget(slot.listener.fd()) {
                    log::error!("could not forget listener socket: {err}");
                }
            }
            // Listener::drop shuts down and closes the socket.
        }
    }

    /// An operation context for use outside of callbacks.
    pub fn ctx(&mut self) -> NetCtx<'_> {
        NetCtx {
            poller: &self.poller,
            connections: &mut self.connections,
            shutdown_requested: &mut self.shutdown_requested,
        }
    }

    /// Whether a callback has requested loop shutdown.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Wait for readiness once and dispatch the resulting batch. Returns the
    /// number of events dispatched; `timeout` of `None` blocks indefinitely.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<usize, Error> {
        self.pending.clear();
        self.poller.wait(&mut self.pending, timeout)?;

        for i in 0..self.pending.len() {
            let (key, events) = self.pending[i];
            match key.tag() {
                Some(SourceTag::Conn) => {
                    self.ctx().dispatch_conn(key.index(), key.generation(), events);
                }
                Some(SourceTag::Listener) => self.dispatch_listener(key.index(), events),
                None => log::error!("event with unknown source tag: {:#x}", key.raw()),
            }
        }
        Ok(self.pending.len())
    }

    /// Poll until a callback calls
    /// [`NetCtx::request_shutdown`](crate::NetCtx::request_shutdown).
    pub fn run(&mut self) -> Result<(), Error> {
        while !self.shutdown_requested {
            self.poll(None)?;
        }
        Ok(())
    }

    /// Drain `accept` on a readable listener, emitting each new connection
    /// to the listener's sink.
    fn dispatch_listener(&mut self, index: u32, events: EventSet) {
        if events != EventSet::READABLE {
            log::error!("unexpected event mask on listener {index}: {events:?}");
        }

        loop {
            let outcome = match self.listeners.get(index as usize).and_then(|entry| entry.as_ref()) {
                // Detached mid-drain (or never existed).
                None => return,
                Some(slot) => slot.listener.try_accept(),
            };

            match outcome {
                AcceptOutcome::WouldBlock => return,
                AcceptOutcome::Retry => continue,
                AcceptOutcome::Accepted(fd, peer_addr) => {
                    let Some(conn_index) = self.connections.allocate(fd, peer_addr) else {
                        log::warn!(
                            "connection table full; dropping accepted socket from {peer_addr:?}"
                        );
                        metrics::ACCEPT_DROPPED.increment();
                        unsafe {
                            libc::close(fd);
                        }
                        continue;
                    };
                    metrics::CONNECTIONS_ACCEPTED.increment();
                    metrics::CONNECTIONS_ACTIVE.increment();

                    let generation = self.connections.generation(conn_index);
                    let token = ConnToken::new(conn_index, generation);

                    // The sink is taken out for the duration of the call so
                    // it can borrow the loop internals through NetCtx.
                    let Some(mut sink) = self
                        .listeners
                        .get_mut(index as usize)
                        .and_then(|entry| entry.as_mut())
                        .and_then(|slot| slot.sink.take())
                    else {
                        return;
                    };
                    let mut ctx = NetCtx {
                        poller: &self.poller,
                        connections: &mut self.connections,
                        shutdown_requested: &mut self.shutdown_requested,
                    };
                    sink.on_accept(&mut ctx, token);
                    if let Some(slot) = self
                        .listeners
                        .get_mut(index as usize)
                        .and_then(|entry| entry.as_mut())
                    {
                        slot.sink = Some(sink);
                    }
                }
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Sockets never destroyed by the application are closed here, once:
        // destroy() marks its fd invalid and releases the slot, so only
        // still-live connections remain in the iteration.
        for fd in self.connections.active_fds() {
            unsafe {
                libc::close(fd);
            }
        }
    }
}
