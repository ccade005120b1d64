//! Per-connection state and the slot table that owns it.
//!
//! Connections are arena-allocated: the public handle is a
//! [`ConnToken`](crate::handler::ConnToken) carrying the slot index and a
//! generation counter. Releasing a slot bumps its generation, so tokens held
//! across a destruction go stale instead of dangling. The core re-validates
//! the generation after every user callback; a mismatch means the callback
//! destroyed its own connection and the core must not touch the slot again.

use std::net::SocketAddr;
use std::os::fd::RawFd;

use crate::buffer::PeekBuffer;
use crate::handler::{BufferedSink, ReadSink, WriteSink};

pub(crate) const INVALID_FD: RawFd = -1;

/// Read discipline currently armed on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadMode {
    /// No read outstanding.
    Idle,
    /// Exact-size read into a caller-supplied buffer.
    External,
    /// Peek-buffered read with an offer/accept protocol.
    Buffered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteMode {
    Idle,
    External,
}

/// An exact-size read parked on `would-block`.
pub(crate) struct ExternalRead {
    pub buf: Vec<u8>,
    pub filled: usize,
    pub sink: Box<dyn ReadSink>,
}

/// An exact-size write parked on `would-block`.
pub(crate) struct ExternalWrite {
    pub buf: Vec<u8>,
    pub written: usize,
    pub sink: Box<dyn WriteSink>,
}

/// State for one connection slot.
pub(crate) struct ConnState {
    /// Owned socket; `INVALID_FD` once closed or while the slot is free.
    pub fd: RawFd,
    /// Bumped on release so stale tokens are detectable.
    pub generation: u32,
    pub active: bool,
    /// Whether the socket has been handed to the poller. Registration is
    /// lazy: it happens on the first read or write operation.
    pub registered: bool,
    pub read_mode: ReadMode,
    pub write_mode: WriteMode,
    /// True only while a buffered-read offer callback is on the stack;
    /// gates `accept_buffer`.
    pub in_buffered_cb: bool,
    /// Monotonic half-shutdown flags.
    pub read_shut: bool,
    pub write_shut: bool,
    /// True iff the poller currently has writable interest armed for this
    /// socket. Held only while a write is parked on `would-block`.
    pub write_interest: bool,
    pub peek: PeekBuffer,
    pub external_read: Option<ExternalRead>,
    pub buffered_sink: Option<Box<dyn BufferedSink>>,
    pub external_write: Option<ExternalWrite>,
    pub peer_addr: Option<SocketAddr>,
}

impl ConnState {
    fn new() -> Self {
        ConnState {
            fd: INVALID_FD,
            generation: 0,
            active: false,
            registered: false,
            read_mode: ReadMode::Idle,
            write_mode: WriteMode::Idle,
            in_buffered_cb: false,
            read_shut: false,
            write_shut: false,
            write_interest: false,
            peek: PeekBuffer::new(),
            external_read: None,
            buffered_sink: None,
            external_write: None,
            peer_addr: None,
        }
    }

    fn activate(&mut self, fd: RawFd, peer_addr: Option<SocketAddr>) {
        debug_assert!(!self.active);
        self.fd = fd;
        self.active = true;
        self.registered = false;
        self.read_mode = ReadMode::Idle;
        self.write_mode = WriteMode::Idle;
        self.in_buffered_cb = false;
        self.read_shut = false;
        self.write_shut = false;
        self.write_interest = false;
        self.peer_addr = peer_addr;
    }

    fn deactivate(&mut self) {
        self.fd = INVALID_FD;
        self.active = false;
        self.registered = false;
        self.read_mode = ReadMode::Idle;
        self.write_mode = WriteMode::Idle;
        self.in_buffered_cb = false;
        self.read_shut = false;
        self.write_shut = false;
        self.write_interest = false;
        self.peek = PeekBuffer::new();
        self.external_read = None;
        self.buffered_sink = None;
        self.external_write = None;
        self.peer_addr = None;
        self.generation = self.generation.wrapping_add(1);
    }
}

/// Manages connection slots with a free list for O(1) allocation.
pub(crate) struct ConnectionTable {
    slots: Vec<ConnState>,
    free_list: Vec<u32>,
}

impl ConnectionTable {
    pub fn new(max_connections: u32) -> Self {
        let mut slots = Vec::with_capacity(max_connections as usize);
        for _ in 0..max_connections {
            slots.push(ConnState::new());
        }
        // Free list in reverse order so pop hands out the lowest index first.
        let free_list: Vec<u32> = (0..max_connections).rev().collect();
        ConnectionTable { slots, free_list }
    }

    /// Claim a slot for an accepted socket. Returns the slot index, or `None`
    /// when the table is full.
    pub fn allocate(&mut self, fd: RawFd, peer_addr: Option<SocketAddr>) -> Option<u32> {
        let idx = self.free_list.pop()?;
        self.slots[idx as usize].activate(fd, peer_addr);
        Some(idx)
    }

    /// Return a slot to the free list, bumping its generation.
    pub fn release(&mut self, idx: u32) {
        if let Some(slot) = self.slots.get_mut(idx as usize) {
            if !slot.active {
                return;
            }
            slot.deactivate();
            self.free_list.push(idx);
        }
    }

    /// Look up an active slot, validating the token generation.
    pub fn get(&self, idx: u32, generation: u32) -> Option<&ConnState> {
        self.slots
            .get(idx as usize)
            .filter(|s| s.active && s.generation == generation)
    }

    pub fn get_mut(&mut self, idx: u32, generation: u32) -> Option<&mut ConnState> {
        self.slots
            .get_mut(idx as usize)
            .filter(|s| s.active && s.generation == generation)
    }

    pub fn generation(&self, idx: u32) -> u32 {
        self.slots[idx as usize].generation
    }

    pub fn active_count(&self) -> usize {
        self.slots.len().saturating_sub(self.free_list.len())
    }

    /// Iterate over the fds of all still-active slots (loop teardown).
    pub fn active_fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.slots
            .iter()
            .filter(|s| s.active && s.fd != INVALID_FD)
            .map(|s| s.fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_lowest_first() {
        let mut table = ConnectionTable::new(4);
        assert_eq!(table.allocate(10, None), Some(0));
        assert_eq!(table.allocate(11, None), Some(1));
        assert_eq!(table.active_count(), 2);
    }

    #[test]
    fn release_bumps_generation() {
        let mut table = ConnectionTable::new(2);
        let idx = table.allocate(10, None).unwrap();
        let generation = table.generation(idx);
        assert!(table.get(idx, generation).is_some());

        table.release(idx);
        assert!(table.get(idx, generation).is_none(), "stale token rejected");
        assert_eq!(table.active_count(), 0);

        let idx2 = table.allocate(12, None).unwrap();
        assert_eq!(idx2, idx, "slot reused");
        assert_ne!(table.generation(idx2), generation);
    }

    #[test]
    fn double_release_is_harmless() {
        let mut table = ConnectionTable::new(2);
        let idx = table.allocate(10, None).unwrap();
        table.release(idx);
        table.release(idx);
        assert_eq!(table.active_count(), 0);
        assert!(table.allocate(11, None).is_some());
        assert!(table.allocate(12, None).is_some());
        assert_eq!(table.allocate(13, None), None, "no duplicate free-list entry");
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut table = ConnectionTable::new(1);
        assert!(table.allocate(10, None).is_some());
        assert_eq!(table.allocate(11, None), None);
    }

    #[test]
    fn deactivate_resets_modes() {
        let mut table = ConnectionTable::new(1);
        let idx = table.allocate(10, None).unwrap();
        let generation = table.generation(idx);
        {
            let slot = table.get_mut(idx, generation).unwrap();
            slot.read_mode = ReadMode::Buffered;
            slot.read_shut = true;
            slot.write_interest = true;
        }
        table.release(idx);
        let idx = table.allocate(11, None).unwrap();
        let slot = table.get(idx, table.generation(idx)).unwrap();
        assert_eq!(slot.read_mode, ReadMode::Idle);
        assert!(!slot.read_shut);
        assert!(!slot.write_interest);
    }
}
