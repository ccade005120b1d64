//! Peek buffer: bytes already pulled from the kernel but not yet consumed by
//! the application.
//!
//! The buffered-read discipline offers this buffer to the application as one
//! contiguous slice; consumed prefixes are released in O(1) via `advance`.
//! Bytes left over when the application switches back to exact-size reads
//! stay here and are drained first, so read-ahead never loses stream bytes.

use bytes::{Buf, BytesMut};

/// Read chunk used to grow the peek buffer on each kernel read.
pub const IO_BUFFER_SIZE: usize = 16 * 1024;

pub(crate) struct PeekBuffer {
    buf: BytesMut,
}

impl PeekBuffer {
    pub fn new() -> Self {
        PeekBuffer {
            buf: BytesMut::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The buffered bytes as one contiguous slice.
    pub fn data(&self) -> &[u8] {
        &self.buf[..]
    }

    /// Extend with zeroed space for one kernel read and return the spare
    /// tail. Pair with `commit` once the read size is known.
    pub fn grow_for_read(&mut self) -> &mut [u8] {
        let old = self.buf.len();
        self.buf.resize(old + IO_BUFFER_SIZE, 0);
        &mut self.buf[old..]
    }

    /// Shrink back to `old + read` after a kernel read of `read` bytes into
    /// the spare tail (`read` = 0 undoes the growth entirely).
    pub fn commit(&mut self, old: usize, read: usize) {
        debug_assert!(read <= IO_BUFFER_SIZE);
        self.buf.truncate(old + read);
    }

    /// Release the first `n` buffered bytes.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.buf.len());
        self.buf.advance(n);
    }

    /// Move up to `dst.len()` bytes from the front into `dst`; returns the
    /// count moved.
    pub fn drain_into(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.buf.len());
        dst[..n].copy_from_slice(&self.buf[..n]);
        self.buf.advance(n);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(data: &[u8]) -> PeekBuffer {
        let mut peek = PeekBuffer::new();
        let old = peek.len();
        peek.grow_for_read()[..data.len()].copy_from_slice(data);
        peek.commit(old, data.len());
        peek
    }

    #[test]
    fn grow_and_commit() {
        let mut peek = PeekBuffer::new();
        let spare = peek.grow_for_read();
        assert_eq!(spare.len(), IO_BUFFER_SIZE);
        spare[..5].copy_from_slice(b"hello");
        peek.commit(0, 5);
        assert_eq!(peek.data(), b"hello");
    }

    #[test]
    fn commit_zero_undoes_growth() {
        let mut peek = filled(b"abc");
        let old = peek.len();
        peek.grow_for_read();
        peek.commit(old, 0);
        assert_eq!(peek.data(), b"abc");
    }

    #[test]
    fn consume_releases_prefix() {
        let mut peek = filled(b"0123456789");
        peek.consume(4);
        assert_eq!(peek.data(), b"456789");
        peek.consume(6);
        assert!(peek.is_empty());
    }

    #[test]
    fn drain_into_smaller_dst() {
        let mut peek = filled(b"0123456789");
        let mut dst = [0u8; 6];
        assert_eq!(peek.drain_into(&mut dst), 6);
        assert_eq!(&dst, b"012345");
        assert_eq!(peek.data(), b"6789");
    }

    #[test]
    fn drain_into_larger_dst() {
        let mut peek = filled(b"abc");
        let mut dst = [0u8; 8];
        assert_eq!(peek.drain_into(&mut dst), 3);
        assert_eq!(&dst[..3], b"abc");
        assert!(peek.is_empty());
    }

    #[test]
    fn growth_appends_after_existing() {
        let mut peek = filled(b"head");
        let old = peek.len();
        peek.grow_for_read()[..4].copy_from_slice(b"tail");
        peek.commit(old, 4);
        assert_eq!(peek.data(), b"headtail");
    }
}
