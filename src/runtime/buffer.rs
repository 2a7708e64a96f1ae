//! Per-connection growable byte buffer.
//!
//! A single contiguous allocation with a live region `[start, end)` inside it.
//! Bytes are appended at `end` and consumed from `start`, so the buffer works as
//! a FIFO byte queue without shifting on every consume.
//!
//! ## Growth Policy
//!
//! When an append does not fit behind `end`:
//! 1. If the whole allocation can hold `size + len`, the live bytes are moved to
//!    the front (compaction, no allocation).
//! 2. Otherwise the allocation grows to `2 * capacity + len`.
//!
//! Fully consuming the live region resets both offsets to the front, so a
//! connection that keeps up with its peer never compacts or reallocates.

use tracing::error;

/// Default capacity of a freshly created buffer.
pub const DEFAULT_CAPACITY: usize = 16 * 1024;

/// Contiguous byte queue with amortized O(1) append and consume.
#[derive(Debug)]
pub struct ByteBuffer {
    /// Backing storage; `buf.len()` is the capacity.
    buf: Vec<u8>,
    /// Offset of the first live byte.
    start: usize,
    /// Offset one past the last live byte.
    end: usize,
}

impl ByteBuffer {
    /// Create an empty buffer with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create an empty buffer with the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            start: 0,
            end: 0,
        }
    }

    /// Number of live bytes.
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    /// Check if there are no live bytes.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Total bytes allocated.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes available behind the live region without compaction.
    pub fn free_space(&self) -> usize {
        self.buf.len() - self.end
    }

    /// The live bytes.
    pub fn data(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// The live bytes, mutably.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.start..self.end]
    }

    /// Append `data` at the logical end, compacting or growing as needed.
    ///
    /// Aborts the process if the allocation cannot grow.
    pub fn append(&mut self, data: &[u8]) {
        let len = data.len();
        if self.free_space() < len {
            self.make_room(len);
        }
        self.buf[self.end..self.end + len].copy_from_slice(data);
        self.end += len;
    }

    /// Drop `len` bytes from the front of the live region.
    ///
    /// `len` must not exceed `size()`.
    pub fn consume(&mut self, len: usize) {
        debug_assert!(len <= self.size(), "consume past end of buffer");
        self.start = (self.start + len).min(self.end);
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Drop all live bytes, keeping the allocation.
    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    fn make_room(&mut self, len: usize) {
        let size = self.size();
        if self.capacity() >= size + len {
            self.buf.copy_within(self.start..self.end, 0);
            self.start = 0;
            self.end = size;
            return;
        }

        let new_capacity = self.capacity() * 2 + len;
        let additional = new_capacity - self.buf.len();
        if self.buf.try_reserve_exact(additional).is_err() {
            error!(
                capacity = self.capacity(),
                requested = new_capacity,
                "Buffer allocation failed"
            );
            std::process::abort();
        }
        // Offsets stay valid: the live region keeps its position in the new allocation.
        self.buf.resize(new_capacity, 0);
    }
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_consume() {
        let mut buf = ByteBuffer::with_capacity(16);
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 16);

        buf.append(b"hello ");
        buf.append(b"world");
        assert_eq!(buf.size(), 11);
        assert_eq!(buf.data(), b"hello world");

        buf.consume(6);
        assert_eq!(buf.data(), b"world");
        assert_eq!(buf.size(), 5);
    }

    #[test]
    fn test_full_consume_resets_offsets() {
        let mut buf = ByteBuffer::with_capacity(16);
        buf.append(b"0123456789");
        buf.consume(buf.size());

        assert_eq!(buf.size(), 0);
        assert_eq!(buf.free_space(), 16);

        // Reuses the allocation without growing
        buf.append(&[7u8; 16]);
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.data(), &[7u8; 16]);
    }

    #[test]
    fn test_compaction_before_growth() {
        let mut buf = ByteBuffer::with_capacity(16);
        buf.append(b"0123456789ab");
        buf.consume(10);
        assert_eq!(buf.free_space(), 4);

        // 2 live + 10 new fits in 16, so the live bytes move to the front
        buf.append(b"cdefghijkl");
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.data(), b"abcdefghijkl");
        assert_eq!(buf.free_space(), 4);
    }

    #[test]
    fn test_growth_doubles_plus_len() {
        let mut buf = ByteBuffer::with_capacity(8);
        buf.append(b"abcdef");
        buf.consume(2);

        buf.append(b"0123456789");
        assert_eq!(buf.capacity(), 8 * 2 + 10);
        assert_eq!(buf.data(), b"cdef0123456789");
    }

    #[test]
    fn test_interleaved_partial_consume() {
        let mut buf = ByteBuffer::with_capacity(4);
        let mut expected = Vec::new();

        for i in 0..200u8 {
            let chunk = vec![i; (i as usize % 7) + 1];
            buf.append(&chunk);
            expected.extend_from_slice(&chunk);

            let take = buf.size() / 2;
            buf.consume(take);
            expected.drain(..take);

            assert_eq!(buf.data(), &expected[..]);
        }
    }

    #[test]
    fn test_data_mut_and_clear() {
        let mut buf = ByteBuffer::new();
        assert_eq!(buf.capacity(), DEFAULT_CAPACITY);

        buf.append(b"abc");
        buf.data_mut()[0] = b'x';
        assert_eq!(buf.data(), b"xbc");

        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.free_space(), DEFAULT_CAPACITY);
    }
}
