//! Fixed-capacity byte ring with absolute-position addressing.
//!
//! One ring per session. Single-writer (the session's host read-loop);
//! concurrent readers synchronize through the owning `Session`'s lock, since
//! the ring itself is not internally thread-safe. Writes are O(1) amortized;
//! `copy_since` is O(n) in the bytes copied.

use bytes::Bytes;

pub struct ScrollbackRing {
    buf: Vec<u8>,
    capacity: usize,
    /// Index into `buf` of the oldest retained byte.
    head: usize,
    /// Number of valid bytes currently stored, starting at `head`.
    count: usize,
    total_bytes_written: u64,
}

impl ScrollbackRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ScrollbackRing capacity must be positive");
        Self {
            buf: vec![0u8; capacity],
            capacity,
            head: 0,
            count: 0,
            total_bytes_written: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn total_bytes_written(&self) -> u64 {
        self.total_bytes_written
    }

    /// Absolute position of the oldest byte still retained.
    pub fn tail_position(&self) -> u64 {
        self.total_bytes_written - self.count as u64
    }

    /// Append bytes, evicting the oldest data if the write would exceed
    /// capacity. `total_bytes_written` always advances by `bytes.len()`,
    /// even when every byte written is immediately evicted.
    pub fn write(&mut self, bytes: &[u8]) {
        self.total_bytes_written += bytes.len() as u64;

        if bytes.len() >= self.capacity {
            // The write alone overflows the ring: keep only its tail.
            let start = bytes.len() - self.capacity;
            self.buf.copy_from_slice(&bytes[start..]);
            self.head = 0;
            self.count = self.capacity;
            return;
        }

        let incoming = bytes.len();
        let overflow = (self.count + incoming).saturating_sub(self.capacity);
        if overflow > 0 {
            // Discard the oldest `overflow` bytes to make room.
            self.head = (self.head + overflow) % self.capacity;
            self.count -= overflow;
        }

        let tail = (self.head + self.count) % self.capacity;
        let first_len = incoming.min(self.capacity - tail);
        self.buf[tail..tail + first_len].copy_from_slice(&bytes[..first_len]);
        if first_len < incoming {
            let rest = incoming - first_len;
            self.buf[..rest].copy_from_slice(&bytes[first_len..]);
        }
        self.count += incoming;
    }

    /// Current contents, oldest first.
    pub fn snapshot(&self) -> Bytes {
        let mut out = Vec::with_capacity(self.count);
        let tail = (self.head + self.count) % self.capacity;
        if self.head < tail || self.count == 0 {
            out.extend_from_slice(&self.buf[self.head..self.head + self.count]);
        } else {
            out.extend_from_slice(&self.buf[self.head..]);
            out.extend_from_slice(&self.buf[..tail]);
        }
        Bytes::from(out)
    }

    /// Copy every byte from absolute `position` to `total_bytes_written`.
    /// Returns `None` iff `position < tail_position` (those bytes have been
    /// evicted and the caller must resync via a fresh snapshot).
    pub fn copy_since(&self, position: u64) -> Option<Bytes> {
        if position < self.tail_position() || position > self.total_bytes_written {
            return None;
        }
        if position == self.total_bytes_written {
            return Some(Bytes::new());
        }
        let skip = (position - self.tail_position()) as usize;
        let start = (self.head + skip) % self.capacity;
        let len = self.count - skip;
        let mut out = Vec::with_capacity(len);
        let end = (start + len) % self.capacity;
        if start < end || len == 0 {
            out.extend_from_slice(&self.buf[start..start + len]);
        } else {
            out.extend_from_slice(&self.buf[start..]);
            out.extend_from_slice(&self.buf[..end]);
        }
        Some(Bytes::from(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_snapshot_roundtrip() {
        let mut ring = ScrollbackRing::new(16);
        ring.write(b"hello");
        ring.write(b" world");
        assert_eq!(ring.snapshot(), Bytes::from_static(b"hello world"));
        assert_eq!(ring.total_bytes_written(), 11);
        assert_eq!(ring.tail_position(), 0);
    }

    #[test]
    fn eviction_on_overflow_keeps_most_recent_bytes() {
        let mut ring = ScrollbackRing::new(8);
        ring.write(b"abcdefgh"); // exactly fills
        ring.write(b"ij"); // evicts "ab"
        assert_eq!(ring.snapshot(), Bytes::from_static(b"cdefghij"));
        assert_eq!(ring.total_bytes_written(), 10);
        assert_eq!(ring.tail_position(), 2);
    }

    #[test]
    fn write_larger_than_capacity_keeps_only_the_tail() {
        let mut ring = ScrollbackRing::new(4);
        ring.write(b"0123456789");
        assert_eq!(ring.snapshot(), Bytes::from_static(b"6789"));
        assert_eq!(ring.total_bytes_written(), 10);
        assert_eq!(ring.tail_position(), 6);
    }

    #[test]
    fn copy_since_exact_range() {
        let mut ring = ScrollbackRing::new(8);
        ring.write(b"abcdefgh");
        ring.write(b"ij"); // tail_position now 2, content "cdefghij"
        assert_eq!(ring.copy_since(2).unwrap(), Bytes::from_static(b"cdefghij"));
        assert_eq!(ring.copy_since(8).unwrap(), Bytes::from_static(b"ij"));
        assert_eq!(ring.copy_since(10).unwrap(), Bytes::new());
    }

    #[test]
    fn copy_since_before_tail_reports_eviction() {
        let mut ring = ScrollbackRing::new(8);
        ring.write(b"abcdefgh");
        ring.write(b"ij");
        assert!(ring.copy_since(0).is_none());
        assert!(ring.copy_since(1).is_none());
    }

    #[test]
    fn ring_monotonicity_across_many_writes() {
        let mut ring = ScrollbackRing::new(37);
        let mut expected_total = 0u64;
        for i in 0..500u32 {
            let chunk = format!("chunk-{i}-");
            expected_total += chunk.len() as u64;
            ring.write(chunk.as_bytes());
            assert_eq!(ring.total_bytes_written(), expected_total);
            assert!(ring.count() <= ring.capacity());
        }
    }
}
