//! Fixed-capacity byte ring with contiguous read and write views.

use std::fmt;

/// A fixed-capacity byte ring buffer.
///
/// The buffer keeps two monotonically growing byte counters; the valid
/// region is `[read % capacity, write % capacity)`. Producers obtain the
/// contiguous writable view with [`write_slice`], fill some prefix of it and
/// [`commit`] exactly that many bytes; consumers mirror this with
/// [`read_slice`] and [`consume`]. Views are contiguous, so a full
/// traversal of wrapped data takes at most two rounds.
///
/// [`write_slice`]: RingBuffer::write_slice
/// [`commit`]: RingBuffer::commit
/// [`read_slice`]: RingBuffer::read_slice
/// [`consume`]: RingBuffer::consume
///
/// ```
/// use evio::RingBuffer;
///
/// let mut rb = RingBuffer::with_capacity(8);
/// let ws = rb.write_slice();
/// ws[..3].copy_from_slice(b"abc");
/// rb.commit(3);
/// assert_eq!(rb.read_slice(), b"abc");
/// rb.consume(2);
/// assert_eq!(rb.read_slice(), b"c");
/// ```
pub struct RingBuffer {
    buf: Box<[u8]>,
    read: u64,
    write: u64,
}

impl RingBuffer {
    /// Creates a ring able to hold `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> RingBuffer {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        RingBuffer {
            buf: vec![0; capacity].into_boxed_slice(),
            read: 0,
            write: 0,
        }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        (self.write - self.read) as usize
    }

    /// Returns true if no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    /// Returns true if no more bytes can be written.
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Number of bytes that can still be written.
    pub fn space(&self) -> usize {
        self.capacity() - self.len()
    }

    /// The contiguous writable view starting at the write position.
    ///
    /// May be shorter than [`space`] when the free region wraps; commit and
    /// call again to reach the remainder.
    ///
    /// [`space`]: RingBuffer::space
    pub fn write_slice(&mut self) -> &mut [u8] {
        let cap = self.capacity();
        let start = (self.write % cap as u64) as usize;
        let end = if self.space() >= cap - start {
            cap
        } else {
            start + self.space()
        };
        &mut self.buf[start..end]
    }

    /// Marks `n` bytes of the writable view as filled.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.space());
        self.write += n as u64;
    }

    /// The contiguous readable view starting at the read position.
    ///
    /// May be shorter than [`len`] when the valid region wraps.
    ///
    /// [`len`]: RingBuffer::len
    pub fn read_slice(&self) -> &[u8] {
        let cap = self.capacity();
        let start = (self.read % cap as u64) as usize;
        let end = if self.len() >= cap - start {
            cap
        } else {
            start + self.len()
        };
        &self.buf[start..end]
    }

    /// Discards `n` bytes from the read side.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.read += n as u64;
    }

    /// Drops all buffered bytes.
    pub fn clear(&mut self) {
        self.read = self.write;
    }

    /// Appends every buffered byte to `out` and consumes them, crossing the
    /// wrap seam if needed.
    pub fn copy_into(&mut self, out: &mut Vec<u8>) {
        while !self.is_empty() {
            let chunk = self.read_slice();
            out.extend_from_slice(chunk);
            let n = chunk.len();
            self.consume(n);
        }
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::RingBuffer;

    #[test]
    fn fill_and_drain() {
        let mut rb = RingBuffer::with_capacity(8);
        assert!(rb.is_empty());
        assert_eq!(rb.space(), 8);

        let ws = rb.write_slice();
        assert_eq!(ws.len(), 8);
        ws[..5].copy_from_slice(b"hello");
        rb.commit(5);
        assert_eq!(rb.len(), 5);
        assert_eq!(rb.read_slice(), b"hello");

        rb.consume(5);
        assert!(rb.is_empty());
        assert_eq!(rb.space(), 8);
    }

    #[test]
    fn views_wrap() {
        let mut rb = RingBuffer::with_capacity(8);
        rb.write_slice()[..6].copy_from_slice(b"abcdef");
        rb.commit(6);
        rb.consume(4);

        // Free region wraps: contiguous writable view stops at the end of
        // the backing array.
        let ws = rb.write_slice();
        assert_eq!(ws.len(), 2);
        ws.copy_from_slice(b"gh");
        rb.commit(2);
        rb.write_slice()[..3].copy_from_slice(b"ijk");
        rb.commit(3);

        assert_eq!(rb.len(), 7);
        assert_eq!(rb.read_slice(), b"efgh");
        let mut all = Vec::new();
        rb.copy_into(&mut all);
        assert_eq!(all, b"efghijk");
        assert!(rb.is_empty());
    }

    #[test]
    fn full_then_clear() {
        let mut rb = RingBuffer::with_capacity(4);
        rb.write_slice().copy_from_slice(b"wxyz");
        rb.commit(4);
        assert!(rb.is_full());
        assert_eq!(rb.write_slice().len(), 0);

        rb.clear();
        assert!(rb.is_empty());
        assert_eq!(rb.write_slice().len(), 4);
    }

    #[test]
    fn counters_stay_monotonic() {
        let mut rb = RingBuffer::with_capacity(3);
        for round in 0..100u8 {
            rb.write_slice()[0] = round;
            rb.commit(1);
            assert_eq!(rb.read_slice()[0], round);
            rb.consume(1);
        }
        assert!(rb.is_empty());
    }
}
