//! Fixed-capacity byte ring buffer for frame reassembly
//!
//! The TCP stream delivers CAN frames back to back with no sync bytes, so
//! the reader only needs to accumulate bytes and peel off 13-byte chunks.
//! Consuming from the front is O(1) (pointer advance, no shifting).

/// Fixed-capacity ring buffer with O(1) advance
pub struct RingBuffer<const N: usize = 2048> {
    data: [u8; N],
    head: usize, // write position (next empty slot)
    tail: usize, // read position (first valid byte)
    len: usize,  // number of bytes available
}

impl<const N: usize> RingBuffer<N> {
    /// Create a new empty ring buffer
    pub const fn new() -> Self {
        Self {
            data: [0u8; N],
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    /// Append bytes to the buffer
    ///
    /// Bytes that would overflow the capacity are dropped.
    #[inline]
    pub fn extend(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if self.len < N {
                self.data[self.head] = b;
                self.head = (self.head + 1) % N;
                self.len += 1;
            }
        }
    }

    /// Consume n bytes from the front
    #[inline]
    pub fn advance(&mut self, n: usize) {
        let n = n.min(self.len);
        self.tail = (self.tail + n) % N;
        self.len -= n;
    }

    /// Number of bytes available to read
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read the byte at logical index without consuming (handles wraparound)
    #[inline]
    pub fn get(&self, index: usize) -> Option<u8> {
        if index < self.len {
            Some(self.data[(self.tail + index) % N])
        } else {
            None
        }
    }

    /// Copy the front of the buffer into `out` without consuming
    ///
    /// Returns false if fewer than `out.len()` bytes are buffered.
    #[inline]
    pub fn peek_into(&self, out: &mut [u8]) -> bool {
        if out.len() > self.len {
            return false;
        }
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.data[(self.tail + i) % N];
        }
        true
    }
}

impl<const N: usize> Default for RingBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}
