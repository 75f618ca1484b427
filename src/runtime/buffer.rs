//! Per-connection buffers.
//!
//! `ReadBuffer` is a fixed-capacity byte buffer with a head and tail cursor.
//! Socket reads fill the spare space after the tail; the decoder consumes from
//! the head. Compaction (moving unconsumed bytes back to the start) happens
//! internally, only when the tail has hit the end of the storage, so callers
//! just report how many bytes they consumed.
//!
//! `WriteBuffer` holds one encoded response and tracks how much of it has been
//! flushed to the socket.

use bytes::Bytes;

/// Bounded read buffer with cursor-based consumption.
pub struct ReadBuffer {
    /// Backing storage, allocated once.
    storage: Box<[u8]>,
    /// Start of unconsumed data.
    head: usize,
    /// End of unconsumed data.
    tail: usize,
}

impl ReadBuffer {
    /// Create a buffer that can hold at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Number of buffered, unconsumed bytes.
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Bytes that can still be accepted before the buffer is full.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.len()
    }

    /// The unconsumed bytes.
    pub fn data(&self) -> &[u8] {
        &self.storage[self.head..self.tail]
    }

    /// Writable space after the buffered data.
    ///
    /// Compacts first if the tail has reached the end of the storage, so the
    /// returned slice is only empty when the buffer is genuinely full.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        if self.tail == self.storage.len() && self.head > 0 {
            self.compact();
        }
        &mut self.storage[self.tail..]
    }

    /// Mark `n` bytes of the spare space as filled.
    ///
    /// # Panics
    /// Panics if `n` is larger than the spare space.
    pub fn commit(&mut self, n: usize) {
        assert!(self.tail + n <= self.storage.len(), "commit past capacity");
        self.tail += n;
    }

    /// Drop `n` bytes from the front.
    ///
    /// # Panics
    /// Panics if `n` is larger than the buffered length.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len(), "consume past buffered data");
        self.head += n;
        if self.head == self.tail {
            // Empty: rewind for free instead of copying later.
            self.head = 0;
            self.tail = 0;
        }
    }

    /// Discard everything.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    fn compact(&mut self) {
        self.storage.copy_within(self.head..self.tail, 0);
        self.tail -= self.head;
        self.head = 0;
    }
}

/// A single encoded response being flushed to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBuffer {
    frame: Bytes,
    written: usize,
}

impl WriteBuffer {
    pub fn new(frame: Bytes) -> Self {
        Self { frame, written: 0 }
    }

    /// Bytes not yet written.
    pub fn pending(&self) -> &[u8] {
        &self.frame[self.written..]
    }

    /// Record that `n` more bytes reached the socket.
    pub fn advance(&mut self, n: usize) {
        self.written = (self.written + n).min(self.frame.len());
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn len(&self) -> usize {
        self.frame.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.is_empty()
    }

    pub fn is_flushed(&self) -> bool {
        self.written == self.frame.len()
    }
}
