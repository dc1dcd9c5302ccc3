//! Shared byte-buffer pool.
//!
//! Every packet payload travels in a buffer rented from this pool, so the
//! hot receive/dispatch path does not allocate per packet. The pool is a
//! lock-free free list; exhaustion falls back to plain allocation rather
//! than blocking. Returned buffers are cleared before reuse so key material
//! and plaintext never leak between rentals.
//!
//! Ownership rule: whoever rents a buffer owns it until it is released or
//! embedded in an outbound message, at which point the transport releases
//! it after transmission.

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// Standard rental size, large enough for every non-blob frame.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Buffers pre-allocated at startup.
pub const DEFAULT_POOL_SIZE: usize = 256;

#[derive(Clone)]
pub struct BufferPool {
    pool: Arc<ArrayQueue<Vec<u8>>>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, pool_size: usize) -> Self {
        let pool = Arc::new(ArrayQueue::new(pool_size));
        for _ in 0..pool_size {
            let _ = pool.push(vec![0u8; buffer_size]);
        }
        Self { pool, buffer_size }
    }

    /// Rent a buffer holding at least `len` bytes.
    ///
    /// Requests beyond the standard size are served by a one-off
    /// allocation instead of the free list.
    pub fn acquire(&self, len: usize) -> Vec<u8> {
        if len > self.buffer_size {
            return vec![0u8; len];
        }
        self.pool.pop().unwrap_or_else(|| vec![0u8; self.buffer_size])
    }

    /// Return a buffer to the pool.
    ///
    /// Content is zeroed and the buffer restored to the standard size;
    /// undersized buffers and returns into a full free list are dropped.
    pub fn release(&self, mut buffer: Vec<u8>) {
        if buffer.capacity() < self.buffer_size {
            return;
        }
        buffer.clear();
        buffer.resize(self.buffer_size, 0);
        let _ = self.pool.push(buffer);
    }

    pub fn available(&self) -> usize {
        self.pool.len()
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_POOL_SIZE)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("available", &self.available())
            .field("capacity", &self.capacity())
            .finish()
    }
}
