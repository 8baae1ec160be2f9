//! Reusable scratch buffers for chunked streaming.
//!
//! Senders read their input in chunk-sized pieces into a pooled buffer and
//! copy each piece into an outbound frame. Buffers go back to the pool once
//! the stream is done. The pool is bounded: a full pool drops returned
//! buffers, and buffers that shrank below the chunk size are not kept.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;

/// Default number of idle buffers kept per pool.
pub const DEFAULT_POOLED_BUFFERS: usize = 16;

/// Counters describing pool effectiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// `acquire` calls served from the pool.
    pub hits: u64,
    /// `acquire` calls that had to allocate.
    pub misses: u64,
    /// Buffers currently idle in the pool.
    pub idle: usize,
}

/// Bounded free list of `BytesMut` buffers.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<BytesMut>>,
    buffer_size: usize,
    max_idle: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BufferPool {
    /// Create a pool of `buffer_size` byte buffers keeping at most `max_idle`.
    pub fn new(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(max_idle)),
            buffer_size,
            max_idle,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Get an empty buffer with at least `buffer_size` capacity.
    pub fn acquire(&self) -> BytesMut {
        match self.buffers.lock().pop() {
            Some(buffer) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                buffer
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.buffer_size)
            }
        }
    }

    /// Return a buffer for reuse. Contents are cleared first.
    pub fn release(&self, mut buffer: BytesMut) {
        buffer.clear();
        if buffer.capacity() < self.buffer_size {
            return;
        }
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_idle {
            buffers.push(buffer);
        }
    }

    /// Size of buffers handed out by this pool.
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            idle: self.buffers.lock().len(),
        }
    }
}
