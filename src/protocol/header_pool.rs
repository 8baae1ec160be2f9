//! Header buffer pool for zero-allocation header encoding.
//!
//! Each connection writer owns one pool. A batch of outbound frames has its
//! headers encoded into the pooled slots, and the slots are handed to
//! `write_vectored` next to the payloads. The slots are reused for every
//! batch, so steady-state writing allocates nothing for headers.
//!
//! # Usage
//!
//! ```ignore
//! use relaywire::protocol::HeaderPool;
//!
//! let mut pool = HeaderPool::with_capacity(64);
//! let encoded = pool.encode_batch(batch.iter().map(|f| &f.header));
//! // encoded[i] is the wire header of batch[i]
//! ```

use super::wire_format::{Header, HEADER_SIZE};

/// A pool of pre-allocated header buffers, sized to a writer batch.
///
/// Not shared: the owning writer task is the only user, so no locking.
#[derive(Debug)]
pub struct HeaderPool {
    /// Pre-allocated header buffers.
    buffers: Vec<[u8; HEADER_SIZE]>,
}

impl HeaderPool {
    /// Create a pool with `capacity` zeroed slots.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffers: vec![[0u8; HEADER_SIZE]; capacity],
        }
    }

    /// Encode every header into consecutive pooled slots.
    ///
    /// Returns the filled slots, in input order. The pool grows if the batch
    /// is larger than its current capacity; previously filled slots are
    /// overwritten.
    pub fn encode_batch<'a, I>(&mut self, headers: I) -> &[[u8; HEADER_SIZE]]
    where
        I: IntoIterator<Item = &'a Header>,
    {
        let mut count = 0;
        for header in headers {
            if count == self.buffers.len() {
                self.buffers.push([0u8; HEADER_SIZE]);
            }
            header.encode_into(&mut self.buffers[count]);
            count += 1;
        }
        &self.buffers[..count]
    }

    /// Number of slots currently allocated.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffers.len()
    }
}

impl Default for HeaderPool {
    fn default() -> Self {
        Self::with_capacity(16)
    }
}
