//! Process-wide lock-free pool of payload buffers.
//!
//! Segment payloads are retained across the input/recv boundary and then
//! discarded; allocating each one fresh dominates CPU under load, so every
//! payload buffer is drawn from and returned to this pool.

use bytes::BytesMut;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::LazyLock;

/// Largest datagram any engine will produce or accept; pooled buffers are
/// sized to hold one full segment payload at this MTU.
pub const MTU_LIMIT: usize = 1500;

/// Lock-free bounded free-list of fixed-size buffers.
pub struct BufferPool {
    pool: crossbeam_queue::ArrayQueue<BytesMut>,
    buffer_size: usize,
    hits: AtomicUsize,
}

impl BufferPool {
    pub fn new(max_size: usize, buffer_size: usize) -> Self {
        Self {
            pool: crossbeam_queue::ArrayQueue::new(max_size),
            buffer_size,
            hits: AtomicUsize::new(0),
        }
    }

    /// Get an empty buffer with at least `buffer_size` capacity.
    pub fn try_get(&self) -> BytesMut {
        match self.pool.pop() {
            Some(buf) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => BytesMut::with_capacity(self.buffer_size),
        }
    }

    /// Return a buffer for reuse. Undersized or empty buffers (for example
    /// a payload slot already taken by the ack path) are dropped.
    pub fn try_put(&self, mut buf: BytesMut) {
        if buf.capacity() >= self.buffer_size {
            buf.clear();
            let _ = self.pool.push(buf); // full pool just drops it
        }
    }

    /// Pool statistics as (hits, buffers currently pooled).
    pub fn stats(&self) -> (usize, usize) {
        (self.hits.load(Ordering::Relaxed), self.pool.len())
    }
}

static XMIT_POOL: LazyLock<BufferPool> = LazyLock::new(|| BufferPool::new(4096, MTU_LIMIT));

/// Take an empty payload buffer from the shared pool.
pub fn take() -> BytesMut {
    XMIT_POOL.try_get()
}

/// Return a payload buffer to the shared pool.
pub fn recycle(buf: BytesMut) {
    XMIT_POOL.try_put(buf);
}

/// Shared pool statistics as (hits, buffers currently pooled).
pub fn pool_stats() -> (usize, usize) {
    XMIT_POOL.stats()
}
