//! Copy Buffer Pool
//!
//! Reusable fixed-size byte buffers for streaming chunk and final-file I/O.
//!
//! # Contract
//!
//! `acquire()` hands out a RAII guard. When the guard drops, the buffer is
//! zeroed before it goes back to the idle list, so bytes from one combine or
//! verification never show up in another. Buffers beyond `max_idle` are
//! freed instead of retained.
//!
//! ```text
//!  acquire() ──► PooledBuffer ──► read/write ──► drop()
//!      │                                           │
//!  [pop idle or allocate]              [zero, push back if room]
//! ```
//!
//! The pool is an ordinary value owned by whoever builds the engine; there is
//! no process-wide instance.

use parking_lot::Mutex;
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::types::{DEFAULT_BUFFER_POOL_SIZE, DEFAULT_COPY_BUFFER_SIZE};

/// Pool of equally sized copy buffers
pub struct BufferPool {
    /// Idle buffers, always zero-filled
    available: Mutex<Vec<Box<[u8]>>>,
    /// Size of every buffer handed out
    buffer_size: usize,
    /// Maximum idle buffers retained
    max_idle: usize,
    /// Total buffers allocated (for metrics)
    created_count: AtomicUsize,
    /// Buffers currently checked out
    active_count: AtomicUsize,
}

impl BufferPool {
    /// Create a pool handing out buffers of `buffer_size` bytes
    pub fn new(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            available: Mutex::new(Vec::with_capacity(max_idle)),
            buffer_size: buffer_size.max(1),
            max_idle,
            created_count: AtomicUsize::new(0),
            active_count: AtomicUsize::new(0),
        }
    }

    /// Size in bytes of each buffer
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take a buffer from the pool, allocating if none is idle
    pub fn acquire(&self) -> PooledBuffer<'_> {
        let buf = self.available.lock().pop();

        let buf = buf.unwrap_or_else(|| {
            self.created_count.fetch_add(1, Ordering::Relaxed);
            vec![0u8; self.buffer_size].into_boxed_slice()
        });

        self.active_count.fetch_add(1, Ordering::Relaxed);

        PooledBuffer { buf, pool: self }
    }

    fn release(&self, mut buf: Box<[u8]>) {
        self.active_count.fetch_sub(1, Ordering::Relaxed);

        buf.fill(0);

        let mut pool = self.available.lock();
        if pool.len() < self.max_idle {
            pool.push(buf);
        }
    }

    /// Get pool statistics
    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            created: self.created_count.load(Ordering::Relaxed),
            active: self.active_count.load(Ordering::Relaxed),
            idle: self.available.lock().len(),
            buffer_size: self.buffer_size,
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_COPY_BUFFER_SIZE, DEFAULT_BUFFER_POOL_SIZE)
    }
}

/// RAII guard - clears the buffer and returns it to the pool on drop
pub struct PooledBuffer<'a> {
    buf: Box<[u8]>,
    pool: &'a BufferPool,
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.release(buf);
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferPoolStats {
    /// Total buffers ever allocated
    pub created: usize,
    /// Buffers currently checked out
    pub active: usize,
    /// Buffers waiting in the pool
    pub idle: usize,
    /// Size of each buffer
    pub buffer_size: usize,
}
