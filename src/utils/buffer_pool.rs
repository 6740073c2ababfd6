//! # Buffer Pool
//!
//! Pooled read/write byte buffers used by every formatter and by the frame codec.
//!
//! A [`PooledBuffer`] tracks two cursors over one region:
//! `read <= written <= span`. Writers ask for a span with [`PooledBuffer::get_span`],
//! fill it, then commit with [`PooledBuffer::advance`]. Readers look at
//! [`PooledBuffer::unread`] and consume with [`PooledBuffer::read_advance`].
//! Dropping the buffer hands its storage back to the [`BufferPool`] it came from.
//!
//! ## Usage
//! ```rust
//! use linkwire::config::PoolConfig;
//! use linkwire::utils::buffer_pool::BufferPool;
//!
//! let pool = BufferPool::new(&PoolConfig::default());
//! let mut buf = pool.rent();
//! buf.write_slice(b"ping");
//! assert_eq!(buf.unread(), b"ping");
//! buf.read_advance(2).unwrap();
//! assert_eq!(buf.unread(), b"ng");
//! drop(buf); // storage returns to the pool
//! assert_eq!(pool.retained(), 1);
//! ```

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::config::PoolConfig;
use crate::error::{ProtocolError, Result};
use crate::utils::object_pool::{ObjectPool, PooledObjectPolicy};

/// Allocation rules for pooled byte storage
#[derive(Debug, Clone)]
pub struct BufferPolicy {
    initial_capacity: usize,
    max_capacity: usize,
}

impl BufferPolicy {
    /// Span length to grow to when `needed` bytes must fit and `current` are allocated.
    ///
    /// Doubles the current span so repeated small writes stay amortized.
    pub fn grow_to(&self, current: usize, needed: usize) -> usize {
        let doubled = current.saturating_mul(2);
        needed.max(doubled).max(self.initial_capacity)
    }
}

impl PooledObjectPolicy<BytesMut> for BufferPolicy {
    fn create(&self) -> BytesMut {
        BytesMut::with_capacity(self.initial_capacity)
    }

    fn release(&self, item: &mut BytesMut) -> bool {
        if item.capacity() > self.max_capacity {
            return false;
        }
        item.clear();
        true
    }
}

/// Thread-safe pool of byte storage; clones share the same pool.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<ObjectPool<BytesMut, BufferPolicy>>,
}

impl BufferPool {
    /// Create a buffer pool from configuration
    pub fn new(config: &PoolConfig) -> Self {
        let policy = BufferPolicy {
            initial_capacity: config.initial_buffer_capacity.max(1),
            max_capacity: config.max_buffer_capacity,
        };
        Self {
            inner: Arc::new(ObjectPool::new(policy, config.max_retained)),
        }
    }

    /// Rent an empty buffer
    pub fn rent(&self) -> PooledBuffer {
        PooledBuffer {
            data: self.inner.get(),
            read: 0,
            written: 0,
            policy: self.inner.policy().clone(),
            pool: Some(Arc::clone(&self.inner)),
        }
    }

    /// Rent a buffer and copy `bytes` into it
    pub fn rent_from(&self, bytes: &[u8]) -> PooledBuffer {
        let mut buf = self.rent();
        buf.write_slice(bytes);
        buf
    }

    /// Number of idle buffers currently held by the pool
    pub fn retained(&self) -> usize {
        self.inner.retained()
    }

    /// Configured retention limit
    pub fn max_retained(&self) -> usize {
        self.inner.max_retained()
    }

    /// Rentals served from a recycled buffer
    pub fn hits(&self) -> u64 {
        self.inner.hits()
    }

    /// Rentals that allocated fresh storage
    pub fn misses(&self) -> u64 {
        self.inner.misses()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(&PoolConfig::default())
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("retained", &self.retained())
            .field("max_retained", &self.max_retained())
            .finish()
    }
}

/// A leased byte region with independent read and write cursors.
///
/// The buffer is returned to its pool exactly once, when it is dropped.
/// Ownership makes a second release or a use after release unrepresentable.
pub struct PooledBuffer {
    // Zero-initialised span; `data.len()` is the end of the writable span.
    data: BytesMut,
    read: usize,
    written: usize,
    policy: BufferPolicy,
    pool: Option<Arc<ObjectPool<BytesMut, BufferPolicy>>>,
}

impl PooledBuffer {
    /// A buffer that is not attached to any pool
    pub fn detached(capacity: usize) -> Self {
        let config = PoolConfig::default();
        Self {
            data: BytesMut::with_capacity(capacity),
            read: 0,
            written: 0,
            policy: BufferPolicy {
                initial_capacity: capacity.max(1),
                max_capacity: config.max_buffer_capacity,
            },
            pool: None,
        }
    }

    /// Writable view of at least `size_hint` bytes (at least one byte for a zero hint).
    ///
    /// Grows the span through the pool's allocation policy when the remaining
    /// space is too small. Bytes written here are not visible until [`advance`](Self::advance).
    pub fn get_span(&mut self, size_hint: usize) -> &mut [u8] {
        let needed = size_hint.max(1);
        if self.data.len() - self.written < needed {
            let target = self.policy.grow_to(self.data.len(), self.written + needed);
            self.data.resize(target, 0);
        }
        &mut self.data[self.written..]
    }

    /// Commit `n` bytes previously written into the span
    pub fn advance(&mut self, n: usize) -> Result<()> {
        let available = self.data.len() - self.written;
        if n > available {
            return Err(ProtocolError::BufferOverflow {
                requested: n,
                available,
            });
        }
        self.written += n;
        Ok(())
    }

    /// Copy `src` to the write cursor and commit it
    pub fn write_slice(&mut self, src: &[u8]) {
        if src.is_empty() {
            return;
        }
        let span = self.get_span(src.len());
        span[..src.len()].copy_from_slice(src);
        self.written += src.len();
    }

    /// Bytes written but not yet consumed
    pub fn unread(&self) -> &[u8] {
        &self.data[self.read..self.written]
    }

    /// Copy of the unread bytes that outlives this buffer
    pub fn unread_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.unread())
    }

    /// Consume `n` unread bytes
    pub fn read_advance(&mut self, n: usize) -> Result<()> {
        let available = self.remaining();
        if n > available {
            return Err(ProtocolError::BufferUnderflow {
                needed: n,
                available,
            });
        }
        self.read += n;
        Ok(())
    }

    /// Consume and return the next `n` unread bytes
    pub fn read_exact(&mut self, n: usize) -> Result<&[u8]> {
        let start = self.read;
        self.read_advance(n)?;
        Ok(&self.data[start..start + n])
    }

    /// Consume and return all unread bytes
    pub fn read_to_end(&mut self) -> &[u8] {
        let start = self.read;
        self.read = self.written;
        &self.data[start..self.written]
    }

    /// Number of unread bytes
    pub fn remaining(&self) -> usize {
        self.written - self.read
    }

    /// Total bytes committed since the last clear
    pub fn written(&self) -> usize {
        self.written
    }

    /// Bytes consumed since the last clear
    pub fn consumed(&self) -> usize {
        self.read
    }

    /// Whether every written byte has been read
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Allocated span length
    pub fn capacity(&self) -> usize {
        self.data.len().max(self.data.capacity())
    }

    /// Reset both cursors, keeping the storage
    pub fn clear(&mut self) {
        self.read = 0;
        self.written = 0;
    }

    /// Whether the buffer will return to a pool when dropped
    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("read", &self.read)
            .field("written", &self.written)
            .field("span", &self.data.len())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(std::mem::take(&mut self.data));
        }
    }
}
