//! # Object Pool
//!
//! Bounded, thread-safe pool of reusable instances.
//!
//! A [`PooledObjectPolicy`] decides how instances are created and whether a
//! released instance is fit for reuse. Released instances beyond
//! `max_retained` are dropped instead of kept.
//!
//! ## Usage
//! ```rust
//! use linkwire::utils::object_pool::{ObjectPool, PooledObjectPolicy};
//!
//! struct Scratch;
//!
//! impl PooledObjectPolicy<Vec<u32>> for Scratch {
//!     fn create(&self) -> Vec<u32> {
//!         Vec::with_capacity(16)
//!     }
//!
//!     fn release(&self, item: &mut Vec<u32>) -> bool {
//!         item.clear();
//!         true
//!     }
//! }
//!
//! let pool = ObjectPool::new(Scratch, 4);
//! let mut v = pool.get();
//! v.push(7);
//! pool.release(v);
//! assert_eq!(pool.retained(), 1);
//! assert!(pool.get().is_empty());
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::default_max_retained;

/// Creation and recycling rules for pooled instances.
pub trait PooledObjectPolicy<T>: Send + Sync {
    /// Build a fresh instance when the pool is empty.
    fn create(&self) -> T;

    /// Reset `item` for reuse. Returning `false` discards it.
    fn release(&self, item: &mut T) -> bool;
}

/// Thread-safe pool of `T` instances governed by a policy.
pub struct ObjectPool<T, P> {
    items: Mutex<Vec<T>>,
    policy: P,
    max_retained: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<T, P> ObjectPool<T, P>
where
    P: PooledObjectPolicy<T>,
{
    /// Create a pool that keeps at most `max_retained` idle instances.
    pub fn new(policy: P, max_retained: usize) -> Self {
        Self {
            items: Mutex::new(Vec::with_capacity(max_retained)),
            policy,
            max_retained,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Create a pool retaining twice the available parallelism.
    pub fn with_policy(policy: P) -> Self {
        Self::new(policy, default_max_retained())
    }

    /// Take an idle instance, or create one through the policy.
    pub fn get(&self) -> T {
        let reused = self.items.lock().ok().and_then(|mut items| items.pop());
        match reused {
            Some(item) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                item
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.policy.create()
            }
        }
    }

    /// Return an instance. It is dropped when the policy rejects it or the pool is full.
    pub fn release(&self, mut item: T) {
        if !self.policy.release(&mut item) {
            return;
        }
        if let Ok(mut items) = self.items.lock() {
            if items.len() < self.max_retained {
                items.push(item);
            }
        }
    }

    /// Number of idle instances currently held
    pub fn retained(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    /// Configured retention limit
    pub fn max_retained(&self) -> usize {
        self.max_retained
    }

    /// Number of `get` calls served from retained instances
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of `get` calls that had to create an instance
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Access the policy
    pub fn policy(&self) -> &P {
        &self.policy
    }
}

impl<T, P> ObjectPool<T, P>
where
    T: Send + 'static,
    P: PooledObjectPolicy<T> + 'static,
{
    /// Take an instance wrapped in a guard that releases it on drop.
    pub fn lease(self: &Arc<Self>) -> Lease<T, P> {
        Lease {
            item: Some(self.get()),
            pool: Arc::clone(self),
        }
    }
}

/// An instance borrowed from an [`ObjectPool`], released exactly once on drop.
pub struct Lease<T, P>
where
    P: PooledObjectPolicy<T>,
{
    item: Option<T>,
    pool: Arc<ObjectPool<T, P>>,
}

impl<T, P> Lease<T, P>
where
    P: PooledObjectPolicy<T>,
{
    /// Keep the instance and never return it to the pool
    pub fn detach(mut self) -> Option<T> {
        self.item.take()
    }
}

impl<T, P> Deref for Lease<T, P>
where
    P: PooledObjectPolicy<T>,
{
    type Target = T;

    #[allow(clippy::expect_used)]
    fn deref(&self) -> &T {
        // Only `detach` and `drop` take the item, and both consume the lease.
        self.item.as_ref().expect("lease holds its item until dropped")
    }
}

impl<T, P> DerefMut for Lease<T, P>
where
    P: PooledObjectPolicy<T>,
{
    #[allow(clippy::expect_used)]
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("lease holds its item until dropped")
    }
}

impl<T, P> Drop for Lease<T, P>
where
    P: PooledObjectPolicy<T>,
{
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.release(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        created: AtomicUsize,
        keep: bool,
    }

    impl PooledObjectPolicy<Vec<u8>> for Counting {
        fn create(&self) -> Vec<u8> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Vec::with_capacity(8)
        }

        fn release(&self, item: &mut Vec<u8>) -> bool {
            item.clear();
            self.keep
        }
    }

    fn counting(keep: bool) -> Counting {
        Counting {
            created: AtomicUsize::new(0),
            keep,
        }
    }

    #[test]
    fn test_get_reuses_released_instance() {
        let pool = ObjectPool::new(counting(true), 4);
        let mut a = pool.get();
        a.extend_from_slice(b"abc");
        pool.release(a);

        let b = pool.get();
        assert!(b.is_empty());
        assert!(b.capacity() >= 3);
        assert_eq!(pool.policy().created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.hits(), 1);
        assert_eq!(pool.misses(), 1);
    }

    #[test]
    fn test_rejected_release_is_discarded() {
        let pool = ObjectPool::new(counting(false), 4);
        let a = pool.get();
        pool.release(a);
        assert_eq!(pool.retained(), 0);
    }

    #[test]
    fn test_retention_is_bounded() {
        let pool = ObjectPool::new(counting(true), 2);
        let items: Vec<_> = (0..5).map(|_| pool.get()).collect();
        for item in items {
            pool.release(item);
        }
        assert_eq!(pool.retained(), 2);
    }

    #[test]
    fn test_lease_returns_on_drop() {
        let pool = Arc::new(ObjectPool::new(counting(true), 2));
        {
            let mut lease = pool.lease();
            lease.push(1);
        }
        assert_eq!(pool.retained(), 1);

        let lease = pool.lease();
        let kept = lease.detach();
        assert!(kept.is_some());
        assert_eq!(pool.retained(), 0);
    }

    #[test]
    fn test_default_retention_tracks_parallelism() {
        let pool = ObjectPool::with_policy(counting(true));
        assert_eq!(pool.max_retained(), default_max_retained());
        assert!(pool.max_retained() >= 2);
    }
}
