//! # Concurrent Operate
//!
//! Exclusive, keyed access to pooled OS resources such as open files.
//!
//! At most one [`ConcurrentOperation`] exists per key at any time. A second
//! caller either fails fast with [`ProtocolError::ResourceBusy`]
//! ([`ConcurrentOperate::try_acquire`]) or waits for the holder to release it
//! ([`ConcurrentOperate::acquire`]). It never opens a second handle for
//! the same key.
//!
//! Releasing an operation parks its resource as idle under the same key, so
//! the next acquire reuses the open handle after [`OperationPolicy::try_reset`].
//! A pool created with `max_idle == 0` parks nothing: every release drops the
//! handle. Otherwise handles are dropped when evicted or closed, or when the
//! pool shuts down.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{constants, ProtocolError, Result};

/// How resources are materialized and recycled.
pub trait OperationPolicy: Send + Sync + 'static {
    /// Identity of a resource; one live operation per key
    type Key: Hash + Eq + Clone + Debug + Send + Sync + 'static;
    /// Descriptor used to create the resource
    type Data;
    /// The pooled OS-level resource
    type Resource: Send + 'static;

    /// Materialize the resource for `key`
    fn create(&self, key: &Self::Key, data: &Self::Data) -> Result<Self::Resource>;

    /// Prepare an idle resource for reuse. Returning `false` replaces it.
    fn try_reset(&self, _resource: &mut Self::Resource) -> bool {
        true
    }
}

enum Slot<R> {
    Idle(R),
    CheckedOut { close_on_release: bool },
}

struct Slots<K, R> {
    map: HashMap<K, Slot<R>>,
    idle_order: VecDeque<K>,
    disposed: bool,
}

impl<K: Hash + Eq + Clone, R> Slots<K, R> {
    fn forget_idle(&mut self, key: &K) {
        if let Some(pos) = self.idle_order.iter().position(|k| k == key) {
            self.idle_order.remove(pos);
        }
    }
}

struct Shared<P: OperationPolicy> {
    policy: P,
    slots: Mutex<Slots<P::Key, P::Resource>>,
    released: Notify,
    max_idle: usize,
}

impl<P: OperationPolicy> Shared<P> {
    fn lock(&self) -> Result<MutexGuard<'_, Slots<P::Key, P::Resource>>> {
        self.slots
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.to_string()))
    }

    fn give_back(&self, key: &P::Key, resource: Option<P::Resource>, close: bool) {
        let evicted = {
            let Ok(mut slots) = self.slots.lock() else {
                return;
            };
            let close_requested = matches!(
                slots.map.get(key),
                Some(Slot::CheckedOut {
                    close_on_release: true
                })
            );

            match resource {
                Some(resource)
                    if !(close || close_requested || slots.disposed || self.max_idle == 0) =>
                {
                    let mut evicted = Vec::new();
                    while slots.idle_order.len() >= self.max_idle {
                        if let Some(oldest) = slots.idle_order.pop_front() {
                            if let Some(Slot::Idle(old)) = slots.map.remove(&oldest) {
                                evicted.push(old);
                            }
                        }
                    }
                    slots.map.insert(key.clone(), Slot::Idle(resource));
                    slots.idle_order.push_back(key.clone());
                    evicted
                }
                other => {
                    slots.map.remove(key);
                    other.into_iter().collect()
                }
            }
        };
        // Handles are dropped outside the lock
        drop(evicted);
        trace!(key = ?key, "Operation released");
        self.released.notify_waiters();
    }
}

/// Keyed pool that hands out at most one operation per resource key.
pub struct ConcurrentOperate<P: OperationPolicy> {
    shared: Arc<Shared<P>>,
}

impl<P: OperationPolicy> Clone for ConcurrentOperate<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: OperationPolicy> ConcurrentOperate<P> {
    /// Create a pool keeping at most `max_idle` released resources open
    pub fn new(policy: P, max_idle: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                policy,
                slots: Mutex::new(Slots {
                    map: HashMap::new(),
                    idle_order: VecDeque::new(),
                    disposed: false,
                }),
                released: Notify::new(),
                max_idle,
            }),
        }
    }

    /// Check out the resource for `key` or fail with [`ProtocolError::ResourceBusy`].
    pub fn try_acquire(&self, key: P::Key, data: &P::Data) -> Result<ConcurrentOperation<P>> {
        let idle = {
            let mut slots = self.shared.lock()?;
            if slots.disposed {
                return Err(ProtocolError::Disposed(constants::ERR_OPERATE_DISPOSED));
            }
            let previous = slots.map.insert(
                key.clone(),
                Slot::CheckedOut {
                    close_on_release: false,
                },
            );
            match previous {
                Some(Slot::CheckedOut { close_on_release }) => {
                    slots
                        .map
                        .insert(key.clone(), Slot::CheckedOut { close_on_release });
                    return Err(ProtocolError::ResourceBusy(format!("{key:?}")));
                }
                Some(Slot::Idle(resource)) => {
                    slots.forget_idle(&key);
                    Some(resource)
                }
                None => None,
            }
        };

        // The slot is reserved, so the resource can be created without the lock
        let resource = match idle {
            Some(mut resource) => {
                if self.shared.policy.try_reset(&mut resource) {
                    debug!(key = ?key, "Reusing idle resource");
                    Ok(resource)
                } else {
                    self.shared.policy.create(&key, data)
                }
            }
            None => self.shared.policy.create(&key, data),
        };

        match resource {
            Ok(resource) => Ok(ConcurrentOperation {
                key,
                resource: Some(resource),
                shared: Arc::clone(&self.shared),
            }),
            Err(e) => {
                self.shared.give_back(&key, None, true);
                Err(e)
            }
        }
    }

    /// Check out the resource for `key`, waiting up to `wait` for the current holder.
    pub async fn acquire(
        &self,
        key: P::Key,
        data: &P::Data,
        wait: Duration,
    ) -> Result<ConcurrentOperation<P>> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.shared.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_acquire(key.clone(), data) {
                Err(ProtocolError::ResourceBusy(busy)) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(ProtocolError::ResourceBusy(busy));
                    }
                }
                other => return other,
            }
        }
    }

    /// Close the handle for `key`.
    ///
    /// An idle handle is dropped immediately; a checked-out one is dropped when released.
    pub fn close(&self, key: &P::Key) -> bool {
        let removed = {
            let Ok(mut slots) = self.shared.slots.lock() else {
                return false;
            };
            match slots.map.get_mut(key) {
                Some(Slot::CheckedOut { close_on_release }) => {
                    *close_on_release = true;
                    return true;
                }
                Some(Slot::Idle(_)) => {
                    slots.forget_idle(key);
                    slots.map.remove(key)
                }
                None => None,
            }
        };
        removed.is_some()
    }

    /// Drop every idle handle, returning how many were closed
    pub fn evict_idle(&self) -> usize {
        let evicted: Vec<_> = {
            let Ok(mut slots) = self.shared.slots.lock() else {
                return 0;
            };
            let keys: Vec<_> = slots.idle_order.drain(..).collect();
            keys.iter().filter_map(|k| slots.map.remove(k)).collect()
        };
        evicted.len()
    }

    /// Refuse further acquisitions and close all idle handles.
    pub fn shutdown(&self) {
        if let Ok(mut slots) = self.shared.slots.lock() {
            slots.disposed = true;
        }
        self.evict_idle();
        self.shared.released.notify_waiters();
    }

    /// Whether an operation for `key` is currently checked out
    pub fn is_checked_out(&self, key: &P::Key) -> bool {
        self.shared
            .slots
            .lock()
            .map(|slots| matches!(slots.map.get(key), Some(Slot::CheckedOut { .. })))
            .unwrap_or(false)
    }

    /// Number of released handles kept open
    pub fn idle_count(&self) -> usize {
        self.shared
            .slots
            .lock()
            .map(|slots| slots.idle_order.len())
            .unwrap_or(0)
    }

    /// Access the policy
    pub fn policy(&self) -> &P {
        &self.shared.policy
    }
}

/// A checked-out resource. Dropping it releases the key.
pub struct ConcurrentOperation<P: OperationPolicy> {
    key: P::Key,
    resource: Option<P::Resource>,
    shared: Arc<Shared<P>>,
}

impl<P: OperationPolicy> ConcurrentOperation<P> {
    /// Run one unit of work against the resource
    pub fn execute<R>(&mut self, f: impl FnOnce(&mut P::Resource) -> Result<R>) -> Result<R> {
        match self.resource.as_mut() {
            Some(resource) => f(resource),
            None => Err(ProtocolError::Disposed(constants::ERR_OPERATE_DISPOSED)),
        }
    }

    /// Key this operation holds
    pub fn key(&self) -> &P::Key {
        &self.key
    }

    /// Return the resource to the pool for reuse
    pub fn release(self) {
        drop(self);
    }

    /// Release the key and drop the OS handle instead of keeping it idle
    pub fn close(mut self) {
        let resource = self.resource.take();
        self.shared.give_back(&self.key, resource, true);
    }
}

impl<P: OperationPolicy> Drop for ConcurrentOperation<P> {
    fn drop(&mut self) {
        // `close` already gave the key back and left no resource behind
        if let Some(resource) = self.resource.take() {
            self.shared.give_back(&self.key, Some(resource), false);
        }
    }
}

impl<P: OperationPolicy> Debug for ConcurrentOperation<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentOperation")
            .field("key", &self.key)
            .field("live", &self.resource.is_some())
            .finish()
    }
}
