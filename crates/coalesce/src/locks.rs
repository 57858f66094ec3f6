//! A registry of per-key exclusive locks.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// The registry bookkeeping for one key.
///
/// An item only exists as long as `waiters > 0`.
struct KeyLockItem {
    key: Arc<str>,
    /// The number of callers holding or waiting for `lock`.
    waiters: usize,
    lock: Arc<AsyncMutex<()>>,
}

type Items = FxHashMap<Arc<str>, KeyLockItem>;

/// A dynamically sized set of per-key exclusive locks.
///
/// Locks are created when the first caller asks for a key, and destroyed when the last caller
/// holding or waiting for it leaves. The registry bookkeeping is guarded by a short-lived
/// synchronous mutex, which is never held while waiting for a key lock, so unrelated keys do not
/// contend with each other beyond that.
#[derive(Clone, Default)]
pub struct KeyLocks {
    items: Arc<Mutex<Items>>,
}

impl fmt::Debug for KeyLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLocks")
            .field("keys", &self.len())
            .finish()
    }
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the exclusive lock for `key`, waiting for the current holder if necessary.
    ///
    /// The lock is released when the returned guard is dropped. Dropping the returned future
    /// before it resolves gives up the wait without leaving anything behind in the registry.
    pub async fn lock(&self, key: &str) -> KeyLockGuard {
        let waiter = self.register(key);
        let guard = Arc::clone(&waiter.lock).lock_owned().await;
        tracing::trace!(key, "Acquired key lock");

        KeyLockGuard {
            _guard: guard,
            waiter,
        }
    }

    /// The number of keys which currently have callers holding or waiting for their lock.
    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn items(&self) -> MutexGuard<'_, Items> {
        // The critical sections never panic halfway through an update.
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches a new waiter to the item for `key`, creating it if necessary.
    fn register(&self, key: &str) -> Waiter {
        let mut items = self.items();
        if let Some(item) = items.get_mut(key) {
            item.waiters += 1;
            return Waiter {
                registry: Arc::clone(&self.items),
                key: Arc::clone(&item.key),
                lock: Arc::clone(&item.lock),
            };
        }

        let item = KeyLockItem {
            key: Arc::from(key),
            waiters: 1,
            lock: Default::default(),
        };
        let waiter = Waiter {
            registry: Arc::clone(&self.items),
            key: Arc::clone(&item.key),
            lock: Arc::clone(&item.lock),
        };
        items.insert(Arc::clone(&item.key), item);
        waiter
    }
}

/// A caller registered with the item of one key.
///
/// Dropping it detaches the caller, and removes the item once it was the last one.
struct Waiter {
    registry: Arc<Mutex<Items>>,
    key: Arc<str>,
    lock: Arc<AsyncMutex<()>>,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        let mut items = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(item) = items.get_mut(&*self.key) else {
            debug_assert!(false, "key lock item vanished while it had waiters");
            return;
        };
        debug_assert!(Arc::ptr_eq(&item.lock, &self.lock));

        item.waiters -= 1;
        if item.waiters == 0 {
            items.remove(&*self.key);
        }
    }
}

/// Exclusive ownership of the lock for one key.
pub struct KeyLockGuard {
    // NOTE: fields drop in declaration order. The lock is released before the waiter detaches, so
    // a caller arriving in between still attaches to the same item instead of creating a second
    // lock for the same key.
    _guard: OwnedMutexGuard<()>,
    waiter: Waiter,
}

impl KeyLockGuard {
    pub fn key(&self) -> &str {
        &self.waiter.key
    }
}

impl fmt::Debug for KeyLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLockGuard")
            .field("key", &self.key())
            .finish()
    }
}
