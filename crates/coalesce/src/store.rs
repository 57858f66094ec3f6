//! Backing stores for coalescers.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};

/// The key-value capability a [`Coalescer`](crate::Coalescer) needs from its backing store.
///
/// Implementations are free to evict or expire entries on their own. The coalescer never deletes
/// anything, and only ever mutates a key while holding that key's lock, so stores only need to
/// be safe for concurrent access to *different* keys.
pub trait Store<V>: Send + Sync {
    fn get(&self, key: &str) -> Option<V>;

    fn set(&self, key: &str, value: V);

    fn remove(&self, key: &str);

    fn clear(&self);
}

impl<V, S> Store<V> for Arc<S>
where
    S: Store<V> + ?Sized,
{
    fn get(&self, key: &str) -> Option<V> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: V) {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) {
        (**self).remove(key)
    }

    fn clear(&self) {
        (**self).clear()
    }
}

type InMemoryCache<V> = moka::sync::Cache<String, V>;

/// An in-memory [`Store`] backed by a `moka` cache.
///
/// Depending on how it is built, this is either bounded by size (optionally with a time to live),
/// or expires entries that have not been accessed for a while, or both. Clones share the same
/// storage.
#[derive(Clone)]
pub struct MemoryStore<V> {
    cache: InMemoryCache<V>,
    /// Stops the sweeper once the last clone is gone.
    _sweeper: Option<Arc<DropGuard>>,
}

impl<V> fmt::Debug for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("name", &self.cache.name())
            .field("entries", &self.cache.entry_count())
            .field("sweeping", &self._sweeper.is_some())
            .finish()
    }
}

impl<V> MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn builder() -> MemoryStoreBuilder {
        MemoryStoreBuilder::default()
    }

    /// A store holding at most `capacity` entries.
    pub fn bounded(capacity: u64) -> Self {
        Self::builder().max_capacity(capacity).build()
    }

    /// The approximate number of entries.
    ///
    /// This is only accurate after pending housekeeping ran, see [`run_pending_tasks`](Self::run_pending_tasks).
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    /// Runs pending housekeeping, such as evicting expired entries.
    pub fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks()
    }
}

impl<V> Store<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &str) -> Option<V> {
        self.cache.get(key)
    }

    fn set(&self, key: &str, value: V) {
        self.cache.insert(key.to_owned(), value)
    }

    fn remove(&self, key: &str) {
        self.cache.invalidate(key)
    }

    fn clear(&self) {
        self.cache.invalidate_all()
    }
}

/// Builds a [`MemoryStore`].
#[derive(Clone, Debug, Default)]
pub struct MemoryStoreBuilder {
    name: Option<String>,
    max_capacity: Option<u64>,
    time_to_live: Option<Duration>,
    time_to_idle: Option<Duration>,
    cleanup_interval: Option<Duration>,
}

impl MemoryStoreBuilder {
    /// A name used in debug output and logs.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The maximum number of entries, evicting the least useful ones once reached.
    pub fn max_capacity(mut self, capacity: u64) -> Self {
        self.max_capacity = Some(capacity);
        self
    }

    /// Evicts entries after they were inserted for this long.
    pub fn time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    /// Evicts entries which were not read or written for this long.
    pub fn time_to_idle(mut self, tti: Duration) -> Self {
        self.time_to_idle = Some(tti);
        self
    }

    /// Runs housekeeping periodically in a background task.
    ///
    /// This requires to be built within a tokio runtime, otherwise housekeeping only runs as part
    /// of store accesses.
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    pub fn build<V>(self) -> MemoryStore<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        let mut builder = InMemoryCache::builder();
        if let Some(name) = &self.name {
            builder = builder.name(name);
        }
        if let Some(capacity) = self.max_capacity {
            builder = builder.max_capacity(capacity);
        }
        if let Some(ttl) = self.time_to_live {
            builder = builder.time_to_live(ttl);
        }
        if let Some(tti) = self.time_to_idle {
            builder = builder.time_to_idle(tti);
        }
        let cache = builder.build();

        let sweeper = self
            .cleanup_interval
            .filter(|interval| !interval.is_zero())
            .and_then(|interval| spawn_sweeper(cache.clone(), interval))
            .map(Arc::new);

        MemoryStore {
            cache,
            _sweeper: sweeper,
        }
    }
}

fn spawn_sweeper<V>(cache: InMemoryCache<V>, period: Duration) -> Option<DropGuard>
where
    V: Clone + Send + Sync + 'static,
{
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        tracing::debug!(
            cache = cache.name(),
            "No runtime available, store housekeeping only runs on access"
        );
        return None;
    };

    let token = CancellationToken::new();
    let cancelled = token.clone();
    handle.spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,
                _ = interval.tick() => cache.run_pending_tasks(),
            }
        }
        tracing::trace!(cache = cache.name(), "Store sweeper stopped");
    });

    Some(token.drop_guard())
}
