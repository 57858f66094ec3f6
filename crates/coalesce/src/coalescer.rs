//! The coalescing coordinator.

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use sentry::{Hub, SentryFutureExt};
use tokio::time::Instant;

use crate::config::{CoalescerConfig, RefreshWindowConfig};
use crate::context::Context;
use crate::error::{ConfigError, RefreshError};
use crate::freshness::{AlwaysFresh, FreshnessPolicy, Lookup, RefreshEntry, RefreshWindow};
use crate::limiter::ConcurrencyLimiter;
use crate::locks::KeyLocks;
use crate::store::{MemoryStore, Store};

/// The outcome of [`Coalescer::get_or_compute`].
///
/// Both a value and an error can be present at the same time: when a recomputation fails or times
/// out, the previously cached value is handed out together with the error that made it stale. A
/// value without an error is always fresh.
#[derive(Debug, Clone)]
#[must_use]
pub struct Computed<T> {
    value: Option<T>,
    error: Option<RefreshError>,
}

impl<T> Computed<T> {
    fn fresh(value: T) -> Self {
        Self {
            value: Some(value),
            error: None,
        }
    }

    fn failed(value: Option<T>, error: RefreshError) -> Self {
        Self {
            value,
            error: Some(error),
        }
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn error(&self) -> Option<&RefreshError> {
        self.error.as_ref()
    }

    /// Whether the value is fresh.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Whether a previous value is returned alongside an error.
    pub fn is_stale(&self) -> bool {
        self.value.is_some() && self.error.is_some()
    }

    /// Returns the value, fresh or stale, discarding any error.
    pub fn into_value(self) -> Option<T> {
        self.value
    }

    /// Returns the fresh value, or the error if there is one, discarding any stale value.
    pub fn into_result(self) -> Result<T, RefreshError> {
        match (self.value, self.error) {
            (_, Some(error)) => Err(error),
            (Some(value), None) => Ok(value),
            (None, None) => unreachable!("a result without error always carries a value"),
        }
    }

    pub fn into_parts(self) -> (Option<T>, Option<RefreshError>) {
        (self.value, self.error)
    }
}

/// A coalescer keeping its refresh-window entries in an idle-expiring [`MemoryStore`].
pub type RefreshCache<T> = Coalescer<T, MemoryStore<RefreshEntry<T>>, RefreshWindow>;

/// Guards an expensive computation behind a key.
///
/// For every key, at most one computation is running at any time. Callers arriving while it runs
/// wait for the key lock and then find the refreshed value in the store. See the
/// [crate documentation](crate) for the full protocol.
pub struct Coalescer<T, S, P = AlwaysFresh> {
    name: Arc<str>,
    store: S,
    policy: P,
    locks: KeyLocks,
    limiter: ConcurrencyLimiter,
    compute_timeout: Duration,
    _value: PhantomData<fn() -> T>,
}

impl<T, S: Clone, P: Clone> Clone for Coalescer<T, S, P> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            store: self.store.clone(),
            policy: self.policy.clone(),
            locks: self.locks.clone(),
            limiter: self.limiter.clone(),
            compute_timeout: self.compute_timeout,
            _value: PhantomData,
        }
    }
}

impl<T, S, P: fmt::Debug> fmt::Debug for Coalescer<T, S, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coalescer")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("locks", &self.locks)
            .field("limiter", &self.limiter)
            .field("compute_timeout", &self.compute_timeout)
            .finish_non_exhaustive()
    }
}

impl<T, S> Coalescer<T, S, AlwaysFresh>
where
    T: Clone + Send + Sync + 'static,
    S: Store<T>,
{
    /// Creates a coalescer which considers everything in `store` fresh.
    pub fn new(name: &str, store: S, config: &CoalescerConfig) -> Result<Self, ConfigError> {
        Self::with_policy(name, store, AlwaysFresh, config)
    }
}

impl<T> RefreshCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a self-contained refresh-window cache.
    ///
    /// Entries are recomputed after `refresh_window`, failures retried after `retry_interval`, and
    /// entries nobody asked for during `expire_window` are evicted from memory. When called within
    /// a tokio runtime, a background task sweeps expired entries every `cleanup_interval`.
    pub fn with_refresh_window(
        name: &str,
        coalescer: &CoalescerConfig,
        refresh: &RefreshWindowConfig,
        capacity: Option<u64>,
    ) -> Result<Self, ConfigError> {
        let policy = RefreshWindow::new(refresh, coalescer)?;

        let mut builder = MemoryStore::<RefreshEntry<T>>::builder().name(name);
        if let Some(capacity) = capacity {
            builder = builder.max_capacity(capacity);
        }
        if let Some(expire_window) = refresh.expire_window() {
            builder = builder.time_to_idle(expire_window);
        }
        if let Some(cleanup_interval) = refresh.cleanup_interval() {
            builder = builder.cleanup_interval(cleanup_interval);
        }

        Self::with_policy(name, builder.build(), policy, coalescer)
    }
}

impl<T, S, P> Coalescer<T, S, P>
where
    T: Clone + Send + Sync + 'static,
    P: FreshnessPolicy<T>,
    S: Store<P::Entry>,
{
    pub fn with_policy(
        name: &str,
        store: S,
        policy: P,
        config: &CoalescerConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            name: Arc::from(name),
            store,
            policy,
            locks: KeyLocks::new(),
            limiter: ConcurrencyLimiter::new(config.max_concurrent_computations),
            compute_timeout: config.compute_timeout,
            _value: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn key_locks(&self) -> &KeyLocks {
        &self.locks
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    pub fn compute_timeout(&self) -> Duration {
        self.compute_timeout
    }

    /// The number of keys with callers waiting for or holding their lock.
    pub fn pending_keys(&self) -> usize {
        self.locks.len()
    }

    /// Returns the value for `key`, computing it with `compute` if necessary.
    ///
    /// A fresh value is returned right away. Otherwise, the call waits for an admission slot and
    /// the key lock, and computes the value unless another caller refreshed it in the meantime.
    /// All of that is bounded by the budget derived from `ctx` and the configured
    /// `compute_timeout`, which is also handed to `compute`.
    ///
    /// On failure, the previous value (if any) is returned together with the error. Dropping the
    /// returned future, or cancelling `ctx`, aborts the computation if this call owns it. A
    /// computation cut short by the caller's own deadline or cancellation is not remembered, so
    /// queued callers compute again with theirs.
    ///
    /// # Panics
    ///
    /// A panic inside `compute` is recorded as a failure for `key`, and resumed once the lock and
    /// admission slot are released.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        ctx: &Context,
        key: &str,
        compute: F,
    ) -> Computed<T>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        let name = &*self.name;
        metric!(counter("coalesce.access") += 1, "cache" => name);

        let stale = match self.policy.lookup(self.store.get(key), Instant::now()) {
            Lookup::Fresh(value) => {
                metric!(counter("coalesce.memory.hit") += 1, "cache" => name);
                return Computed::fresh(value);
            }
            Lookup::Backoff { value, error } => {
                metric!(counter("coalesce.backoff") += 1, "cache" => name);
                return Computed::failed(value, error);
            }
            Lookup::Stale(value) => value,
        };

        if let Some(error) = ctx.err() {
            return self.give_up("call", stale, error);
        }
        let budget = ctx.with_timeout(self.compute_timeout);
        // Whether the caller's own deadline, rather than `compute_timeout`, bounds this call.
        let caller_bounded = ctx.deadline().is_some() && budget.deadline() == ctx.deadline();

        let admission_start = Instant::now();
        let permit = match self.limiter.acquire(&budget).await {
            Ok(permit) => permit,
            Err(error) => return self.give_up("admission", stale, error),
        };
        metric!(timer("coalesce.admission.wait") = admission_start.elapsed(), "cache" => name);

        let guard = match budget.run(self.locks.lock(key)).await {
            Ok(guard) => guard,
            Err(error) => return self.give_up("lock", stale, error),
        };

        // Somebody else might have refreshed the entry while we were waiting.
        let stale = match self.policy.lookup(self.store.get(key), Instant::now()) {
            Lookup::Fresh(value) => {
                metric!(counter("coalesce.coalesced") += 1, "cache" => name);
                return Computed::fresh(value);
            }
            Lookup::Backoff { value, error } => {
                metric!(counter("coalesce.coalesced") += 1, "cache" => name);
                return Computed::failed(value, error);
            }
            Lookup::Stale(value) => value.or(stale),
        };

        metric!(counter("coalesce.computation") += 1, "cache" => name);
        tracing::trace!(cache = name, key, "Computing value");

        let compute_start = Instant::now();
        let computation = async move {
            let future = compute(budget.clone()).bind_hub(Hub::new_from_top(Hub::current()));
            budget.run(future).await
        };
        let outcome = AssertUnwindSafe(computation).catch_unwind().await;
        metric!(timer("coalesce.computation.duration") = compute_start.elapsed(), "cache" => name);

        let (result, panic) = match outcome {
            Ok(Ok(Ok(value))) => (Ok(value), None),
            Ok(Ok(Err(error))) => (Err(RefreshError::compute(error)), None),
            Ok(Err(error)) => (Err(error), None),
            Err(panic) => {
                tracing::error!(cache = name, key, "Computation panicked");
                let error = RefreshError::compute("computation panicked");
                (Err(error), Some(panic))
            }
        };

        let computed = match result {
            Ok(value) => {
                let entry = self.policy.on_success(value.clone(), Instant::now());
                self.store.set(key, entry);
                Computed::fresh(value)
            }
            Err(error) => {
                // Giving up on its own says nothing about the computation, other callers get
                // to try with their own deadline.
                let caller_gave_up = error.is_cancelled()
                    || (error.is_timeout() && caller_bounded && ctx.is_expired());
                self.record_failure(key, stale, error, !caller_gave_up)
            }
        };

        drop(guard);
        drop(permit);

        if let Some(panic) = panic {
            std::panic::resume_unwind(panic);
        }
        computed
    }

    fn record_failure(
        &self,
        key: &str,
        stale: Option<T>,
        error: RefreshError,
        remember: bool,
    ) -> Computed<T> {
        let name = &*self.name;
        metric!(
            counter("coalesce.computation.error") += 1,
            "cache" => name,
            "reason" => error.metrics_tag(),
        );
        if error.is_timeout() {
            metric!(counter("coalesce.timeout") += 1, "cache" => name, "stage" => "compute");
        }
        tracing::debug!(cache = name, key, error = %error, "Computation failed");

        if remember {
            if let Some(entry) = self.policy.on_failure(stale.clone(), &error, Instant::now()) {
                self.store.set(key, entry);
            }
        }

        Computed::failed(stale, error)
    }

    fn give_up(&self, stage: &'static str, stale: Option<T>, error: RefreshError) -> Computed<T> {
        let name = &*self.name;
        if error.is_timeout() {
            metric!(counter("coalesce.timeout") += 1, "cache" => name, "stage" => stage);
        }
        tracing::debug!(cache = name, stage, error = %error, "Gave up waiting");
        Computed::failed(stale, error)
    }
}
