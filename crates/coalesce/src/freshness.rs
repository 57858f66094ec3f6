//! Policies deciding whether a stored entry can be handed out as-is.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::{CoalescerConfig, RefreshWindowConfig};
use crate::error::{ConfigError, RefreshError};

/// The outcome of looking at a stored entry.
#[derive(Debug, Clone)]
pub enum Lookup<T> {
    /// The value can be returned without computing anything.
    Fresh(T),
    /// A recent computation failed and the entry is backing off.
    ///
    /// The stale value (if any) is returned together with the error, without computing.
    Backoff {
        value: Option<T>,
        error: RefreshError,
    },
    /// The entry needs to be computed. Carries the stale value, if there is one.
    Stale(Option<T>),
}

/// Decides what is put in the store, and when a stored entry needs to be recomputed.
pub trait FreshnessPolicy<T>: Send + Sync {
    /// The type that is actually kept in the store.
    type Entry: Clone + Send + Sync + 'static;

    /// Inspects a stored entry, or its absence.
    fn lookup(&self, entry: Option<Self::Entry>, now: Instant) -> Lookup<T>;

    /// Creates the entry to store after a successful computation.
    fn on_success(&self, value: T, now: Instant) -> Self::Entry;

    /// Creates the entry to store after a failed computation, if any.
    ///
    /// `previous` is the stale value which was in the store before the computation.
    fn on_failure(
        &self,
        previous: Option<T>,
        error: &RefreshError,
        now: Instant,
    ) -> Option<Self::Entry>;
}

/// Considers every stored value usable until it is overwritten or evicted by the store.
///
/// Failures are not stored, so the next call computes again.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysFresh;

impl<T> FreshnessPolicy<T> for AlwaysFresh
where
    T: Clone + Send + Sync + 'static,
{
    type Entry = T;

    fn lookup(&self, entry: Option<T>, _now: Instant) -> Lookup<T> {
        match entry {
            Some(value) => Lookup::Fresh(value),
            None => Lookup::Stale(None),
        }
    }

    fn on_success(&self, value: T, _now: Instant) -> T {
        value
    }

    fn on_failure(&self, _previous: Option<T>, _error: &RefreshError, _now: Instant) -> Option<T> {
        None
    }
}

/// The failure a [`RefreshEntry`] is backing off from.
#[derive(Debug, Clone)]
struct Failure {
    /// `None` without a retry interval, the failure is then retried right away.
    retry_deadline: Option<Instant>,
    error: RefreshError,
}

/// A cached value with its own refresh and retry deadlines.
#[derive(Debug, Clone)]
pub struct RefreshEntry<T> {
    value: Option<T>,
    refresh_deadline: Instant,
    failure: Option<Failure>,
}

impl<T> RefreshEntry<T> {
    /// The last successfully computed value.
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// The point after which the value needs to be recomputed.
    pub fn refresh_deadline(&self) -> Instant {
        self.refresh_deadline
    }

    /// The point before which a failed computation is not retried.
    pub fn retry_deadline(&self) -> Option<Instant> {
        self.failure.as_ref().and_then(|failure| failure.retry_deadline)
    }

    /// The error of the failed computation this entry is backing off from.
    pub fn last_error(&self) -> Option<&RefreshError> {
        self.failure.as_ref().map(|failure| &failure.error)
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        self.value.is_some() && self.failure.is_none() && now <= self.refresh_deadline
    }
}

/// Recomputes values once their refresh window has elapsed, and retries failures after a shorter
/// retry interval.
///
/// This freshness check is independent of the store's own eviction, which is expected to be
/// slower and only reclaims entries nobody asked for in a long time.
#[derive(Debug, Clone, Copy)]
pub struct RefreshWindow {
    refresh_window: Duration,
    retry_interval: Duration,
}

impl RefreshWindow {
    /// Validates `config` against the coalescer it will be used with.
    pub fn new(
        config: &RefreshWindowConfig,
        coalescer: &CoalescerConfig,
    ) -> Result<Self, ConfigError> {
        config.validate(coalescer)?;
        Ok(Self {
            refresh_window: config.refresh_window,
            retry_interval: config.retry_interval,
        })
    }

    pub fn refresh_window(&self) -> Duration {
        self.refresh_window
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }
}

impl<T> FreshnessPolicy<T> for RefreshWindow
where
    T: Clone + Send + Sync + 'static,
{
    type Entry = RefreshEntry<T>;

    fn lookup(&self, entry: Option<RefreshEntry<T>>, now: Instant) -> Lookup<T> {
        let Some(entry) = entry else {
            return Lookup::Stale(None);
        };

        match entry.failure {
            Some(failure) if failure.retry_deadline.is_some_and(|retry| now <= retry) => {
                Lookup::Backoff {
                    value: entry.value,
                    error: failure.error,
                }
            }
            // A failed refresh is never handed out as fresh, whatever its refresh deadline.
            Some(_) => Lookup::Stale(entry.value),
            None if now <= entry.refresh_deadline => match entry.value {
                Some(value) => Lookup::Fresh(value),
                None => Lookup::Stale(None),
            },
            None => Lookup::Stale(entry.value),
        }
    }

    fn on_success(&self, value: T, now: Instant) -> RefreshEntry<T> {
        RefreshEntry {
            value: Some(value),
            refresh_deadline: now + self.refresh_window,
            failure: None,
        }
    }

    fn on_failure(
        &self,
        previous: Option<T>,
        error: &RefreshError,
        now: Instant,
    ) -> Option<RefreshEntry<T>> {
        let retry_deadline = (!self.retry_interval.is_zero()).then(|| now + self.retry_interval);

        Some(RefreshEntry {
            value: previous,
            refresh_deadline: now,
            failure: Some(Failure {
                retry_deadline,
                error: error.clone(),
            }),
        })
    }
}
