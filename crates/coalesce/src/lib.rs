//! # Request coalescing and refresh-ahead caching
//!
//! This crate guards an expensive, possibly slow or failing computation behind a key. For any
//! given key, at most one computation runs at a time, concurrent callers share its result, and
//! the previously cached value is handed out together with the error when a recomputation fails
//! or times out.
//!
//! ## Layers
//!
//! A call to [`Coalescer::get_or_compute`] goes through the following steps:
//!
//! - First, the [`Store`] is consulted. A fresh entry is returned right away, without taking any
//!   lock or admission slot.
//! - On miss (or a stale entry), the caller is admitted by the [`ConcurrencyLimiter`], which
//!   bounds the number of computations running across *all* keys.
//! - The caller then acquires the per-key lock from the [`KeyLocks`] registry. Entries in that
//!   registry are refcounted and removed as soon as the last waiter leaves, so a high-cardinality
//!   keyspace never accumulates locks.
//! - Under the lock, the store is checked again. Another caller may have refreshed the entry while
//!   this one was waiting.
//! - Finally the computation runs, bounded by the call budget, and its outcome is written back.
//!
//! Every suspension point is bounded by the call budget: the caller's [`Context`] narrowed to
//! the configured `compute_timeout`. Exceeding it yields [`RefreshError::Timeout`] and releases
//! the slot and lock on the way out.
//!
//! ## Freshness
//!
//! What "fresh" means is decided by a [`FreshnessPolicy`]:
//!
//! - [`AlwaysFresh`] considers any stored value usable until it is overwritten or the store
//!   evicts it. Eviction is entirely the store's business.
//! - [`RefreshWindow`] wraps every value in a [`RefreshEntry`] carrying a refresh deadline, and a
//!   shorter retry deadline after a failure. A failing key is thereby retried sooner than a
//!   healthy one is refreshed, while the last good value keeps being served along with the error.
//!
//! The [`MemoryStore`] is a `moka` backed store that can either be size-bounded, or idle-expiring
//! as the refresh-window caches want it. [`Coalescer::with_refresh_window`] wires everything up
//! from a [`RefreshWindowConfig`].
//!
//! ## Metrics
//!
//! All metrics are tagged with a `cache` field that corresponds to the coalescer name:
//!
//! - `coalesce.access`: All accesses.
//! - `coalesce.memory.hit`: Accesses served by a fresh store entry.
//! - `coalesce.backoff`: Accesses served from an entry that is backing off after a failure.
//! - `coalesce.coalesced`: Accesses that waited for the key lock and found the entry refreshed.
//! - `coalesce.computation`: Actual computations being run.
//! - `coalesce.computation.error`: Computations that failed, tagged with the `reason`.
//! - `coalesce.computation.duration`: A timer for the duration of computations.
//! - `coalesce.admission.wait`: A timer for the time spent waiting for an admission slot.
//! - `coalesce.timeout`: Calls that gave up waiting, tagged with the `stage`.

#[macro_use]
pub mod metrics;

pub mod coalescer;
pub mod config;
pub mod context;
pub mod error;
pub mod freshness;
pub mod limiter;
pub mod locks;
pub mod logging;
pub mod store;

pub use coalescer::{Coalescer, Computed, RefreshCache};
pub use config::{CoalescerConfig, RefreshWindowConfig};
pub use context::Context;
pub use error::{ComputeError, ConfigError, RefreshError};
pub use freshness::{AlwaysFresh, FreshnessPolicy, Lookup, RefreshEntry, RefreshWindow};
pub use limiter::{AdmissionPermit, ConcurrencyLimiter};
pub use locks::{KeyLockGuard, KeyLocks};
pub use store::{MemoryStore, MemoryStoreBuilder, Store};
