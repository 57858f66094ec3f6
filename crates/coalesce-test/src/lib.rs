//! Helpers for testing coalescers.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Wrap the body of compute functions in [`ComputeTracker::enter`] and hold the returned
//!    guard until the computation finishes. The tracker then knows how many computations were
//!    running at the same time.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `coalesce` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("coalesce=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// The error type of failing test computations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TestError(pub String);

/// A computation failure displaying as `msg`.
pub fn fail<T>(msg: &str) -> Result<T, TestError> {
    Err(TestError(msg.to_owned()))
}

#[derive(Debug, Default)]
struct Counters {
    current: AtomicUsize,
    max: AtomicUsize,
    total: AtomicUsize,
}

/// Counts computations, and how many of them were running at the same time.
///
/// Clones share the same counters.
#[derive(Clone, Debug, Default)]
pub struct ComputeTracker {
    counters: Arc<Counters>,
}

impl ComputeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a running computation until the returned guard is dropped.
    pub fn enter(&self) -> ComputeGuard {
        let counters = &self.counters;
        counters.total.fetch_add(1, Ordering::SeqCst);
        let current = counters.current.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max.fetch_max(current, Ordering::SeqCst);

        ComputeGuard {
            counters: Arc::clone(&self.counters),
        }
    }

    /// Runs a computation taking `duration`, returning `value`.
    pub async fn compute<T>(&self, duration: Duration, value: T) -> T {
        let _guard = self.enter();
        tokio::time::sleep(duration).await;
        value
    }

    /// The number of computations running right now.
    pub fn current(&self) -> usize {
        self.counters.current.load(Ordering::SeqCst)
    }

    /// The highest number of computations that were running at the same time.
    pub fn max(&self) -> usize {
        self.counters.max.load(Ordering::SeqCst)
    }

    /// The number of computations that were started in total.
    pub fn total(&self) -> usize {
        self.counters.total.load(Ordering::SeqCst)
    }
}

/// Marks a computation of a [`ComputeTracker`] as running.
#[derive(Debug)]
pub struct ComputeGuard {
    counters: Arc<Counters>,
}

impl Drop for ComputeGuard {
    fn drop(&mut self) {
        self.counters.current.fetch_sub(1, Ordering::SeqCst);
    }
}
