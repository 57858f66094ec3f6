use std::sync::Arc;
use std::time::Duration;

use coalesce::{CoalescerConfig, Computed, Context, RefreshCache, RefreshWindowConfig};
use tokio::task::JoinHandle;

pub use coalesce_test::{ComputeTracker, TestError, fail, setup};

pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Creates a refresh cache which never expires entries from memory.
///
/// Tests running with paused time need this, the store expiry follows the wall clock.
pub fn refresh_cache(
    compute_timeout: Duration,
    refresh_window: Duration,
    retry_interval: Duration,
    max_concurrent_computations: usize,
) -> Arc<RefreshCache<u32>> {
    let coalescer = CoalescerConfig {
        compute_timeout,
        max_concurrent_computations,
    };
    let refresh = RefreshWindowConfig {
        refresh_window,
        retry_interval,
        expire_window: Duration::ZERO,
        cleanup_interval: Duration::ZERO,
    };
    Arc::new(RefreshCache::with_refresh_window("test", &coalescer, &refresh, None).unwrap())
}

/// Computes `value` for `key` in the background, taking `duration`.
pub fn spawn_compute(
    cache: &Arc<RefreshCache<u32>>,
    ctx: Context,
    key: &'static str,
    tracker: &ComputeTracker,
    duration: Duration,
    value: u32,
) -> JoinHandle<Computed<u32>> {
    let cache = Arc::clone(cache);
    let tracker = tracker.clone();
    tokio::spawn(async move {
        cache
            .get_or_compute(&ctx, key, |_| async move {
                Ok::<_, TestError>(tracker.compute(duration, value).await)
            })
            .await
    })
}

/// Asserts that nothing is left behind in the lock registry and the admission limiter.
#[track_caller]
pub fn assert_quiescent(cache: &RefreshCache<u32>) {
    assert_eq!(cache.pending_keys(), 0, "key locks leaked");
    assert_eq!(
        cache.limiter().available(),
        cache.limiter().capacity(),
        "admission slots leaked"
    );
}
