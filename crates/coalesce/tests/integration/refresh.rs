use std::time::Duration;

use coalesce::{CoalescerConfig, Context, RefreshCache, RefreshError, RefreshWindowConfig};

use crate::*;

#[tokio::test(start_paused = true)]
async fn test_value_is_refreshed_after_window() {
    setup();
    let cache = refresh_cache(Duration::from_secs(1), ms(1), ms(1), 0);
    let ctx = Context::background();
    let tracker = ComputeTracker::new();

    let call = |value| {
        let tracker = tracker.clone();
        let cache = &cache;
        let ctx = &ctx;
        async move {
            cache
                .get_or_compute(ctx, "key", |_| async move {
                    Ok::<_, TestError>(tracker.compute(Duration::ZERO, value).await)
                })
                .await
        }
    };

    assert_eq!(call(1).await.into_result().unwrap(), 1);
    // still fresh, nothing is computed
    assert_eq!(call(2).await.into_result().unwrap(), 1);
    assert_eq!(tracker.total(), 1);

    tokio::time::sleep(ms(2)).await;
    assert_eq!(call(3).await.into_result().unwrap(), 3);
    assert_eq!(tracker.total(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failure_without_value_then_retry() {
    setup();
    let cache = refresh_cache(Duration::from_secs(1), Duration::from_secs(60), ms(10), 0);
    let ctx = Context::background();

    let computed = cache
        .get_or_compute(&ctx, "key", |_| async { fail::<u32>("x") })
        .await;
    let (value, error) = computed.into_parts();
    assert_eq!(value, None);
    assert_eq!(error.unwrap().to_string(), "x");

    tokio::time::sleep(ms(11)).await;

    let computed = cache
        .get_or_compute(&ctx, "key", |_| async { Ok::<_, TestError>(5) })
        .await;
    let (value, error) = computed.into_parts();
    assert_eq!(value, Some(5));
    assert!(error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_stale_value_is_served_with_error() {
    setup();
    let cache = refresh_cache(Duration::from_secs(1), ms(10), ms(5), 0);
    let ctx = Context::background();
    let tracker = ComputeTracker::new();

    let computed = cache
        .get_or_compute(&ctx, "key", |_| async {
            Ok::<_, TestError>(tracker.compute(Duration::ZERO, 1).await)
        })
        .await;
    assert!(computed.is_ok());

    tokio::time::sleep(ms(11)).await;

    let computed = cache
        .get_or_compute(&ctx, "key", |_| async {
            let _guard = tracker.enter();
            fail::<u32>("upstream down")
        })
        .await;
    assert!(computed.is_stale());
    assert_eq!(computed.value(), Some(&1));
    assert_eq!(computed.error().unwrap().to_string(), "upstream down");
    assert_eq!(tracker.total(), 2);

    // backing off: the error is remembered and nothing is computed
    let computed = cache
        .get_or_compute(&ctx, "key", |_| async {
            Ok::<_, TestError>(tracker.compute(Duration::ZERO, 2).await)
        })
        .await;
    assert!(computed.is_stale());
    assert_eq!(computed.value(), Some(&1));
    assert_eq!(computed.error().unwrap().to_string(), "upstream down");
    assert_eq!(tracker.total(), 2);

    tokio::time::sleep(ms(6)).await;

    let computed = cache
        .get_or_compute(&ctx, "key", |_| async {
            Ok::<_, TestError>(tracker.compute(Duration::ZERO, 2).await)
        })
        .await;
    assert_eq!(computed.into_result().unwrap(), 2);
    assert_eq!(tracker.total(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_waiters_share_a_failure() {
    setup();
    let cache = refresh_cache(Duration::from_secs(1), Duration::from_secs(60), ms(100), 0);
    let tracker = ComputeTracker::new();

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let cache = std::sync::Arc::clone(&cache);
            let tracker = tracker.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute(&Context::background(), "key", |_| async move {
                        tracker.compute(ms(10), ()).await;
                        fail::<u32>("x")
                    })
                    .await
            })
        })
        .collect();

    for task in tasks {
        let (value, error) = task.await.unwrap().into_parts();
        assert_eq!(value, None);
        assert_eq!(error.unwrap().to_string(), "x");
    }
    assert_eq!(tracker.total(), 1);
    assert_quiescent(&cache);
}

#[tokio::test(start_paused = true)]
async fn test_without_retry_interval_failures_are_retried_immediately() {
    setup();
    let cache = refresh_cache(Duration::from_secs(1), Duration::from_secs(60), Duration::ZERO, 0);
    let ctx = Context::background();

    let computed = cache
        .get_or_compute(&ctx, "key", |_| async { fail::<u32>("x") })
        .await;
    assert!(computed.error().is_some());

    let computed = cache
        .get_or_compute(&ctx, "key", |_| async { Ok::<_, TestError>(1) })
        .await;
    assert_eq!(computed.into_result().unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_refresh_without_retry_interval_is_not_served_as_fresh() {
    setup();
    let cache = refresh_cache(Duration::from_secs(1), ms(10), Duration::ZERO, 0);
    let ctx = Context::background();
    let tracker = ComputeTracker::new();

    let computed = cache
        .get_or_compute(&ctx, "key", |_| async {
            Ok::<_, TestError>(tracker.compute(Duration::ZERO, 1).await)
        })
        .await;
    assert!(computed.is_ok());

    tokio::time::sleep(ms(11)).await;

    let computed = cache
        .get_or_compute(&ctx, "key", |_| async { fail::<u32>("x") })
        .await;
    assert!(computed.is_stale());
    assert_eq!(computed.error().unwrap().to_string(), "x");

    // same instant as the failure: the old value is stale and gets recomputed
    let computed = cache
        .get_or_compute(&ctx, "key", |_| async {
            Ok::<_, TestError>(tracker.compute(Duration::ZERO, 2).await)
        })
        .await;
    assert_eq!(computed.into_result().unwrap(), 2);
    assert_eq!(tracker.total(), 2);
}

#[tokio::test]
async fn test_idle_entries_expire_from_memory() {
    setup();
    let coalescer = CoalescerConfig {
        compute_timeout: ms(10),
        max_concurrent_computations: 0,
    };
    let refresh = RefreshWindowConfig {
        refresh_window: ms(10),
        retry_interval: ms(10),
        expire_window: ms(50),
        cleanup_interval: ms(10),
    };
    let cache = RefreshCache::<u32>::with_refresh_window("expiry", &coalescer, &refresh, None)
        .unwrap();
    let ctx = Context::background();

    let computed = cache
        .get_or_compute(&ctx, "key", |_| async { Ok::<_, TestError>(1) })
        .await;
    assert!(computed.is_ok());
    assert!(cache.store().contains("key"));

    tokio::time::sleep(ms(150)).await;
    assert_eq!(cache.store().entry_count(), 0);

    // the stale value is gone, so the failure comes without a value
    let computed = cache
        .get_or_compute(&ctx, "key", |_| async { fail::<u32>("x") })
        .await;
    let (value, error) = computed.into_parts();
    assert_eq!(value, None);
    assert!(matches!(error, Some(RefreshError::Compute(_))));
}
