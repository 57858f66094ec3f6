use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use coalesce::{Context, RefreshError};
use tokio::time::Instant;

use crate::*;

#[tokio::test(start_paused = true)]
async fn test_slow_computation_times_out() {
    setup();
    let cache = refresh_cache(Duration::from_secs(1), Duration::from_secs(60), ms(100), 0);
    let start = Instant::now();

    let computed = cache
        .get_or_compute(&Context::background(), "key", |ctx| async move {
            ctx.run(tokio::time::sleep(Duration::from_secs(2))).await?;
            Ok::<_, RefreshError>(1)
        })
        .await;

    assert_eq!(start.elapsed(), Duration::from_secs(1));
    let (value, error) = computed.into_parts();
    assert_eq!(value, None);
    assert!(matches!(error, Some(RefreshError::Timeout(d)) if d == Duration::from_secs(1)));
    assert_quiescent(&cache);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_remembered_while_backing_off() {
    setup();
    let cache = refresh_cache(ms(100), Duration::from_secs(60), ms(500), 0);
    let ctx = Context::background();
    let tracker = ComputeTracker::new();

    let computed = cache
        .get_or_compute(&ctx, "key", |_| async {
            Ok::<_, TestError>(tracker.compute(ms(200), 1).await)
        })
        .await;
    assert!(computed.error().unwrap().is_timeout());

    let computed = cache
        .get_or_compute(&ctx, "key", |_| async {
            Ok::<_, TestError>(tracker.compute(ms(10), 1).await)
        })
        .await;
    assert!(computed.error().unwrap().is_timeout());
    assert_eq!(tracker.total(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_admission_wait_is_bounded() {
    setup();
    let cache = refresh_cache(Duration::from_secs(1), Duration::from_secs(60), ms(100), 1);
    let tracker = ComputeTracker::new();

    let busy = spawn_compute(&cache, Context::background(), "a", &tracker, ms(500), 1);
    tokio::task::yield_now().await;
    assert_eq!(cache.limiter().available(), Some(0));

    let start = Instant::now();
    let ctx = Context::background().with_timeout(ms(50));
    let computed = cache
        .get_or_compute(&ctx, "b", |_| async {
            Ok::<_, TestError>(tracker.compute(Duration::ZERO, 2).await)
        })
        .await;

    assert_eq!(start.elapsed(), ms(50));
    assert!(matches!(computed.error(), Some(RefreshError::Timeout(_))));
    assert_eq!(tracker.total(), 1);

    assert!(busy.await.unwrap().is_ok());
    assert_quiescent(&cache);
}

#[tokio::test(start_paused = true)]
async fn test_lock_wait_is_bounded() {
    setup();
    let cache = refresh_cache(Duration::from_secs(1), Duration::from_secs(60), ms(100), 0);
    let tracker = ComputeTracker::new();

    let busy = spawn_compute(&cache, Context::background(), "key", &tracker, ms(500), 1);
    tokio::task::yield_now().await;
    assert_eq!(cache.pending_keys(), 1);

    let ctx = Context::background().with_timeout(ms(50));
    let computed = cache
        .get_or_compute(&ctx, "key", |_| async {
            Ok::<_, TestError>(tracker.compute(Duration::ZERO, 2).await)
        })
        .await;
    assert!(matches!(computed.into_parts(), (None, Some(RefreshError::Timeout(_)))));

    // the abandoned waiter does not linger in the registry
    assert_eq!(cache.pending_keys(), 1);
    assert!(busy.await.unwrap().is_ok());
    assert_eq!(tracker.total(), 1);
    assert_quiescent(&cache);
}

#[tokio::test(start_paused = true)]
async fn test_caller_deadline_does_not_fail_queued_callers() {
    setup();
    let cache = refresh_cache(Duration::from_secs(1), Duration::from_secs(60), ms(100), 0);
    let tracker = ComputeTracker::new();

    let impatient = Context::background().with_timeout(ms(5));
    let impatient = spawn_compute(&cache, impatient, "key", &tracker, ms(100), 1);
    tokio::task::yield_now().await;
    assert_eq!(cache.pending_keys(), 1);

    let patient = Context::background().with_timeout(Duration::from_secs(5));
    let patient = spawn_compute(&cache, patient, "key", &tracker, ms(100), 2);

    let (value, error) = impatient.await.unwrap().into_parts();
    assert_eq!(value, None);
    assert!(matches!(error, Some(RefreshError::Timeout(d)) if d == ms(5)));

    // the queued caller computes with its own deadline instead of inheriting the timeout
    assert_eq!(patient.await.unwrap().into_result().unwrap(), 2);
    assert_eq!(tracker.total(), 2);
    assert_quiescent(&cache);
}

#[tokio::test(start_paused = true)]
async fn test_compute_timeout_is_shared_with_queued_callers() {
    setup();
    let cache = refresh_cache(ms(50), Duration::from_secs(60), ms(500), 0);
    let tracker = ComputeTracker::new();

    let first = spawn_compute(&cache, Context::background(), "key", &tracker, ms(100), 1);
    tokio::task::yield_now().await;
    let second = spawn_compute(&cache, Context::background(), "key", &tracker, ms(100), 2);

    assert!(first.await.unwrap().error().unwrap().is_timeout());
    // the computation itself was too slow, the waiter does not compute again
    assert!(second.await.unwrap().error().unwrap().is_timeout());
    assert_eq!(tracker.total(), 1);
    assert_quiescent(&cache);
}

#[tokio::test(start_paused = true)]
async fn test_expired_context_short_circuits() {
    setup();
    let cache = refresh_cache(Duration::from_secs(1), ms(10), ms(10), 1);
    let tracker = ComputeTracker::new();

    let computed = cache
        .get_or_compute(&Context::background(), "key", |_| async {
            Ok::<_, TestError>(tracker.compute(Duration::ZERO, 1).await)
        })
        .await;
    assert!(computed.is_ok());
    tokio::time::sleep(ms(11)).await;

    let expired = Context::background().with_timeout(Duration::ZERO);
    let computed = cache
        .get_or_compute(&expired, "key", |_| async {
            Ok::<_, TestError>(tracker.compute(Duration::ZERO, 2).await)
        })
        .await;

    assert!(computed.is_stale());
    assert_eq!(computed.value(), Some(&1));
    assert!(computed.error().unwrap().is_timeout());
    assert_eq!(tracker.total(), 1);

    let computed = cache
        .get_or_compute(&Context::background(), "key", |_| async {
            Ok::<_, TestError>(tracker.compute(Duration::ZERO, 3).await)
        })
        .await;
    assert_eq!(computed.into_result().unwrap(), 3);

    // a fresh value is still served on an expired context
    let computed = cache
        .get_or_compute(&expired, "key", |_| async { fail::<u32>("unreachable") })
        .await;
    assert_eq!(computed.into_result().unwrap(), 3);
}

struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_aborts_the_computation() {
    setup();
    let cache = refresh_cache(Duration::from_secs(10), Duration::from_secs(60), ms(100), 2);
    let dropped = Arc::new(AtomicBool::new(false));
    let ctx = Context::background();

    let task = {
        let cache = Arc::clone(&cache);
        let ctx = ctx.clone();
        let dropped = Arc::clone(&dropped);
        tokio::spawn(async move {
            cache
                .get_or_compute(&ctx, "key", |_| async move {
                    let _on_drop = SetOnDrop(dropped);
                    futures::future::pending::<()>().await;
                    Ok::<u32, TestError>(1)
                })
                .await
        })
    };

    tokio::time::sleep(ms(10)).await;
    assert!(!dropped.load(Ordering::SeqCst));
    ctx.cancel();

    let (value, error) = task.await.unwrap().into_parts();
    assert_eq!(value, None);
    assert!(error.unwrap().is_cancelled());
    assert!(dropped.load(Ordering::SeqCst));
    assert_quiescent(&cache);

    // giving up is not a failure of the computation, the next caller computes right away
    let computed = cache
        .get_or_compute(&Context::background(), "key", |_| async {
            Ok::<_, TestError>(2)
        })
        .await;
    assert_eq!(computed.into_result().unwrap(), 2);
}

async fn explode() -> Result<u32, TestError> {
    panic!("computation exploded")
}

#[tokio::test(start_paused = true)]
async fn test_panic_releases_lock_and_slot() {
    setup();
    let cache = refresh_cache(Duration::from_secs(1), Duration::from_secs(60), ms(100), 1);

    let task = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            cache
                .get_or_compute(&Context::background(), "key", |_| explode())
                .await
        })
    };
    let error = task.await.unwrap_err();
    assert!(error.is_panic());
    assert_quiescent(&cache);

    // the panic is recorded like any other failure
    let computed = cache
        .get_or_compute(&Context::background(), "key", |_| async {
            Ok::<_, TestError>(1)
        })
        .await;
    let (value, error) = computed.into_parts();
    assert_eq!(value, None);
    insta::assert_snapshot!(error.unwrap().to_string(), @"computation panicked");

    tokio::time::sleep(ms(101)).await;
    let computed = cache
        .get_or_compute(&Context::background(), "key", |_| async {
            Ok::<_, TestError>(1)
        })
        .await;
    assert_eq!(computed.into_result().unwrap(), 1);
}
