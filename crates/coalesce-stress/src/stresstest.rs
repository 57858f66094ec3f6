use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use coalesce::RefreshCache;
use coalesce::config::Config;

use crate::workloads::{WorkloadsConfig, prepare_workload, process_request};

/// How the requests of one workload turned out.
#[derive(Debug, Default)]
struct Outcomes {
    fresh: AtomicUsize,
    stale: AtomicUsize,
    failed: AtomicUsize,
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let cache_config = &config.cache;
    let cache = RefreshCache::<u64>::with_refresh_window(
        &cache_config.name,
        &cache_config.coalescer,
        &cache_config.refresh,
        cache_config.capacity,
    )
    .context("invalid cache configuration")?;
    let cache = Arc::new(cache);

    // initialize workloads
    let workloads: Vec<_> = workloads
        .workloads
        .iter()
        .enumerate()
        .map(|(i, workload)| {
            let prepared = prepare_workload(i, workload)?;
            Ok((workload.concurrency.max(1), Arc::new(prepared)))
        })
        .collect::<Result<_>>()?;

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (concurrency, workload) in workloads.into_iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let cache = Arc::clone(&cache);

        let task = tokio::spawn(async move {
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let outcomes = Arc::new(Outcomes::default());
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let cache = Arc::clone(&cache);
                        let workload = Arc::clone(&workload);
                        let task_durations = Arc::clone(&task_durations);
                        let outcomes = Arc::clone(&outcomes);
                        let task_start = Instant::now();

                        let future = async move {
                            let computed = process_request(&cache, &workload).await;

                            let counter = match (computed.is_ok(), computed.is_stale()) {
                                (true, _) => &outcomes.fresh,
                                (false, true) => &outcomes.stale,
                                (false, false) => &outcomes.failed,
                            };
                            counter.fetch_add(1, Ordering::Relaxed);

                            task_durations
                                .lock()
                                .unwrap_or_else(|poisoned| poisoned.into_inner())
                                .add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        };
                        let future = future.bind_hub(sentry::Hub::new_from_top(sentry::Hub::current()));

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = {
                let mut task_durations = task_durations
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                std::mem::take(&mut *task_durations)
            };

            (concurrency, workload, outcomes, task_durations)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, workload, outcomes, task_durations) =
            task.context("workload task failed")?;

        let ops = task_durations.count();
        let ops_ps = ops as f64 / duration.as_secs_f64();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");

        if ops > 0 {
            let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
            let quantile = |q| {
                let value = task_durations.quantile(q).ok().flatten().unwrap_or_default();
                Duration::from_secs_f64(value)
            };
            let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
            println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
        }

        let fresh = outcomes.fresh.load(Ordering::Relaxed);
        let stale = outcomes.stale.load(Ordering::Relaxed);
        let failed = outcomes.failed.load(Ordering::Relaxed);
        println!("  fresh: {fresh}; stale with error: {stale}; failed: {failed}");

        let tracker = &workload.tracker;
        println!(
            "  computations: {}; max concurrent: {}",
            tracker.total(),
            tracker.max()
        );
    }

    println!();
    println!(
        "Key locks left behind: {}; entries in memory: {}",
        cache.pending_keys(),
        cache.store().entry_count()
    );

    Ok(())
}
