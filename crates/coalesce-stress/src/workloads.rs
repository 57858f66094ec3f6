use std::time::Duration;

use anyhow::{Result, anyhow, ensure};
use rand::Rng;
use serde::{Deserialize, Serialize};

use coalesce::{Computed, Context, RefreshCache};
use coalesce_test::ComputeTracker;

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    /// How many requests are in flight at any time.
    pub concurrency: usize,
    /// The number of distinct keys requests are spread across.
    pub keys: usize,
    /// How long a successful computation takes.
    #[serde(with = "humantime_serde")]
    pub compute_time: Duration,
    /// The share of computations that fail.
    #[serde(default)]
    pub failure_rate: f64,
    /// The share of computations that never finish on their own.
    #[serde(default)]
    pub timeout_rate: f64,
}

/// What an injected computation ends up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Hang,
}

/// A workload ready to be run against a cache.
#[derive(Debug)]
pub struct PreparedWorkload {
    prefix: String,
    keys: usize,
    compute_time: Duration,
    failure_rate: f64,
    timeout_rate: f64,
    /// Counts the computations of this workload.
    pub tracker: ComputeTracker,
}

pub fn prepare_workload(index: usize, workload: &Workload) -> Result<PreparedWorkload> {
    let rate = |name: &str, rate: f64| -> Result<f64> {
        ensure!(rate.is_finite(), "workload {index}: {name} must be a number, got {rate}");
        Ok(rate.clamp(0.0, 1.0))
    };

    Ok(PreparedWorkload {
        prefix: format!("w{index}"),
        keys: workload.keys.max(1),
        compute_time: workload.compute_time,
        failure_rate: rate("failure_rate", workload.failure_rate)?,
        timeout_rate: rate("timeout_rate", workload.timeout_rate)?,
        tracker: ComputeTracker::new(),
    })
}

impl PreparedWorkload {
    /// Picks a random key and the outcome its computation will have, should it be computed.
    fn roll(&self) -> (String, Outcome) {
        let mut rng = rand::rng();
        let key = format!("{}-{}", self.prefix, rng.random_range(0..self.keys));

        let outcome = if rng.random_bool(self.timeout_rate) {
            Outcome::Hang
        } else if rng.random_bool(self.failure_rate) {
            Outcome::Failure
        } else {
            Outcome::Success
        };
        (key, outcome)
    }
}

/// Requests one random key of `workload` from `cache`.
pub async fn process_request(
    cache: &RefreshCache<u64>,
    workload: &PreparedWorkload,
) -> Computed<u64> {
    let (key, outcome) = workload.roll();
    let tracker = &workload.tracker;
    let compute_time = workload.compute_time;

    cache
        .get_or_compute(&Context::background(), &key, |_| async move {
            let _guard = tracker.enter();
            match outcome {
                Outcome::Success => {
                    tokio::time::sleep(compute_time).await;
                    Ok(tracker.total() as u64)
                }
                Outcome::Failure => {
                    tokio::time::sleep(compute_time).await;
                    Err(anyhow!("injected failure"))
                }
                Outcome::Hang => {
                    // cut short by the compute timeout
                    futures::future::pending::<()>().await;
                    Err(anyhow!("hung computation finished"))
                }
            }
        })
        .await
}
