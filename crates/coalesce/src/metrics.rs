//! Statsd reporting for coalescers.
//!
//! Nothing is sent until [`configure_statsd`] was called, the [`metric!`](crate::metric) macro
//! is a no-op until then.
use std::collections::BTreeMap;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

static METRICS_CLIENT: OnceLock<MetricsClient> = OnceLock::new();

/// The traits the [`metric!`](crate::metric) macro needs in scope.
pub mod prelude {
    pub use cadence::prelude::*;
}

/// A statsd client which attaches a fixed set of tags to every metric.
#[derive(Debug)]
pub struct MetricsClient {
    statsd: StatsdClient,
    global_tags: BTreeMap<String, String>,
}

impl MetricsClient {
    pub fn statsd(&self) -> &StatsdClient {
        &self.statsd
    }

    /// Adds the global tags to `metric` and sends it.
    #[inline(always)]
    pub fn send_metric<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        for (tag, value) in &self.global_tags {
            metric = metric.with_tag(tag, value);
        }
        metric.send()
    }
}

/// Reports all metrics to the statsd server at `host`, prefixed with `prefix`.
///
/// This can only be done once per process, later calls return an error.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    global_tags: BTreeMap<String, String>,
) -> Result<()> {
    let addrs: Vec<_> = host
        .to_socket_addrs()
        .context("failed to resolve statsd host")?
        .collect();
    let Some(addr) = addrs.first() else {
        anyhow::bail!("statsd host did not resolve to any address");
    };
    tracing::info!("Reporting metrics to statsd at {}", addr);

    let socket = UdpSocket::bind("0.0.0.0:0").context("failed to bind statsd socket")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket).context("failed to create statsd sink")?;

    let client = MetricsClient {
        statsd: StatsdClient::from_sink(prefix, sink),
        global_tags,
    };
    METRICS_CLIENT
        .set(client)
        .map_err(|_| anyhow::anyhow!("statsd was already configured"))
}

/// Invokes `f` with the configured client, or returns the default if there is none.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    METRICS_CLIENT.get().map(f).unwrap_or_default()
}

/// Emits a counter or a timer, with optional `"tag" => value` pairs.
///
/// ```ignore
/// metric!(counter("coalesce.access") += 1, "cache" => name);
/// metric!(timer("coalesce.computation.duration") = start.elapsed(), "cache" => name);
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.statsd().count_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};

    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.statsd().time_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};
}
