use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::error::ConfigError;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "coalesce".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Settings shared by all coalescers.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CoalescerConfig {
    /// Upper bound for a single call once it missed the store, covering the wait for an
    /// admission slot, the wait for the key lock, and the computation itself.
    #[serde(with = "humantime_serde")]
    pub compute_timeout: Duration,

    /// Maximum number of computations running concurrently across all keys.
    ///
    /// `0` means unlimited.
    pub max_concurrent_computations: usize,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            compute_timeout: Duration::from_secs(30),
            max_concurrent_computations: 0,
        }
    }
}

impl CoalescerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.compute_timeout.is_zero() {
            return Err(ConfigError::MissingComputeTimeout);
        }
        Ok(())
    }
}

/// Freshness and expiry settings of a refresh-window cache.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct RefreshWindowConfig {
    /// How long a successfully computed value is handed out before it is recomputed.
    #[serde(with = "humantime_serde")]
    pub refresh_window: Duration,

    /// How long to wait after a failed computation before trying again.
    ///
    /// Within this interval, the previous value is handed out together with the error.
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,

    /// After how long without access an entry is evicted from the store.
    ///
    /// `0` disables expiry. Otherwise it needs to be at least
    /// `refresh_window + retry_interval + compute_timeout`.
    #[serde(with = "humantime_serde")]
    pub expire_window: Duration,

    /// How often the store runs its housekeeping, evicting expired entries.
    ///
    /// `0` disables the periodic sweep, in which case housekeeping only happens as a side effect
    /// of store accesses.
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for RefreshWindowConfig {
    fn default() -> Self {
        Self {
            refresh_window: Duration::from_secs(60),
            retry_interval: Duration::from_secs(5),
            expire_window: Duration::from_secs(600),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl RefreshWindowConfig {
    pub fn validate(&self, coalescer: &CoalescerConfig) -> Result<(), ConfigError> {
        coalescer.validate()?;
        if self.refresh_window.is_zero() {
            return Err(ConfigError::MissingRefreshWindow);
        }

        let minimum = self.refresh_window + self.retry_interval + coalescer.compute_timeout;
        if !self.expire_window.is_zero() && self.expire_window < minimum {
            return Err(ConfigError::ExpireWindowTooShort {
                expire_window: self.expire_window,
                minimum,
            });
        }
        Ok(())
    }

    /// The idle expiry of store entries, `None` if disabled.
    pub fn expire_window(&self) -> Option<Duration> {
        (!self.expire_window.is_zero()).then_some(self.expire_window)
    }

    /// The store sweep cadence, `None` if disabled.
    pub fn cleanup_interval(&self) -> Option<Duration> {
        (!self.cleanup_interval.is_zero()).then_some(self.cleanup_interval)
    }
}

/// Configuration of the cache under test, or in use by an application.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// The name used to tag metrics.
    pub name: String,

    /// Maximum number of entries kept in the store, unbounded if unset.
    pub capacity: Option<u64>,

    #[serde(flatten)]
    pub coalescer: CoalescerConfig,

    #[serde(flatten)]
    pub refresh: RefreshWindowConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "default".into(),
            capacity: None,
            coalescer: CoalescerConfig::default(),
            refresh: RefreshWindowConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// The cache settings.
    pub cache: CacheConfig,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
