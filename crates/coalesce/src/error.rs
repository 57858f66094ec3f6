use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// The failure reported by a computation.
///
/// This is shared so that one failure can be handed out to the caller and remembered in the
/// cached entry while it backs off.
pub type ComputeError = Arc<dyn StdError + Send + Sync + 'static>;

/// An error returned from [`Coalescer::get_or_compute`](crate::Coalescer::get_or_compute).
///
/// All of these are recoverable, the caller may retry. Note that a cached value might be returned
/// alongside any of them, see [`Computed`](crate::Computed).
#[derive(Debug, Clone, Error)]
pub enum RefreshError {
    /// Waiting for an admission slot, the key lock, or the computation itself exceeded the call
    /// budget.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The caller's [`Context`](crate::Context) was cancelled.
    #[error("cancelled")]
    Cancelled,
    /// The computation reported a failure.
    ///
    /// This displays the underlying cause verbatim.
    #[error(transparent)]
    Compute(ComputeError),
}

impl RefreshError {
    /// Wraps the failure of a computation.
    ///
    /// A computation propagating its own context error keeps that error as-is.
    pub fn compute<E>(error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        match error.into().downcast::<Self>() {
            Ok(error) => *error,
            Err(error) => Self::Compute(Arc::from(error)),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// A short, fixed tag for this error usable in metrics.
    pub(crate) fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Compute(_) => "compute",
        }
    }
}

/// An invalid configuration, detected when constructing a coalescer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("compute_timeout must be greater than zero")]
    MissingComputeTimeout,
    #[error("refresh_window must be greater than zero")]
    MissingRefreshWindow,
    /// Entries could be evicted by the store before a retry ever had the chance to succeed.
    #[error(
        "expire_window ({expire_window:?}) must be zero or at least \
         refresh_window + retry_interval + compute_timeout ({minimum:?})"
    )]
    ExpireWindowTooShort {
        expire_window: Duration,
        minimum: Duration,
    },
}
