//! Deadlines and cancellation for a single call.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::RefreshError;

#[derive(Clone, Copy, Debug)]
struct Deadline {
    at: Instant,
    /// The time budget that was granted when the deadline was derived.
    budget: Duration,
}

/// The deadline and cancellation scope of a call.
///
/// A `Context` is threaded through every point where a call may be suspended: waiting for an
/// admission slot, waiting for the key lock, and the computation itself. Derived contexts never
/// outlive their parent: their deadline is the earlier of both, and cancelling the parent cancels
/// all derived contexts, but not the other way around.
#[derive(Clone, Debug, Default)]
pub struct Context {
    deadline: Option<Deadline>,
    token: CancellationToken,
}

impl Context {
    /// A context without deadline, which is only ever cancelled explicitly.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derives a context which expires after `timeout`, or earlier if `self` does.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let now = Instant::now();
        // A timeout too large to be represented is no deadline at all.
        let deadline = match (self.deadline, now.checked_add(timeout)) {
            (Some(parent), Some(at)) if parent.at <= at => Some(Deadline {
                at: parent.at,
                budget: parent.at.saturating_duration_since(now),
            }),
            (_, Some(at)) => Some(Deadline {
                at,
                budget: timeout,
            }),
            (parent, None) => parent,
        };

        Self {
            deadline,
            token: self.token.child_token(),
        }
    }

    /// Derives a context which expires at `deadline`, or earlier if `self` does.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        self.with_timeout(deadline.saturating_duration_since(Instant::now()))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.map(|deadline| deadline.at)
    }

    /// The time left until the deadline, `None` if there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| deadline.at <= Instant::now())
    }

    /// Cancels this context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns the reason this context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<RefreshError> {
        if self.is_cancelled() {
            return Some(RefreshError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if deadline.at <= Instant::now() => {
                Some(RefreshError::Timeout(deadline.budget))
            }
            _ => None,
        }
    }

    /// Resolves once this context is cancelled or its deadline elapses.
    pub async fn done(&self) -> RefreshError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => RefreshError::Cancelled,
                _ = tokio::time::sleep_until(deadline.at) => RefreshError::Timeout(deadline.budget),
            },
            None => {
                self.token.cancelled().await;
                RefreshError::Cancelled
            }
        }
    }

    /// Drives `future` to completion unless this context is done first.
    ///
    /// The future is dropped when the context wins. A future that is ready at the same time as
    /// the deadline elapses still gets to deliver its output.
    pub async fn run<F: Future>(&self, future: F) -> Result<F::Output, RefreshError> {
        tokio::select! {
            biased;
            output = future => Ok(output),
            error = self.done() => Err(error),
        }
    }
}
