//! A global admission gate for computations.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::context::Context;
use crate::error::RefreshError;

/// Limits the number of computations running concurrently across all keys.
///
/// This is independent of the per-key exclusivity and protects whatever the computations talk to
/// from fan-out when many distinct keys are refreshed at once. A capacity of `0` disables the
/// limit.
#[derive(Clone, Debug)]
pub struct ConcurrencyLimiter {
    semaphore: Option<Arc<Semaphore>>,
    capacity: usize,
}

/// An admission slot, which is returned to the limiter when dropped.
#[derive(Debug)]
#[must_use = "the admission slot is released right away when dropped"]
pub struct AdmissionPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        let capacity = max_concurrent.min(Semaphore::MAX_PERMITS);
        Self {
            semaphore: (capacity > 0).then(|| Arc::new(Semaphore::new(capacity))),
            capacity,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// The configured capacity, `None` if unlimited.
    pub fn capacity(&self) -> Option<usize> {
        self.semaphore.as_ref().map(|_| self.capacity)
    }

    /// The number of free slots, `None` if unlimited.
    pub fn available(&self) -> Option<usize> {
        self.semaphore
            .as_ref()
            .map(|semaphore| semaphore.available_permits())
    }

    /// Waits for a free slot until `ctx` is done.
    ///
    /// A context which is already done is rejected without waiting, even if a slot is free.
    pub async fn acquire(&self, ctx: &Context) -> Result<AdmissionPermit, RefreshError> {
        if let Some(error) = ctx.err() {
            return Err(error);
        }
        let Some(semaphore) = &self.semaphore else {
            return Ok(AdmissionPermit { _permit: None });
        };

        if let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() {
            return Ok(AdmissionPermit {
                _permit: Some(permit),
            });
        }

        match ctx.run(Arc::clone(semaphore).acquire_owned()).await? {
            Ok(permit) => Ok(AdmissionPermit {
                _permit: Some(permit),
            }),
            // The semaphore is never closed, treat it like the caller giving up.
            Err(_closed) => Err(RefreshError::Cancelled),
        }
    }
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}
