//! Concurrency control for image optimisation.
//!
//! Decoding and encoding hold a full-resolution bitmap in memory for the duration of a request,
//! so the number of optimisations in flight is capped. Requests over the cap wait in a bounded
//! queue for a limited time and are then turned away with HTTP 429.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::{LimitsConfig, OptimizationLimitsConfig};
use crate::errors::{Error, Result};

/// Container for all resource limiters.
#[derive(Debug, Default, Clone)]
pub struct Limiters {
    /// Limiter for concurrent optimisations. None means unlimited.
    pub optimizations: Option<Arc<OptimizationLimiter>>,
}

impl Limiters {
    pub fn new(config: &LimitsConfig) -> Self {
        Self {
            optimizations: OptimizationLimiter::new(&config.optimizations).map(Arc::new),
        }
    }
}

/// Bounded-queue semaphore in front of the optimisation pipeline.
#[derive(Debug)]
pub struct OptimizationLimiter {
    semaphore: Arc<Semaphore>,
    /// Requests currently waiting for a permit
    waiting: AtomicUsize,
    /// None = unlimited waiting queue
    max_waiting: Option<usize>,
    max_wait: Duration,
}

impl OptimizationLimiter {
    /// Returns `None` when `max_concurrent` is 0 (no limit).
    pub fn new(config: &OptimizationLimitsConfig) -> Option<Self> {
        if config.max_concurrent == 0 {
            return None;
        }

        Some(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            waiting: AtomicUsize::new(0),
            max_waiting: (config.max_waiting != 0).then_some(config.max_waiting),
            max_wait: Duration::from_secs(config.max_wait_secs),
        })
    }

    /// Number of optimisations that could start right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Take a slot, waiting up to `max_wait` if none is free.
    ///
    /// Fails with [`Error::TooManyRequests`] when the waiting queue is full or the wait times out.
    pub async fn acquire(&self) -> Result<OptimizationPermit> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(OptimizationPermit { _permit: permit });
        }

        let queued = self.waiting.fetch_add(1, Ordering::SeqCst);
        let _waiting = WaitingGuard(&self.waiting);

        if let Some(max_waiting) = self.max_waiting
            && queued >= max_waiting
        {
            debug!(queued, max_waiting, "optimisation queue full");
            return Err(busy("Too many optimisations in progress. Please retry later."));
        }

        // A permit may have been released while we joined the queue
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(OptimizationPermit { _permit: permit });
        }

        if self.max_wait.is_zero() {
            return Err(busy("Too many optimisations in progress. Please retry later."));
        }

        match tokio::time::timeout(self.max_wait, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(OptimizationPermit { _permit: permit }),
            Ok(Err(_)) => Err(busy("Optimisation service temporarily unavailable.")),
            Err(_) => Err(busy("Timed out waiting for an optimisation slot. Please retry later.")),
        }
    }
}

fn busy(message: &str) -> Error {
    Error::TooManyRequests {
        message: message.to_string(),
    }
}

/// Leaves the waiting queue on every exit path.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// RAII guard that frees the optimisation slot when dropped.
#[must_use]
pub struct OptimizationPermit {
    _permit: OwnedSemaphorePermit,
}
