use crate::{Error, Policy, Result, SaturationPolicy};
use core::time::Duration;
use tokio::sync::Semaphore;

/// Construction parameters for a [`Balancer`](crate::Balancer).
///
/// Only `workers`, `queue_capacity` and `policy` shape the dispatch
/// algorithm. The remaining fields tune buffering and teardown and have
/// defaults that suit most workloads.
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// Number of worker tasks. Fixed for the balancer's lifetime.
    pub workers: usize,

    /// Capacity of each worker's inbound queue.
    ///
    /// Size this to the expected burst depth. Under
    /// [`SaturationPolicy::Block`] a full queue stalls the whole balancer.
    pub queue_capacity: usize,

    /// Capacity of the submission channel between producers and the
    /// balancer. A full channel makes [`submit`](crate::Balancer::submit)
    /// wait.
    pub submission_capacity: usize,

    /// Worker selection policy.
    pub policy: Policy,

    /// Behavior when the chosen worker's queue is full.
    pub saturation: SaturationPolicy,

    /// How long shutdown waits for workers to drain their queues before
    /// abandoning them.
    pub shutdown_timeout: Duration,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_capacity: 100,
            submission_capacity: 64,
            policy: Policy::default(),
            saturation: SaturationPolicy::default(),
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

impl BalancerConfig {
    pub fn new(workers: usize, queue_capacity: usize, policy: Policy) -> Self {
        Self {
            workers,
            queue_capacity,
            policy,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_submission_capacity(mut self, submission_capacity: usize) -> Self {
        self.submission_capacity = submission_capacity;
        self
    }

    #[must_use]
    pub fn with_saturation(mut self, saturation: SaturationPolicy) -> Self {
        self.saturation = saturation;
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    /// Capacity of the completion channel.
    ///
    /// Every request in flight can owe at most one completion event, and a
    /// worker holds at most `queue_capacity` queued requests plus the one it
    /// is executing. Sizing the channel to that bound means a worker never
    /// waits to report completion, even while the balancer is blocked on a
    /// full queue.
    pub(crate) fn completion_capacity(&self) -> usize {
        self.checked_completion_capacity().unwrap_or(usize::MAX)
    }

    fn checked_completion_capacity(&self) -> Option<usize> {
        self.queue_capacity
            .checked_add(1)
            .and_then(|per_worker| per_worker.checked_mul(self.workers))
    }

    /// Checks the parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when any capacity or the worker count
    /// is zero, or when a channel would exceed [`Semaphore::MAX_PERMITS`].
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::InvalidConfig {
                reason: "workers must be greater than 0".to_string(),
            });
        }
        if self.queue_capacity == 0 {
            return Err(Error::InvalidConfig {
                reason: "queue_capacity must be greater than 0".to_string(),
            });
        }
        if self.submission_capacity == 0 {
            return Err(Error::InvalidConfig {
                reason: "submission_capacity must be greater than 0".to_string(),
            });
        }
        if self.queue_capacity > Semaphore::MAX_PERMITS {
            return Err(Error::InvalidConfig {
                reason: format!("queue_capacity exceeds {}", Semaphore::MAX_PERMITS),
            });
        }
        if self.submission_capacity > Semaphore::MAX_PERMITS {
            return Err(Error::InvalidConfig {
                reason: format!("submission_capacity exceeds {}", Semaphore::MAX_PERMITS),
            });
        }
        match self.checked_completion_capacity() {
            Some(capacity) if capacity <= Semaphore::MAX_PERMITS => Ok(()),
            _ => Err(Error::InvalidConfig {
                reason: format!(
                    "workers * (queue_capacity + 1) exceeds {}",
                    Semaphore::MAX_PERMITS
                ),
            }),
        }
    }
}
