//! Read-only load diagnostics.
//!
//! A [`Snapshot`] is taken by the balancer between two events, so it always
//! describes a consistent pool: the pending-counts sum to
//! `dispatched - completed`.

use crate::{Policy, WorkerId, pool::Slot};

/// Load of a single worker at snapshot time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerLoad {
    pub worker: WorkerId,
    /// Slot in the pool's backing array. For round-robin this equals the
    /// worker's index.
    pub position: usize,
    pub pending: usize,
}

/// Per-worker load plus aggregate statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub policy: Policy,
    /// Workers in pool order.
    pub workers: Vec<WorkerLoad>,
    /// Mean pending-count across the pool.
    pub mean: f64,
    /// Population variance of the pending-count.
    pub variance: f64,
    /// Requests handed to a worker queue.
    pub dispatched: u64,
    /// Completion events processed.
    pub completed: u64,
    /// Requests resolved with an error before reaching a worker.
    pub rejected: u64,
}

impl Snapshot {
    pub(crate) fn new(
        policy: Policy,
        slots: impl Iterator<Item = Slot>,
        dispatched: u64,
        completed: u64,
        rejected: u64,
    ) -> Self {
        let workers: Vec<_> = slots
            .map(|slot| WorkerLoad {
                worker: slot.worker,
                position: slot.position,
                pending: slot.pending,
            })
            .collect();
        let (mean, variance) = mean_variance(workers.iter().map(|load| load.pending));

        Self {
            policy,
            workers,
            mean,
            variance,
            dispatched,
            completed,
            rejected,
        }
    }

    pub fn total_pending(&self) -> usize {
        self.workers.iter().map(|load| load.pending).sum()
    }

    pub fn pending(&self, worker: WorkerId) -> Option<usize> {
        self.workers
            .iter()
            .find(|load| load.worker == worker)
            .map(|load| load.pending)
    }
}

/// Mean and population variance of a set of pending-counts.
///
/// Returns `(0.0, 0.0)` for an empty set.
pub(crate) fn mean_variance(loads: impl Iterator<Item = usize>) -> (f64, f64) {
    let (n, sum, sum_sq) = loads.fold((0_u64, 0_u64, 0_u64), |(n, sum, sum_sq), load| {
        let load = load as u64;
        (n + 1, sum + load, sum_sq + load * load)
    });
    if n == 0 {
        return (0.0, 0.0);
    }

    let n = n as f64;
    let mean = sum as f64 / n;
    let variance = (sum_sq as f64 / n - mean * mean).max(0.0);
    (mean, variance)
}
