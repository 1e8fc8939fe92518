//! Worker pool ordered by pending-count.
//!
//! [`Pool`] is a binary min-heap of [`WorkerId`]s keyed by each worker's
//! pending-count. It exposes peek-min, extract-min, insert and remove as its
//! only structural operations, each O(log n). Every worker records its current
//! position in the backing array, and every swap rewrites both positions, so
//! `remove` can locate a worker without a scan.
//!
//! Positions never leave this module. Callers address workers by id.
//!
//! A pool built for [`Policy::RoundRobin`] is never reordered: the backing
//! array stays in id order and pending-counts are kept for diagnostics only.

use crate::{Policy, WorkerId};


struct Entry<W> {
    worker: W,
    pending: usize,
    /// Index in `Pool::heap`, or `None` while the worker is detached.
    position: Option<usize>,
}

/// One worker's load as seen by diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Slot {
    pub(crate) worker: WorkerId,
    pub(crate) position: usize,
    pub(crate) pending: usize,
}

pub(crate) struct Pool<W> {
    entries: Vec<Entry<W>>,
    heap: Vec<WorkerId>,
    ordered: bool,
}

impl<W> Pool<W> {
    /// Builds a pool with every worker attached and idle.
    ///
    /// With all keys at zero the identity order already satisfies the heap
    /// property.
    pub(crate) fn new(workers: impl IntoIterator<Item = W>, policy: Policy) -> Self {
        let entries: Vec<_> = workers
            .into_iter()
            .enumerate()
            .map(|(i, worker)| Entry {
                worker,
                pending: 0,
                position: Some(i),
            })
            .collect();
        let heap = (0..entries.len()).map(WorkerId).collect();

        Self {
            entries,
            heap,
            ordered: policy == Policy::LeastLoaded,
        }
    }

    /// Total number of workers, attached or not.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn worker(&self, id: WorkerId) -> &W {
        &self.entries[id.0].worker
    }

    pub(crate) fn pending(&self, id: WorkerId) -> usize {
        self.entries[id.0].pending
    }

    /// Returns the least-loaded attached worker without detaching it.
    pub(crate) fn peek_min(&self) -> Option<WorkerId> {
        self.heap.first().copied()
    }

    /// Detaches and returns the least-loaded worker.
    pub(crate) fn pop_min(&mut self) -> Option<WorkerId> {
        self.assert_ordered("pop_min");
        let last = self.heap.len().checked_sub(1)?;
        self.swap(0, last);
        let id = self.heap.pop()?;
        self.entries[id.0].position = None;
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        Some(id)
    }

    /// Attaches a detached worker at the place its pending-count dictates.
    ///
    /// # Panics
    ///
    /// Panics if the worker is already attached.
    pub(crate) fn push(&mut self, id: WorkerId) {
        self.assert_ordered("push");
        assert!(
            self.entries[id.0].position.is_none(),
            "worker {id} is already in the pool"
        );
        let pos = self.heap.len();
        self.heap.push(id);
        self.entries[id.0].position = Some(pos);
        self.sift_up(pos);
    }

    /// Detaches a worker from wherever it currently sits.
    ///
    /// # Panics
    ///
    /// Panics if the worker is not attached or its recorded position
    /// disagrees with the backing array. Either means the position
    /// bookkeeping is corrupt.
    pub(crate) fn remove(&mut self, id: WorkerId) {
        self.assert_ordered("remove");
        let Some(pos) = self.entries[id.0].position else {
            panic!("worker {id} is not in the pool");
        };
        assert_eq!(
            self.heap[pos], id,
            "worker {id} records position {pos} but the pool disagrees"
        );

        let last = self.heap.len() - 1;
        if pos != last {
            self.swap(pos, last);
        }
        self.heap.pop();
        self.entries[id.0].position = None;

        if pos < self.heap.len() && !self.sift_down(pos) {
            self.sift_up(pos);
        }
    }

    /// Adds one pending request to `id`.
    ///
    /// In least-loaded mode the worker must be detached first.
    pub(crate) fn increment(&mut self, id: WorkerId) {
        self.assert_detached(id);
        self.entries[id.0].pending += 1;
    }

    /// Removes one pending request from `id`.
    ///
    /// In least-loaded mode the worker must be detached first.
    ///
    /// # Panics
    ///
    /// Panics if the worker has nothing pending.
    pub(crate) fn decrement(&mut self, id: WorkerId) {
        self.assert_detached(id);
        let entry = &mut self.entries[id.0];
        assert!(entry.pending > 0, "worker {id} completed more than it accepted");
        entry.pending -= 1;
    }

    /// Attached workers in backing-array order.
    pub(crate) fn slots(&self) -> impl Iterator<Item = Slot> + '_ {
        self.heap.iter().enumerate().map(|(position, &worker)| Slot {
            worker,
            position,
            pending: self.entries[worker.0].pending,
        })
    }

    /// Every worker in id order, attached or not.
    pub(crate) fn workers(&self) -> impl Iterator<Item = (WorkerId, &W)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (WorkerId(i), &entry.worker))
    }

    pub(crate) fn total_pending(&self) -> usize {
        self.entries.iter().map(|entry| entry.pending).sum()
    }

    fn less(&self, i: usize, j: usize) -> bool {
        self.entries[self.heap[i].0].pending < self.entries[self.heap[j].0].pending
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.entries[self.heap[i].0].position = Some(i);
        self.entries[self.heap[j].0].position = Some(j);
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.less(pos, parent) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    /// Returns whether the element moved.
    fn sift_down(&mut self, start: usize) -> bool {
        let len = self.heap.len();
        let mut pos = start;
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.less(right, left) {
                right
            } else {
                left
            };
            if !self.less(child, pos) {
                break;
            }
            self.swap(pos, child);
            pos = child;
        }
        pos > start
    }

    fn assert_ordered(&self, op: &str) {
        assert!(self.ordered, "{op} called on a round-robin pool");
    }

    fn assert_detached(&self, id: WorkerId) {
        assert!(
            !self.ordered || self.entries[id.0].position.is_none(),
            "worker {id} changed load while still in the pool"
        );
    }

    /// Checks the position bookkeeping and, when ordered, the heap property.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        for (pos, id) in self.heap.iter().enumerate() {
            assert_eq!(
                self.entries[id.0].position,
                Some(pos),
                "worker {id} has a stale position"
            );
        }
        let attached = self
            .entries
            .iter()
            .filter(|entry| entry.position.is_some())
            .count();
        assert_eq!(attached, self.heap.len(), "detached worker has a position");

        if self.ordered {
            for pos in 1..self.heap.len() {
                let parent = (pos - 1) / 2;
                assert!(
                    !self.less(pos, parent),
                    "heap property violated between positions {parent} and {pos}"
                );
            }
        }
    }
}
