//! The single-owner dispatch loop and its public handle.
//!
//! [`Balancer`] is a cheap, cloneable handle. All pool state lives in a
//! [`Dispatcher`] owned by one Tokio task, which reacts to three sources:
//!
//! - completion events from workers (`completed`),
//! - control messages from handles (snapshot, shutdown),
//! - submissions from producers (`dispatch`).
//!
//! Completions are always drained before the next submission is routed.
//! Nothing else touches the pool, so it carries no lock.

use crate::{
    BalancerConfig, Error, Policy, ReplyHandle, Result, SaturationPolicy, Snapshot,
    pool::Pool,
    request::Request,
    worker::{WorkerId, WorkerMessage, worker_loop},
};
use core::time::Duration;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot,
};
use tokio_util::sync::CancellationToken;

#[cfg(test)]
mod tests;

enum Control {
    Snapshot { reply: oneshot::Sender<Snapshot> },
    Shutdown { ack: oneshot::Sender<()> },
}

/// Routes submitted operations to a fixed pool of workers.
///
/// Clones share the same balancer. The balancer keeps running while any clone
/// is alive or until [`shutdown`](Self::shutdown) is called.
#[derive(Clone)]
pub struct Balancer {
    config: BalancerConfig,
    submissions: mpsc::Sender<Request>,
    control: mpsc::Sender<Control>,
    shutdown_token: CancellationToken,
}

impl Balancer {
    /// Spawns the workers and the balancer loop.
    ///
    /// Each worker owns a bounded queue of `queue_capacity` requests. The
    /// completion channel is sized so no worker ever waits to report.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration does not validate.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(config: BalancerConfig) -> Result<Self> {
        config.validate()?;

        let (done_tx, done_rx) = mpsc::channel(config.completion_capacity());
        let mut queues = Vec::with_capacity(config.workers);
        for worker_id in (0..config.workers).map(WorkerId) {
            let (tx, rx) = mpsc::channel(config.queue_capacity);
            queues.push(tx);
            tokio::spawn(worker_loop(worker_id, rx, done_tx.clone()));
        }
        drop(done_tx);

        let (submissions, submission_rx) = mpsc::channel(config.submission_capacity);
        let (control, control_rx) = mpsc::channel(config.workers.max(8));

        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting balancer with {} {} workers (queue capacity {}, {} on saturation)",
            config.workers,
            config.policy,
            config.queue_capacity,
            config.saturation
        );

        let dispatcher = Dispatcher::new(&config, queues);
        tokio::spawn(dispatcher.run(submission_rx, control_rx, done_rx));

        Ok(Self {
            config,
            submissions,
            control,
            shutdown_token: CancellationToken::new(),
        })
    }

    /// Shorthand for [`Balancer::new`] with default buffering and teardown
    /// settings.
    ///
    /// # Errors
    ///
    /// See [`Balancer::new`].
    pub fn with_policy(workers: usize, queue_capacity: usize, policy: Policy) -> Result<Self> {
        Self::new(BalancerConfig::new(workers, queue_capacity, policy))
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    /// Submits `op` for execution on one of the workers.
    ///
    /// Waits only while the submission channel is full. The returned handle
    /// resolves exactly once: with the operation's value, or with
    /// [`Error::WorkerFault`], [`Error::QueueSaturated`] or
    /// [`Error::ShutdownInProgress`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShutdownInProgress`] once shutdown has begun.
    pub async fn submit<F, R>(&self, op: F) -> Result<ReplyHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.shutdown_token.is_cancelled() {
            return Err(Error::ShutdownInProgress);
        }

        let (request, handle) = Request::new(op);
        // A closed channel means the loop is draining or gone. The request
        // inside the error is dropped, which resolves its handle too.
        self.submissions
            .send(request)
            .await
            .map_err(|_| Error::ShutdownInProgress)?;
        Ok(handle)
    }

    /// Returns the load of every worker, taken between two events.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShutdownInProgress`] if the balancer loop has exited.
    pub async fn snapshot(&self) -> Result<Snapshot> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(Control::Snapshot { reply })
            .await
            .map_err(|_| Error::ShutdownInProgress)?;
        rx.await.map_err(|_| Error::ShutdownInProgress)
    }

    /// Gracefully shuts the balancer down.
    ///
    /// - Rejects new submissions with [`Error::ShutdownInProgress`].
    /// - Rejects submissions still waiting in the submission channel.
    /// - Lets every worker finish its queue, then stops it.
    /// - Waits up to `shutdown_timeout` for the workers to acknowledge.
    ///
    /// Returns once the balancer loop has exited. Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_token.cancel();

        let (ack, rx) = oneshot::channel();
        if self.control.send(Control::Shutdown { ack }).await.is_err() {
            return Ok(());
        }
        // An error means another caller's shutdown finished first and the
        // loop dropped our message; either way the loop is gone.
        let _ = rx.await;
        Ok(())
    }

    /// Whether shutdown has been requested through this balancer.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }
}

/// Worker-side state held in the pool.
struct WorkerHandle {
    queue: mpsc::Sender<WorkerMessage>,
}

/// State owned by the balancer loop. Only this type mutates the pool.
struct Dispatcher {
    pool: Pool<WorkerHandle>,
    policy: Policy,
    saturation: SaturationPolicy,
    shutdown_timeout: Duration,
    /// Next round-robin worker.
    cursor: usize,
    dispatched: u64,
    completed: u64,
    rejected: u64,
}

impl Dispatcher {
    fn new(config: &BalancerConfig, queues: Vec<mpsc::Sender<WorkerMessage>>) -> Self {
        let pool = Pool::new(
            queues.into_iter().map(|queue| WorkerHandle { queue }),
            config.policy,
        );
        Self {
            pool,
            policy: config.policy,
            saturation: config.saturation,
            shutdown_timeout: config.shutdown_timeout,
            cursor: 0,
            dispatched: 0,
            completed: 0,
            rejected: 0,
        }
    }

    async fn run(
        mut self,
        mut submissions: mpsc::Receiver<Request>,
        mut control: mpsc::Receiver<Control>,
        mut done: mpsc::Receiver<WorkerId>,
    ) {
        loop {
            tokio::select! {
                biased;

                Some(worker) = done.recv() => self.completed(worker),
                Some(msg) = control.recv() => match msg {
                    Control::Snapshot { reply } => {
                        let _ = reply.send(self.snapshot());
                    }
                    Control::Shutdown { ack } => {
                        #[cfg(feature = "tracing")]
                        tracing::info!("Shutdown requested");
                        self.drain(submissions, done).await;
                        let _ = ack.send(());
                        return;
                    }
                },
                submission = submissions.recv() => match submission {
                    Some(request) => {
                        // A failed dispatch has already resolved the
                        // request's handle with the error.
                        let _ = self.dispatch(request).await;
                    }
                    None => {
                        #[cfg(feature = "tracing")]
                        tracing::info!("All balancer handles dropped");
                        self.drain(submissions, done).await;
                        return;
                    }
                },
            }

            #[cfg(feature = "tracing")]
            self.trace_load();
        }
    }

    /// Routes one request to a worker according to the policy.
    ///
    /// Returns the chosen worker, or the error the request's handle was
    /// resolved with.
    ///
    /// # Panics
    ///
    /// Panics under least-loaded if the heap is missing a worker, which means
    /// the pool bookkeeping is corrupt.
    async fn dispatch(&mut self, request: Request) -> Result<WorkerId> {
        let worker = match self.policy {
            Policy::RoundRobin => {
                let worker = WorkerId(self.cursor);
                self.cursor = (self.cursor + 1) % self.pool.len();
                worker
            }
            // Every worker is back in the heap between dispatches.
            Policy::LeastLoaded => self
                .pool
                .pop_min()
                .expect("least-loaded pool lost a worker"),
        };

        let sent = self.enqueue(worker, request).await;
        if sent.is_ok() {
            self.pool.increment(worker);
            self.dispatched += 1;
        } else {
            self.rejected += 1;
        }
        if self.policy == Policy::LeastLoaded {
            self.pool.push(worker);
        }

        #[cfg(feature = "tracing")]
        match &sent {
            Ok(()) => tracing::trace!(
                "Dispatched to worker {worker} ({} pending)",
                self.pool.pending(worker)
            ),
            Err(_e) => tracing::warn!("Rejected request for worker {worker}: {_e}"),
        }

        sent.map(|()| worker)
    }

    async fn enqueue(&self, worker: WorkerId, request: Request) -> Result<()> {
        let queue = &self.pool.worker(worker).queue;
        let msg = WorkerMessage::Request(request);

        let (err, returned) = match self.saturation {
            SaturationPolicy::Block => match queue.send(msg).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(msg)) => (closed(worker), msg),
            },
            SaturationPolicy::Reject => match queue.try_send(msg) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(msg)) => (Error::QueueSaturated { worker }, msg),
                Err(TrySendError::Closed(msg)) => (closed(worker), msg),
            },
        };

        if let WorkerMessage::Request(request) = returned {
            request.reject(err.clone());
        }
        Err(err)
    }

    /// Applies a completion event reported by `worker`.
    fn completed(&mut self, worker: WorkerId) {
        self.completed += 1;
        match self.policy {
            Policy::RoundRobin => self.pool.decrement(worker),
            Policy::LeastLoaded => {
                self.pool.remove(worker);
                self.pool.decrement(worker);
                self.pool.push(worker);
            }
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot::new(
            self.policy,
            self.pool.slots(),
            self.dispatched,
            self.completed,
            self.rejected,
        )
    }

    #[cfg(feature = "tracing")]
    fn trace_load(&self) {
        if tracing::enabled!(tracing::Level::TRACE) {
            let (mean, variance) =
                crate::stats::mean_variance(self.pool.slots().map(|slot| slot.pending));
            tracing::trace!(
                workers = self.pool.len(),
                pending = self.pool.total_pending(),
                "Pool load avg {mean:.2} variance {variance:.2}"
            );
        }
    }

    /// Tears the loop down.
    ///
    /// Closes and empties the submission channel, asks every worker to stop
    /// after its queued requests, and keeps applying completions until all
    /// workers acknowledge or `shutdown_timeout` expires.
    async fn drain(
        &mut self,
        mut submissions: mpsc::Receiver<Request>,
        mut done: mpsc::Receiver<WorkerId>,
    ) {
        // === Phase 1: Refuse anything not yet dispatched ===
        submissions.close();
        while let Some(request) = submissions.recv().await {
            request.reject(Error::ShutdownInProgress);
            self.rejected += 1;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Draining {} pending requests across {} workers",
            self.pool.total_pending(),
            self.pool.len()
        );

        // === Phase 2: Notify workers behind their queued work ===
        let queues: Vec<_> = self
            .pool
            .workers()
            .map(|(worker, handle)| (worker, handle.queue.clone()))
            .collect();
        let notify = futures::future::join_all(queues.into_iter().map(
            |(_worker, queue)| async move {
                let (ack, rx) = oneshot::channel();
                if queue.send(WorkerMessage::Shutdown { ack }).await.is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Failed to send shutdown to worker {_worker}");
                    return;
                }
                if rx.await.is_ok() {
                    #[cfg(feature = "tracing")]
                    tracing::trace!("Worker {_worker} shutdown acknowledged");
                }
            },
        ));
        tokio::pin!(notify);
        let deadline = tokio::time::sleep(self.shutdown_timeout);
        tokio::pin!(deadline);

        // === Phase 3: Keep completions flowing until every worker is done ===
        loop {
            tokio::select! {
                biased;

                Some(worker) = done.recv() => self.completed(worker),
                _ = &mut notify => break,
                () = &mut deadline => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        "Worker drain timed out ({} requests still pending)",
                        self.pool.total_pending()
                    );
                    break;
                }
            }
        }

        // Workers report completion before acknowledging, so anything left is
        // already buffered.
        while let Ok(worker) = done.try_recv() {
            self.completed(worker);
        }

        #[cfg(feature = "tracing")]
        tracing::info!(
            "Balancer shutdown complete ({} dispatched, {} completed, {} rejected)",
            self.dispatched,
            self.completed,
            self.rejected
        );
    }
}

fn closed(worker: WorkerId) -> Error {
    Error::ChannelError {
        context: format!("Worker {worker} queue closed"),
    }
}
