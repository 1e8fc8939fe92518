use crate::request::{Outcome, Request};
use core::fmt;
use tokio::sync::{mpsc, oneshot};

/// Stable identifier of a worker within one balancer.
///
/// Ids are dense, starting at 0, in construction order. Round-robin visits
/// workers in id order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub(crate) usize);

impl WorkerId {
    /// Returns the worker's construction index.
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Messages accepted on a worker's inbound queue.
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    /// Execute the request, reply, then report completion.
    Request(Request),

    /// Acknowledge and stop. Requests queued before this message are served
    /// first.
    Shutdown { ack: oneshot::Sender<()> },
}

/// Worker task that executes [`Request`]s from its private queue.
///
/// The loop waits on `rx` until a message arrives. For every request it runs
/// the operation on the blocking thread pool, which also delivers the reply,
/// and then sends its own id on `done`. One request is in progress at a time,
/// so completions leave in the order requests were accepted.
///
/// # Arguments
///
/// - `worker_id`: Identifier reported on `done` and used in logs.
/// - `rx`: The worker's inbound queue. Only the balancer writes to it.
/// - `done`: The balancer's completion channel.
///
/// # Message Types
///
/// - [`WorkerMessage::Request`]: run it and report completion.
/// - [`WorkerMessage::Shutdown`]: acknowledge and exit.
pub(crate) async fn worker_loop(
    worker_id: WorkerId,
    mut rx: mpsc::Receiver<WorkerMessage>,
    done: mpsc::Sender<WorkerId>,
) {
    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} started");

    while let Some(msg) = rx.recv().await {
        match msg {
            WorkerMessage::Request(request) => {
                match tokio::task::spawn_blocking(move || request.run()).await {
                    Ok(Outcome::Completed) => {}
                    Ok(Outcome::Faulted { reason: _reason }) => {
                        #[cfg(feature = "tracing")]
                        tracing::error!("Worker {worker_id} operation panicked: {_reason}");
                    }
                    Err(_e) => {
                        // The runtime is going away; the dropped request has
                        // already resolved its handle.
                        #[cfg(feature = "tracing")]
                        tracing::warn!("Worker {worker_id} lost a request: {_e}");
                    }
                }

                if done.send(worker_id).await.is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Worker {worker_id} has no balancer to report to");
                    break;
                }
            }
            WorkerMessage::Shutdown { ack } => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Worker {worker_id} received shutdown signal");

                if ack.send(()).is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Worker {worker_id} failed to acknowledge shutdown");
                }
                break;
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} stopped");
}
