//! Error types for the dispatch engine.
//!
//! This module defines the central `Error` enum. Every reply handle resolves to
//! `Result<R, Error>`, so engine failures reach the producer through the same
//! channel as the operation's value.
//!
//! ## Error Cases
//! - `QueueSaturated`: A worker's queue was full at dispatch time and the
//!   balancer runs with [`SaturationPolicy::Reject`].
//! - `WorkerFault`: The operation panicked while a worker was executing it.
//! - `ShutdownInProgress`: The request arrived after teardown began, or was
//!   still queued when its worker was abandoned.
//! - `InvalidConfig`: A [`BalancerConfig`] failed validation.
//! - `ChannelError`: An internal communication failure between tasks.
//!
//! [`SaturationPolicy::Reject`]: crate::SaturationPolicy::Reject
//! [`BalancerConfig`]: crate::BalancerConfig

use crate::WorkerId;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the dispatch engine.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The chosen worker's inbound queue had no free slot.
    #[error("Queue saturated: worker {worker} has no free slot")]
    QueueSaturated { worker: WorkerId },

    /// The operation panicked. The worker survived and keeps serving.
    #[error("Worker fault: {reason}")]
    WorkerFault { reason: String },

    /// The balancer is shutting down and no longer accepts work.
    #[error("Balancer is shutting down")]
    ShutdownInProgress,

    /// Construction parameters were rejected.
    #[error("Invalid config: {reason}")]
    InvalidConfig { reason: String },

    /// Internal channel send/receive failure (e.g., the balancer task is gone).
    #[error("Channel error: {context}")]
    ChannelError { context: String },
}
