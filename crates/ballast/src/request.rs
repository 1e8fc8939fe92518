//! Units of work travelling from producers to workers.
//!
//! A [`Request`] erases the operation's result type so the balancer and the
//! workers can route it without being generic. The typed half stays with the
//! producer as a [`ReplyHandle`].
//!
//! Every request resolves its reply channel exactly once:
//!
//! - [`Request::run`] sends the operation's value, or
//!   [`Error::WorkerFault`] if the operation panicked.
//! - [`Request::reject`] sends the given error without running anything.
//! - Dropping a request that never ran sends [`Error::ShutdownInProgress`].

use crate::{Error, ReplyHandle, Result};
use core::any::Any;
use std::panic::{self, AssertUnwindSafe};
use tokio::sync::oneshot;

/// How a request finished on its worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Completed,
    Faulted { reason: String },
}

trait Task: Send {
    fn run(self: Box<Self>) -> Outcome;
    fn reject(self: Box<Self>, err: Error);
}

struct Call<F, R> {
    op: Option<F>,
    reply: Option<oneshot::Sender<Result<R>>>,
}

impl<F, R> Call<F, R> {
    fn respond(&mut self, result: Result<R>) {
        if let Some(reply) = self.reply.take() {
            // The producer may have dropped its handle; the result is then
            // discarded.
            let _ = reply.send(result);
        }
    }
}

impl<F, R> Task for Call<F, R>
where
    F: FnOnce() -> R + Send,
    R: Send,
{
    fn run(mut self: Box<Self>) -> Outcome {
        let Some(op) = self.op.take() else {
            return Outcome::Completed;
        };

        match panic::catch_unwind(AssertUnwindSafe(op)) {
            Ok(value) => {
                self.respond(Ok(value));
                Outcome::Completed
            }
            Err(payload) => {
                let reason = panic_reason(payload.as_ref());
                self.respond(Err(Error::WorkerFault {
                    reason: reason.clone(),
                }));
                Outcome::Faulted { reason }
            }
        }
    }

    fn reject(mut self: Box<Self>, err: Error) {
        self.respond(Err(err));
    }
}

impl<F, R> Drop for Call<F, R> {
    fn drop(&mut self) {
        self.respond(Err(Error::ShutdownInProgress));
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "operation panicked".to_string()
    }
}

/// One unit of work: an operation plus its reply destination.
pub(crate) struct Request {
    task: Box<dyn Task>,
}

impl Request {
    /// Wraps `op` into a request and returns the handle that will receive its
    /// result.
    pub(crate) fn new<F, R>(op: F) -> (Self, ReplyHandle<R>)
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let call = Call {
            op: Some(op),
            reply: Some(tx),
        };
        (
            Self {
                task: Box::new(call),
            },
            ReplyHandle::new(rx),
        )
    }

    /// Executes the operation on the current thread and delivers its result.
    ///
    /// A panic inside the operation is caught and reported as
    /// [`Error::WorkerFault`].
    pub(crate) fn run(self) -> Outcome {
        self.task.run()
    }

    /// Resolves the reply handle with `err` without executing the operation.
    pub(crate) fn reject(self, err: Error) {
        self.task.reject(err);
    }
}

impl core::fmt::Debug for Request {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Request").finish_non_exhaustive()
    }
}
