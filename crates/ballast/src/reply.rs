use crate::{Error, Result};
use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::oneshot;

/// Receives the single result of a submitted operation.
///
/// `ReplyHandle` is a [`Future`]; `.await` it from async code or call
/// [`blocking_recv`](Self::blocking_recv) from a plain thread. Dropping it is
/// allowed: the operation still runs, its worker still reports completion,
/// and the value is discarded.
#[derive(Debug)]
#[must_use = "a reply handle does nothing unless awaited or received"]
pub struct ReplyHandle<R> {
    rx: oneshot::Receiver<Result<R>>,
}

impl<R> ReplyHandle<R> {
    pub(crate) const fn new(rx: oneshot::Receiver<Result<R>>) -> Self {
        Self { rx }
    }

    /// Blocks the current thread until the result arrives.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn blocking_recv(self) -> Result<R> {
        self.rx.blocking_recv().unwrap_or_else(|_| Err(closed()))
    }
}

impl<R> Future for ReplyHandle<R> {
    type Output = Result<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or_else(|_| Err(closed())))
    }
}

fn closed() -> Error {
    Error::ChannelError {
        context: "reply channel closed without a result".to_string(),
    }
}
