use crate::telemetry::{
    increment_requests_completed, increment_requests_failed, increment_requests_submitted,
    record_request_latency,
};
use ballast::{Balancer, Error};
use core::time::Duration;
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Simulated request body: blocks for `work`, then returns a random number of
/// nanoseconds below one second.
pub fn simulated_work(work: Duration) -> u64 {
    std::thread::sleep(work);
    rand::rng().random_range(0..1_000_000_000)
}

/// Label used for the `requests_failed` metric.
fn failure_reason(err: &Error) -> &'static str {
    match err {
        Error::QueueSaturated { .. } => "queue_saturated",
        Error::WorkerFault { .. } => "worker_fault",
        Error::ShutdownInProgress => "shutdown",
        Error::InvalidConfig { .. } => "invalid_config",
        Error::ChannelError { .. } => "channel",
    }
}

/// Submits one request every `pacing` until cancelled or the balancer stops
/// accepting work.
///
/// Each requester waits for its own reply before pacing again, so at most
/// one of its requests is in flight.
pub async fn requester_loop(
    id: usize,
    balancer: Balancer,
    pacing: Duration,
    work: Duration,
    cancel: CancellationToken,
) {
    tracing::trace!("Requester {id} started");

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(pacing) => {}
        }

        let started = Instant::now();
        let handle = match balancer.submit(move || simulated_work(work)).await {
            Ok(handle) => handle,
            Err(Error::ShutdownInProgress) => break,
            Err(e) => {
                increment_requests_failed(failure_reason(&e));
                tracing::warn!("Requester {id} failed to submit: {e}");
                continue;
            }
        };
        increment_requests_submitted();

        match handle.await {
            Ok(nanos) => {
                let elapsed = started.elapsed();
                increment_requests_completed();
                record_request_latency(elapsed.as_secs_f64() * 1000.0);
                tracing::debug!("Requester {id} got {nanos} in {elapsed:?}");
            }
            Err(Error::ShutdownInProgress) => {
                increment_requests_failed(failure_reason(&Error::ShutdownInProgress));
                break;
            }
            Err(e) => {
                increment_requests_failed(failure_reason(&e));
                tracing::warn!("Requester {id} request failed: {e}");
            }
        }
    }

    tracing::trace!("Requester {id} stopped");
}
