#![doc = include_str!("../README.md")]

mod config;
mod requester;
mod telemetry;

use ballast::Balancer;
use clap::Parser;
use config::{CliArgs, SimConfig};
use core::time::Duration;
use requester::requester_loop;
use telemetry::init_telemetry;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = SimConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    let balancer = Balancer::new(config.balancer.clone())?;
    let cancel = CancellationToken::new();

    let mut requesters = JoinSet::new();
    for id in 0..config.requesters {
        requesters.spawn(requester_loop(
            id,
            balancer.clone(),
            config.pacing,
            config.work,
            cancel.clone(),
        ));
    }
    let reporter = tokio::spawn(report_loop(
        balancer.clone(),
        config.report_interval,
        cancel.clone(),
    ));

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, terminating gracefully...");

    // Stop pacing new requests, then let the balancer finish what it holds.
    cancel.cancel();
    if let Err(e) = balancer.shutdown().await {
        tracing::error!("Error during balancer shutdown: {e}");
    }

    while let Some(res) = requesters.join_next().await {
        if let Err(e) = res {
            tracing::error!("Requester task failed: {e}");
        }
    }
    if let Err(e) = reporter.await {
        tracing::error!("Reporter task failed: {e}");
    }

    tracing::info!("Simulation shut down successfully");
    providers.shutdown();
    Ok(())
}

fn log_startup_info(config: &SimConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting simulation with full config: {config:#?}");
    } else {
        tracing::info!(
            "Starting simulation: {} requesters over {} {} workers",
            config.requesters,
            config.balancer.workers,
            config.balancer.policy
        );
    }
}

/// Logs pool statistics every `interval` until cancelled.
async fn report_loop(balancer: Balancer, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match balancer.snapshot().await {
            Ok(snapshot) => {
                let loads: Vec<_> = snapshot.workers.iter().map(|load| load.pending).collect();
                tracing::info!(
                    dispatched = snapshot.dispatched,
                    completed = snapshot.completed,
                    rejected = snapshot.rejected,
                    "Pool {loads:?} avg {:.2} variance {:.2}",
                    snapshot.mean,
                    snapshot.variance
                );
            }
            Err(_) => break,
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }
}
