use anyhow::bail;
use ballast::{BalancerConfig, Policy, SaturationPolicy};
use clap::Parser;
use core::time::Duration;

/// Runtime configuration for the `ballast-sim` binary.
///
/// A fixed set of requesters submits simulated work to a balancer at a
/// steady pace. All values are parsed from CLI arguments or environment
/// variables; the defaults reproduce the classic 100 requesters over 10
/// workers setup.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "ballast-sim",
    version,
    about = "Drives a ballast balancer with paced simulated requests"
)]
pub struct CliArgs {
    /// Number of requester tasks submitting work concurrently.
    ///
    /// Environment variable: `NUM_REQUESTERS`
    #[arg(long, env = "NUM_REQUESTERS", default_value_t = 100)]
    pub requesters: usize,

    /// Number of workers in the pool.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = 10)]
    pub workers: usize,

    /// Capacity of each worker's request queue.
    ///
    /// Environment variable: `QUEUE_CAPACITY`
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = 100)]
    pub queue_capacity: usize,

    /// Capacity of the channel between requesters and the balancer.
    ///
    /// Environment variable: `SUBMISSION_CAPACITY`
    #[arg(long, env = "SUBMISSION_CAPACITY", default_value_t = 64)]
    pub submission_capacity: usize,

    /// Worker selection policy: `round-robin` (`rr`) or `least-loaded` (`ll`).
    ///
    /// Environment variable: `POLICY`
    #[arg(long, env = "POLICY", default_value_t = Policy::LeastLoaded)]
    pub policy: Policy,

    /// What to do when the chosen worker's queue is full: `block` or `reject`.
    ///
    /// Environment variable: `SATURATION`
    #[arg(long, env = "SATURATION", default_value_t = SaturationPolicy::Block)]
    pub saturation: SaturationPolicy,

    /// Pause in milliseconds before each request a requester sends.
    ///
    /// Environment variable: `PACING_MS`
    #[arg(long, env = "PACING_MS", default_value_t = 2000)]
    pub pacing_ms: u64,

    /// Simulated processing time in milliseconds of every request.
    ///
    /// Environment variable: `WORK_MS`
    #[arg(long, env = "WORK_MS", default_value_t = 1000)]
    pub work_ms: u64,

    /// Interval in milliseconds between pool load reports.
    ///
    /// Environment variable: `REPORT_INTERVAL_MS`
    #[arg(long, env = "REPORT_INTERVAL_MS", default_value_t = 5000)]
    pub report_interval_ms: u64,

    /// How long shutdown waits for workers to drain, in milliseconds.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_MS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_MS", default_value_t = 3000)]
    pub shutdown_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub requesters: usize,
    pub pacing: Duration,
    pub work: Duration,
    pub report_interval: Duration,
    pub balancer: BalancerConfig,
}

impl TryFrom<CliArgs> for SimConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.requesters == 0 {
            bail!("NUM_REQUESTERS must be greater than 0");
        }

        if args.report_interval_ms == 0 {
            bail!("REPORT_INTERVAL_MS must be greater than 0");
        }

        let balancer = BalancerConfig::new(args.workers, args.queue_capacity, args.policy)
            .with_submission_capacity(args.submission_capacity)
            .with_saturation(args.saturation)
            .with_shutdown_timeout(Duration::from_millis(args.shutdown_timeout_ms));
        balancer.validate()?;

        Ok(Self {
            requesters: args.requesters,
            pacing: Duration::from_millis(args.pacing_ms),
            work: Duration::from_millis(args.work_ms),
            report_interval: Duration::from_millis(args.report_interval_ms),
            balancer,
        })
    }
}
