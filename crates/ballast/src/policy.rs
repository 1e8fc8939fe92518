use crate::Error;
use core::{fmt, str::FromStr};

/// How the balancer picks a worker for each submission.
///
/// The policy is fixed when the [`Balancer`](crate::Balancer) is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Policy {
    /// Workers are visited in fixed cyclic order, ignoring their load.
    RoundRobin,
    /// The worker with the smallest pending-count receives the request.
    #[default]
    LeastLoaded,
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::RoundRobin => write!(f, "round-robin"),
            Policy::LeastLoaded => write!(f, "least-loaded"),
        }
    }
}

impl FromStr for Policy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "round-robin" | "roundrobin" | "rr" => Ok(Policy::RoundRobin),
            "least-loaded" | "leastloaded" | "ll" => Ok(Policy::LeastLoaded),
            other => Err(Error::InvalidConfig {
                reason: format!("unknown policy `{other}` (expected round-robin or least-loaded)"),
            }),
        }
    }
}

/// What the balancer does when the chosen worker's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaturationPolicy {
    /// Wait for a free slot. This stalls every dispatch and completion until
    /// the worker catches up.
    #[default]
    Block,
    /// Resolve the reply handle with [`Error::QueueSaturated`] immediately.
    Reject,
}

impl fmt::Display for SaturationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaturationPolicy::Block => write!(f, "block"),
            SaturationPolicy::Reject => write!(f, "reject"),
        }
    }
}

impl FromStr for SaturationPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Ok(SaturationPolicy::Block),
            "reject" => Ok(SaturationPolicy::Reject),
            other => Err(Error::InvalidConfig {
                reason: format!("unknown saturation policy `{other}` (expected block or reject)"),
            }),
        }
    }
}
