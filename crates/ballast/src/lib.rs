#![doc = include_str!("../README.md")]

mod balancer;
mod config;
mod error;
mod policy;
mod pool;
mod reply;
mod request;
mod stats;
mod worker;

pub use crate::balancer::*;
pub use crate::config::*;
pub use crate::error::*;
pub use crate::policy::*;
pub use crate::reply::*;
pub use crate::stats::{Snapshot, WorkerLoad};
pub use crate::worker::WorkerId;
