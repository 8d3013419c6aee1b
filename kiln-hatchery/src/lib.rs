//! Kiln Hatchery
//!
//! Watches the job queue and spawns single-use workers, each booked for the
//! job it was started for. Dead and orphaned workers are reaped.

pub mod autoscaler;
pub mod config;
pub mod planner;
pub mod provisioner;
pub mod shutdown;

pub use autoscaler::Autoscaler;
pub use config::{Args, Config};
