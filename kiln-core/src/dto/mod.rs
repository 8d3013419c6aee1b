//! Data Transfer Objects for inter-service communication
//!
//! Request and response bodies exchanged between the orchestrator, the
//! workers and the hatcheries over HTTP.

pub mod hatchery;
pub mod job;
pub mod log;
pub mod queue;
pub mod worker;
