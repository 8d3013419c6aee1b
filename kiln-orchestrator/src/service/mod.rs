//! Service Module
//!
//! Business logic layer for the orchestrator.
//! Services orchestrate between repositories and the store and contain domain logic.

pub mod dispatcher;
pub mod hatchery;
pub mod log;
pub mod queue;
pub mod worker;

// Re-export for convenience
pub use hatchery as hatchery_service;
pub use log as log_service;
pub use queue as queue_service;
pub use worker as worker_service;
