//! Repository Module
//!
//! Data access layer for the orchestrator.
//! Each repository is a trait with a Postgres implementation and an
//! in-memory one for single-instance deployments and tests.

pub mod job;
pub mod log;
pub mod worker;

// Re-export for convenience
pub use job as job_repository;
pub use log as log_repository;
pub use worker as worker_repository;

pub use job::{JobRepository, MemoryJobRepository, PgJobRepository};
pub use log::{LogRepository, MemoryLogRepository, PgLogRepository};
pub use worker::{MemoryWorkerRepository, PgWorkerRepository, WorkerRepository};
