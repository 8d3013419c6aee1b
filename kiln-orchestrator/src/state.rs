//! Shared application state

use kiln_cache::Store;
use sqlx::PgPool;
use std::sync::Arc;

use crate::config::Config;
use crate::repository::{
    JobRepository, LogRepository, MemoryJobRepository, MemoryLogRepository,
    MemoryWorkerRepository, PgJobRepository, PgLogRepository, PgWorkerRepository,
    WorkerRepository,
};

/// State handed to every handler and background loop
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<dyn JobRepository>,
    pub workers: Arc<dyn WorkerRepository>,
    pub logs: Arc<dyn LogRepository>,
    pub store: Arc<dyn Store>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        workers: Arc<dyn WorkerRepository>,
        logs: Arc<dyn LogRepository>,
        store: Arc<dyn Store>,
        config: Config,
    ) -> Self {
        Self {
            jobs,
            workers,
            logs,
            store,
            config: Arc::new(config),
        }
    }

    /// State backed by Postgres repositories
    pub fn postgres(pool: PgPool, store: Arc<dyn Store>, config: Config) -> Self {
        Self::new(
            Arc::new(PgJobRepository::new(pool.clone())),
            Arc::new(PgWorkerRepository::new(pool.clone())),
            Arc::new(PgLogRepository::new(pool)),
            store,
            config,
        )
    }

    /// State backed by in-memory repositories
    pub fn in_memory(store: Arc<dyn Store>, config: Config) -> Self {
        Self::new(
            Arc::new(MemoryJobRepository::new()),
            Arc::new(MemoryWorkerRepository::new()),
            Arc::new(MemoryLogRepository::new()),
            store,
            config,
        )
    }
}
