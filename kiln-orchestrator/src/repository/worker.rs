//! Worker Repository
//!
//! Handles all database operations related to workers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_core::domain::job::JobId;
use kiln_core::domain::worker::{Worker, WorkerStatus};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Persistence operations on workers
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    async fn insert(&self, worker: &Worker) -> Result<(), sqlx::Error>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Worker>, sqlx::Error>;

    /// Records a heartbeat, `false` for an unknown worker
    async fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<bool, sqlx::Error>;

    /// Updates status and current job, `false` for an unknown worker
    async fn set_status(
        &self,
        id: &str,
        status: WorkerStatus,
        job_id: Option<JobId>,
    ) -> Result<bool, sqlx::Error>;

    /// Removes a worker, `false` if it was not registered
    async fn delete(&self, id: &str) -> Result<bool, sqlx::Error>;

    async fn list_all(&self) -> Result<Vec<Worker>, sqlx::Error>;
}

// =============================================================================
// Postgres
// =============================================================================

/// Postgres implementation of [`WorkerRepository`]
pub struct PgWorkerRepository {
    pool: PgPool,
}

impl PgWorkerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkerRepository for PgWorkerRepository {
    async fn insert(&self, worker: &Worker) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO workers (id, name, hatchery_id, model, status, job_id, booked_job_id,
                                 ttl_minutes, registered_at, last_beat)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&worker.id)
        .bind(&worker.name)
        .bind(&worker.hatchery_id)
        .bind(worker.model)
        .bind(worker.status.as_str())
        .bind(worker.job_id)
        .bind(worker.booked_job_id)
        .bind(i32::try_from(worker.ttl_minutes).unwrap_or(i32::MAX))
        .bind(worker.registered_at)
        .bind(worker.last_beat)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Worker>, sqlx::Error> {
        let row = sqlx::query_as::<_, WorkerRow>(
            r#"
            SELECT id, name, hatchery_id, model, status, job_id, booked_job_id,
                   ttl_minutes, registered_at, last_beat
            FROM workers
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE workers SET last_beat = $1 WHERE id = $2")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_status(
        &self,
        id: &str,
        status: WorkerStatus,
        job_id: Option<JobId>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE workers SET status = $1, job_id = $2 WHERE id = $3")
            .bind(status.as_str())
            .bind(job_id)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM workers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_all(&self) -> Result<Vec<Worker>, sqlx::Error> {
        let rows = sqlx::query_as::<_, WorkerRow>(
            r#"
            SELECT id, name, hatchery_id, model, status, job_id, booked_job_id,
                   ttl_minutes, registered_at, last_beat
            FROM workers
            ORDER BY registered_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// In-memory implementation of [`WorkerRepository`]
#[derive(Default)]
pub struct MemoryWorkerRepository {
    workers: Mutex<HashMap<String, Worker>>,
}

impl MemoryWorkerRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Worker>> {
        self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl WorkerRepository for MemoryWorkerRepository {
    async fn insert(&self, worker: &Worker) -> Result<(), sqlx::Error> {
        self.lock().insert(worker.id.clone(), worker.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Worker>, sqlx::Error> {
        Ok(self.lock().get(id).cloned())
    }

    async fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<bool, sqlx::Error> {
        Ok(self
            .lock()
            .get_mut(id)
            .map(|worker| worker.last_beat = now)
            .is_some())
    }

    async fn set_status(
        &self,
        id: &str,
        status: WorkerStatus,
        job_id: Option<JobId>,
    ) -> Result<bool, sqlx::Error> {
        Ok(self
            .lock()
            .get_mut(id)
            .map(|worker| {
                worker.status = status;
                worker.job_id = job_id;
            })
            .is_some())
    }

    async fn delete(&self, id: &str) -> Result<bool, sqlx::Error> {
        Ok(self.lock().remove(id).is_some())
    }

    async fn list_all(&self) -> Result<Vec<Worker>, sqlx::Error> {
        let mut workers: Vec<Worker> = self.lock().values().cloned().collect();
        workers.sort_by_key(|worker| worker.registered_at);
        Ok(workers)
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct WorkerRow {
    id: String,
    name: String,
    hatchery_id: Option<String>,
    model: Option<i64>,
    status: String,
    job_id: Option<JobId>,
    booked_job_id: Option<JobId>,
    ttl_minutes: i32,
    registered_at: DateTime<Utc>,
    last_beat: DateTime<Utc>,
}

impl From<WorkerRow> for Worker {
    fn from(row: WorkerRow) -> Self {
        Worker {
            id: row.id,
            name: row.name,
            hatchery_id: row.hatchery_id,
            model: row.model,
            // Unknown statuses keep the worker away from the queue
            status: row.status.parse().unwrap_or(WorkerStatus::Disabled),
            job_id: row.job_id,
            booked_job_id: row.booked_job_id,
            ttl_minutes: u32::try_from(row.ttl_minutes).unwrap_or(0),
            registered_at: row.registered_at,
            last_beat: row.last_beat,
        }
    }
}
