//! Log Repository
//!
//! Handles all database operations related to job logs.

use async_trait::async_trait;
use kiln_core::domain::job::JobId;
use kiln_core::domain::log::{LogLevel, LogLine};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Persistence operations on job logs
#[async_trait]
pub trait LogRepository: Send + Sync {
    /// Appends lines to a job's log
    async fn add_lines(&self, job_id: JobId, lines: Vec<LogLine>) -> Result<(), sqlx::Error>;

    /// All lines of a job, in arrival order
    async fn find_by_job(&self, job_id: JobId) -> Result<Vec<LogLine>, sqlx::Error>;

    async fn count_by_job(&self, job_id: JobId) -> Result<u64, sqlx::Error>;

    async fn delete_by_job(&self, job_id: JobId) -> Result<u64, sqlx::Error>;
}

// =============================================================================
// Postgres
// =============================================================================

/// Postgres implementation of [`LogRepository`]
pub struct PgLogRepository {
    pool: PgPool,
}

impl PgLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LogRepository for PgLogRepository {
    async fn add_lines(&self, job_id: JobId, lines: Vec<LogLine>) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for line in lines {
            sqlx::query(
                r#"
                INSERT INTO job_logs (job_id, step, timestamp, level, message)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(job_id)
            .bind(i32::try_from(line.step).unwrap_or(i32::MAX))
            .bind(line.timestamp)
            .bind(line.level.as_str())
            .bind(&line.message)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn find_by_job(&self, job_id: JobId) -> Result<Vec<LogLine>, sqlx::Error> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT step, timestamp, level, message
            FROM job_logs
            WHERE job_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn count_by_job(&self, job_id: JobId) -> Result<u64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM job_logs WHERE job_id = $1")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(u64::try_from(row.0).unwrap_or(0))
    }

    async fn delete_by_job(&self, job_id: JobId) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM job_logs WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// In-memory implementation of [`LogRepository`]
#[derive(Default)]
pub struct MemoryLogRepository {
    lines: Mutex<HashMap<JobId, Vec<LogLine>>>,
}

impl MemoryLogRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, Vec<LogLine>>> {
        self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl LogRepository for MemoryLogRepository {
    async fn add_lines(&self, job_id: JobId, lines: Vec<LogLine>) -> Result<(), sqlx::Error> {
        self.lock().entry(job_id).or_default().extend(lines);
        Ok(())
    }

    async fn find_by_job(&self, job_id: JobId) -> Result<Vec<LogLine>, sqlx::Error> {
        Ok(self.lock().get(&job_id).cloned().unwrap_or_default())
    }

    async fn count_by_job(&self, job_id: JobId) -> Result<u64, sqlx::Error> {
        Ok(self.lock().get(&job_id).map_or(0, |lines| lines.len() as u64))
    }

    async fn delete_by_job(&self, job_id: JobId) -> Result<u64, sqlx::Error> {
        Ok(self
            .lock()
            .remove(&job_id)
            .map_or(0, |lines| lines.len() as u64))
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct LogRow {
    step: i32,
    timestamp: chrono::DateTime<chrono::Utc>,
    level: String,
    message: String,
}

impl From<LogRow> for LogLine {
    fn from(row: LogRow) -> Self {
        LogLine {
            step: usize::try_from(row.step).unwrap_or(0),
            timestamp: row.timestamp,
            level: row.level.parse().unwrap_or(LogLevel::Info),
            message: row.message,
        }
    }
}
