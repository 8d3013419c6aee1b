//! Log Service
//!
//! Business logic for job log intake.

use kiln_core::domain::job::JobId;
use kiln_core::domain::log::LogLine;
use kiln_core::domain::worker::Worker;
use kiln_core::dto::log::{LogAck, LogBatch, MAX_BATCH_SIZE, MAX_MESSAGE_LENGTH};

use crate::state::AppState;

/// Service error type
#[derive(Debug)]
pub enum LogError {
    JobNotFound(JobId),
    /// The sender does not hold the job
    NotHolder(JobId),
    ValidationError(String),
    DatabaseError(sqlx::Error),
}

impl From<sqlx::Error> for LogError {
    fn from(err: sqlx::Error) -> Self {
        LogError::DatabaseError(err)
    }
}

pub type Result<T> = std::result::Result<T, LogError>;

/// Add a batch of log lines streamed by the worker building the job
pub async fn add_batch(
    state: &AppState,
    worker: &Worker,
    job_id: JobId,
    batch: LogBatch,
) -> Result<()> {
    if batch.job_id != job_id {
        return Err(LogError::ValidationError(format!(
            "Batch for job {} sent to job {}",
            batch.job_id, job_id
        )));
    }

    validate_log_lines(&batch.lines)?;

    ensure_holder(state, worker, job_id).await?;

    if batch.lines.is_empty() {
        return Ok(());
    }

    let count = batch.lines.len();
    state.logs.add_lines(job_id, batch.lines).await?;

    tracing::debug!("Added {} log lines for job: {}", count, job_id);

    Ok(())
}

/// Close a job's log stream and acknowledge what was received
pub async fn close(state: &AppState, worker: &Worker, job_id: JobId) -> Result<LogAck> {
    ensure_holder(state, worker, job_id).await?;

    let received = state.logs.count_by_job(job_id).await?;

    tracing::debug!("Log stream of job {} closed ({} lines)", job_id, received);

    Ok(LogAck { job_id, received })
}

async fn ensure_holder(state: &AppState, worker: &Worker, job_id: JobId) -> Result<()> {
    let job = state
        .jobs
        .find_by_id(job_id)
        .await?
        .ok_or(LogError::JobNotFound(job_id))?;

    if job.worker_id.as_deref() != Some(worker.id.as_str()) {
        return Err(LogError::NotHolder(job_id));
    }

    Ok(())
}

// =============================================================================
// Validation
// =============================================================================

fn validate_log_lines(lines: &[LogLine]) -> Result<()> {
    if lines.len() > MAX_BATCH_SIZE {
        return Err(LogError::ValidationError(format!(
            "Too many log lines in batch (max: {})",
            MAX_BATCH_SIZE
        )));
    }

    for (i, line) in lines.iter().enumerate() {
        if line.message.chars().count() > MAX_MESSAGE_LENGTH {
            return Err(LogError::ValidationError(format!(
                "Log line {} message too long (max: {} chars)",
                i, MAX_MESSAGE_LENGTH
            )));
        }
    }

    Ok(())
}
