//! Queue Service
//!
//! Job queue and booking protocol: enqueue, listing, claim (take), booking,
//! result intake, run cancellation.

use chrono::{Duration, Utc};
use kiln_cache::{Store, StoreError, StoreExt};
use kiln_core::domain::job::{Booking, Job, JobId, JobResult, JobStatus};
use kiln_core::domain::worker::{Worker, WorkerStatus};
use kiln_core::dto::job::{JobInfo, NewJob};
use kiln_core::dto::queue::{
    BookForm, QueueEntry, QueueEvent, QueueFilter, RequirementError, TakeForm, keys,
};

use crate::repository::job::{BookOutcome, ClaimOutcome, CompleteOutcome};
use crate::state::AppState;

/// Service error type
#[derive(Debug)]
pub enum QueueError {
    NotFound(JobId),
    /// Lost the race, booked for another worker, or not Waiting anymore
    AlreadyClaimed(JobId),
    /// Another worker holds the job
    NotHolder(JobId),
    Gone(JobId),
    Forbidden(String),
    ValidationError(String),
    DatabaseError(sqlx::Error),
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        QueueError::DatabaseError(err)
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

// =============================================================================
// Enqueue & Listing
// =============================================================================

/// Create a Waiting job and notify the queue
pub async fn enqueue(state: &AppState, req: NewJob) -> Result<Job> {
    validate_new_job(&req)?;

    let job = state.jobs.create(req).await?;

    state
        .store
        .enqueue(
            keys::JOBS,
            &QueueEntry {
                job_id: job.id,
                queued_at: job.queued_at,
            },
        )
        .await;
    invalidate_listing(state.store.as_ref()).await;

    tracing::info!("Job {} queued for run {}", job.id, job.run_id);

    Ok(job)
}

/// Get a job by ID
pub async fn get_job(state: &AppState, id: JobId) -> Result<Job> {
    state
        .jobs
        .find_by_id(id)
        .await?
        .ok_or(QueueError::NotFound(id))
}

/// List Waiting jobs, oldest first
///
/// Served from a short-lived snapshot in the store; every state change
/// drops the snapshots.
pub async fn list_queue(state: &AppState, filter: QueueFilter) -> Result<Vec<Job>> {
    let key = keys::listing(filter.model);

    if let Some(jobs) = state.store.get::<Vec<Job>>(&key).await {
        return Ok(jobs);
    }

    let jobs = state.jobs.list_waiting(filter.model).await?;
    state
        .store
        .set(&key, &jobs, Some(state.config.listing_ttl))
        .await;

    Ok(jobs)
}

/// Drop every cached queue listing
pub async fn invalidate_listing(store: &dyn Store) {
    let pattern = format!("{}*", keys::LISTING);
    if let Err(e) = store.delete_all(&pattern).await {
        tracing::warn!("Cannot invalidate queue listing: {}", e);
    }
}

// =============================================================================
// Claim & Booking
// =============================================================================

/// Take a job: the atomic Waiting → Building transition for this worker
pub async fn take(state: &AppState, worker: &Worker, id: JobId, form: TakeForm) -> Result<JobInfo> {
    if worker.status == WorkerStatus::Disabled {
        return Err(QueueError::Forbidden(format!(
            "Worker {} is disabled",
            worker.name
        )));
    }

    let job = match state
        .jobs
        .claim(id, &worker.id, &worker.name, Utc::now())
        .await?
    {
        ClaimOutcome::Claimed(job) => job,
        ClaimOutcome::AlreadyClaimed => {
            tracing::debug!("Worker {} lost job {}", worker.name, id);
            return Err(QueueError::AlreadyClaimed(id));
        }
        ClaimOutcome::NotFound => return Err(QueueError::NotFound(id)),
        ClaimOutcome::Gone => return Err(QueueError::Gone(id)),
    };

    state
        .workers
        .set_status(&worker.id, WorkerStatus::Building, Some(id))
        .await?;
    invalidate_listing(state.store.as_ref()).await;
    state
        .store
        .publish(
            keys::EVENTS,
            &QueueEvent::Claimed {
                job_id: id,
                worker_id: worker.id.clone(),
            },
        )
        .await;

    if form.booked_job_id == Some(id) {
        tracing::info!("Worker {} took its booked job {}", worker.name, id);
    } else {
        tracing::info!("Worker {} took job {}", worker.name, id);
    }

    let secrets = state.jobs.secrets(id).await?;

    Ok(JobInfo {
        job,
        worker_id: worker.id.clone(),
        secrets,
    })
}

/// Bookings never hold a job longer than a day
const MAX_BOOKING_TTL_SECS: u64 = 86_400;

/// Book a Waiting job for a worker a hatchery is about to spawn
pub async fn book(state: &AppState, id: JobId, form: BookForm) -> Result<()> {
    if form.worker_name.trim().is_empty() {
        return Err(QueueError::ValidationError(
            "Worker name cannot be empty".to_string(),
        ));
    }

    let now = Utc::now();
    let ttl = form.ttl_secs.min(MAX_BOOKING_TTL_SECS) as i64;
    let booking = Booking {
        worker_name: form.worker_name,
        hatchery_id: form.hatchery_id,
        until: now + Duration::seconds(ttl),
    };

    match state.jobs.book(id, &booking, now).await? {
        BookOutcome::Booked => {
            invalidate_listing(state.store.as_ref()).await;
            tracing::info!(
                "Job {} booked by hatchery {} for worker {}",
                id,
                booking.hatchery_id,
                booking.worker_name
            );
            Ok(())
        }
        BookOutcome::Conflict => Err(QueueError::AlreadyClaimed(id)),
        BookOutcome::NotFound => Err(QueueError::NotFound(id)),
        BookOutcome::Gone => Err(QueueError::Gone(id)),
    }
}

// =============================================================================
// Results & Diagnostics
// =============================================================================

/// Record the result of a job reported by the worker holding it
///
/// Reporting again once the job is final is accepted and changes nothing,
/// so a worker retrying after a lost answer does not fail.
pub async fn submit_result(
    state: &AppState,
    worker: &Worker,
    id: JobId,
    result: JobResult,
) -> Result<()> {
    validate_result(&result)?;

    match state.jobs.complete(id, &worker.id, &result, Utc::now()).await? {
        CompleteOutcome::Completed(job) => {
            state
                .workers
                .set_status(&worker.id, WorkerStatus::Waiting, None)
                .await?;
            state
                .store
                .publish(
                    keys::EVENTS,
                    &QueueEvent::Done {
                        job_id: id,
                        status: job.status,
                    },
                )
                .await;
            tracing::info!(
                "Job {} done with status {} ({} ms)",
                id,
                job.status,
                result.duration_ms
            );
            Ok(())
        }
        CompleteOutcome::AlreadyDone(status) if status.is_final() => {
            tracing::warn!("Ignoring result for job {} already {}", id, status);
            if worker.status == WorkerStatus::Building && worker.job_id == Some(id) {
                state
                    .workers
                    .set_status(&worker.id, WorkerStatus::Waiting, None)
                    .await?;
            }
            Ok(())
        }
        CompleteOutcome::AlreadyDone(_) | CompleteOutcome::NotHolder => {
            Err(QueueError::NotHolder(id))
        }
        CompleteOutcome::NotFound => Err(QueueError::NotFound(id)),
    }
}

/// Fail the job a vanished worker was building
pub async fn fail_orphaned_job(state: &AppState, worker: &Worker) -> std::result::Result<(), sqlx::Error> {
    let Some(job_id) = worker.job_id else {
        return Ok(());
    };

    let result = JobResult::failed(format!(
        "Worker {} unregistered while building",
        worker.name
    ));
    if let CompleteOutcome::Completed(_) = state
        .jobs
        .complete(job_id, &worker.id, &result, Utc::now())
        .await?
    {
        tracing::warn!("Job {} failed: worker {} is gone", job_id, worker.name);
        state
            .store
            .publish(
                keys::EVENTS,
                &QueueEvent::Done {
                    job_id,
                    status: JobStatus::Fail,
                },
            )
            .await;
    }

    Ok(())
}

/// Keep the latest error per requirement for operators
pub async fn report_requirement_error(state: &AppState, worker: &Worker, error: RequirementError) {
    tracing::warn!(
        "Worker {} cannot check requirement {} ({}={}): {}",
        worker.name,
        error.name,
        error.kind,
        error.value,
        error.error
    );

    let member_key = format!("{}:{}", error.kind, error.name);
    state
        .store
        .set_add(keys::REQUIREMENT_ERRORS, &member_key, &error)
        .await;
}

/// Latest requirement errors, one per requirement
pub async fn list_requirement_errors(
    state: &AppState,
) -> std::result::Result<Vec<RequirementError>, StoreError> {
    let count = state.store.set_card(keys::REQUIREMENT_ERRORS).await?;
    state.store.set_scan(keys::REQUIREMENT_ERRORS, count).await
}

// =============================================================================
// Runs
// =============================================================================

/// Cancel every unfinished job of a run; later claims see Gone
pub async fn cancel_run(state: &AppState, run_id: i64) -> Result<Vec<JobId>> {
    let cancelled = state.jobs.cancel_run(run_id, Utc::now()).await?;

    invalidate_listing(state.store.as_ref()).await;
    state
        .store
        .publish(keys::EVENTS, &QueueEvent::RunCancelled { run_id })
        .await;

    tracing::info!("Run {} cancelled ({} jobs)", run_id, cancelled.len());

    Ok(cancelled)
}

/// Delete every job of a run and their logs
pub async fn purge_run(state: &AppState, run_id: i64) -> Result<Vec<JobId>> {
    let purged = state.jobs.purge_run(run_id).await?;

    for job_id in &purged {
        state.logs.delete_by_job(*job_id).await?;
    }
    invalidate_listing(state.store.as_ref()).await;

    tracing::info!("Run {} purged ({} jobs)", run_id, purged.len());

    Ok(purged)
}

// =============================================================================
// Validation
// =============================================================================

fn validate_new_job(req: &NewJob) -> Result<()> {
    if req.action.name.trim().is_empty() {
        return Err(QueueError::ValidationError(
            "Action name cannot be empty".to_string(),
        ));
    }

    if let Some(step) = req.action.steps.iter().find(|s| s.script.trim().is_empty()) {
        return Err(QueueError::ValidationError(format!(
            "Step '{}' has an empty script",
            step.name
        )));
    }

    Ok(())
}

fn validate_result(result: &JobResult) -> Result<()> {
    match result.status {
        JobStatus::Success | JobStatus::Fail => Ok(()),
        status => Err(QueueError::ValidationError(format!(
            "Invalid result status: {}",
            status
        ))),
    }
}
