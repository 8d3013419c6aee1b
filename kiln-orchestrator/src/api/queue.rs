//! Queue API Handlers
//!
//! HTTP endpoints for the job queue and the booking protocol.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use kiln_core::domain::job::{Job, JobId, JobResult};
use kiln_core::dto::job::{JobInfo, NewJob};
use kiln_core::dto::log::{LogAck, LogBatch};
use kiln_core::dto::queue::{BookForm, QueueFilter, RequirementError, TakeForm};

use crate::api::error::ApiResult;
use crate::api::session::WorkerSession;
use crate::service::{log_service, queue_service};
use crate::state::AppState;

// =============================================================================
// Queue Endpoints
// =============================================================================

/// POST /queue
/// Enqueue a new job
pub async fn enqueue_job(
    State(state): State<AppState>,
    Json(req): Json<NewJob>,
) -> ApiResult<Json<Job>> {
    tracing::info!("Enqueueing job for run: {}", req.run_id);

    let job = queue_service::enqueue(&state, req).await?;

    Ok(Json(job))
}

/// GET /queue
/// List Waiting jobs, oldest first
pub async fn list_queue(
    State(state): State<AppState>,
    Query(filter): Query<QueueFilter>,
) -> ApiResult<Json<Vec<Job>>> {
    tracing::debug!("Listing queue (model: {:?})", filter.model);

    let jobs = queue_service::list_queue(&state, filter).await?;

    Ok(Json(jobs))
}

/// GET /queue/{id}
/// Get job details by ID
pub async fn get_job(State(state): State<AppState>, Path(id): Path<JobId>) -> ApiResult<Json<Job>> {
    tracing::debug!("Getting job: {}", id);

    let job = queue_service::get_job(&state, id).await?;

    Ok(Json(job))
}

// =============================================================================
// Booking Protocol Endpoints
// =============================================================================

/// POST /queue/{id}/take
/// Claim a job for the calling worker
pub async fn take_job(
    State(state): State<AppState>,
    WorkerSession(worker): WorkerSession,
    Path(id): Path<JobId>,
    Json(form): Json<TakeForm>,
) -> ApiResult<Json<JobInfo>> {
    let info = queue_service::take(&state, &worker, id, form).await?;

    Ok(Json(info))
}

/// POST /queue/{id}/book
/// Book a job for a worker about to be spawned
pub async fn book_job(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
    Json(form): Json<BookForm>,
) -> ApiResult<StatusCode> {
    queue_service::book(&state, id, form).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// POST /queue/{id}/result
/// Report the final result of a job
pub async fn submit_result(
    State(state): State<AppState>,
    WorkerSession(worker): WorkerSession,
    Path(id): Path<JobId>,
    Json(result): Json<JobResult>,
) -> ApiResult<StatusCode> {
    queue_service::submit_result(&state, &worker, id, result).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// GET /queue/requirements/errors
/// Latest requirement errors reported by workers
pub async fn list_requirement_errors(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<RequirementError>>> {
    let errors = queue_service::list_requirement_errors(&state).await?;

    Ok(Json(errors))
}

/// POST /queue/requirements/errors
/// Record a requirement the worker could not evaluate
pub async fn requirement_error(
    State(state): State<AppState>,
    WorkerSession(worker): WorkerSession,
    Json(error): Json<RequirementError>,
) -> StatusCode {
    queue_service::report_requirement_error(&state, &worker, error).await;

    StatusCode::ACCEPTED
}

// =============================================================================
// Log Endpoints
// =============================================================================

/// POST /queue/{id}/log
/// Add a batch of log lines to a job
pub async fn add_logs(
    State(state): State<AppState>,
    WorkerSession(worker): WorkerSession,
    Path(id): Path<JobId>,
    Json(batch): Json<LogBatch>,
) -> ApiResult<StatusCode> {
    tracing::debug!("Adding {} log lines for job: {}", batch.lines.len(), id);

    log_service::add_batch(&state, &worker, id, batch).await?;

    Ok(StatusCode::ACCEPTED)
}

/// POST /queue/{id}/log/close
/// Close the log stream of a job
pub async fn close_logs(
    State(state): State<AppState>,
    WorkerSession(worker): WorkerSession,
    Path(id): Path<JobId>,
) -> ApiResult<Json<LogAck>> {
    let ack = log_service::close(&state, &worker, id).await?;

    Ok(Json(ack))
}

// =============================================================================
// Run Endpoints
// =============================================================================

/// POST /run/{id}/cancel
/// Cancel every unfinished job of a run
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
) -> ApiResult<StatusCode> {
    queue_service::cancel_run(&state, run_id).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /run/{id}
/// Purge every job of a run
pub async fn purge_run(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
) -> ApiResult<StatusCode> {
    queue_service::purge_run(&state, run_id).await?;

    Ok(StatusCode::NO_CONTENT)
}
