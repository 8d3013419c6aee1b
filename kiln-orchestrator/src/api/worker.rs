//! Worker API Handlers
//!
//! HTTP endpoints for worker registration, heartbeats and administration.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use kiln_core::domain::hatchery::HatcheryStatus;
use kiln_core::domain::worker::Worker;
use kiln_core::dto::worker::RegisterWorker;

use crate::api::error::ApiResult;
use crate::api::session::WorkerSession;
use crate::service::{hatchery_service, worker_service};
use crate::state::AppState;

// =============================================================================
// Worker Registration & Lifecycle
// =============================================================================

/// POST /worker/register
/// Register a worker with the orchestrator
pub async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<RegisterWorker>,
) -> ApiResult<Json<Worker>> {
    tracing::info!("Registering worker: {}", req.name);

    let worker = worker_service::register(&state, req).await?;

    Ok(Json(worker))
}

/// POST /worker/refresh
/// Heartbeat of the calling worker
pub async fn refresh(
    State(state): State<AppState>,
    WorkerSession(worker): WorkerSession,
) -> ApiResult<StatusCode> {
    worker_service::refresh(&state, &worker).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// POST /worker/unregister
/// Unregister the calling worker
pub async fn unregister(
    State(state): State<AppState>,
    WorkerSession(worker): WorkerSession,
) -> ApiResult<StatusCode> {
    worker_service::unregister(&state, &worker).await?;

    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Worker Administration
// =============================================================================

/// GET /worker
/// List all registered workers
pub async fn list_workers(State(state): State<AppState>) -> ApiResult<Json<Vec<Worker>>> {
    tracing::debug!("Listing all workers");

    let workers = worker_service::list(&state).await?;

    Ok(Json(workers))
}

/// POST /worker/{id}/disable
/// Disable a worker
pub async fn disable_worker(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    worker_service::disable(&state, &id).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /worker/{id}
/// Force-unregister a worker
pub async fn delete_worker(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    tracing::info!("Deleting worker: {}", id);

    worker_service::delete(&state, &id).await?;

    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Hatcheries
// =============================================================================

/// GET /hatchery
/// List hatcheries with their liveness
pub async fn list_hatcheries(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<HatcheryStatus>>> {
    let hatcheries = hatchery_service::list(&state).await?;

    Ok(Json(hatcheries))
}
