//! Worker Service
//!
//! Business logic for the worker registry.

use chrono::Utc;
use kiln_core::domain::worker::{Worker, WorkerStatus};
use kiln_core::dto::worker::RegisterWorker;
use uuid::Uuid;

use crate::service::queue;
use crate::state::AppState;

/// Service error type
#[derive(Debug)]
pub enum WorkerError {
    NotFound(String),
    /// Bad registration token
    Unauthorized(String),
    /// Disabled by an operator, must stop
    Disabled(String),
    ValidationError(String),
    DatabaseError(sqlx::Error),
}

impl From<sqlx::Error> for WorkerError {
    fn from(err: sqlx::Error) -> Self {
        WorkerError::DatabaseError(err)
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Register a worker with the orchestrator
///
/// Every registration gets a fresh identity, even for a name seen before.
pub async fn register(state: &AppState, req: RegisterWorker) -> Result<Worker> {
    if req.token != state.config.worker_token {
        tracing::warn!("Rejected registration of {}: invalid token", req.name);
        return Err(WorkerError::Unauthorized("Invalid token".to_string()));
    }

    validate_register_request(&req)?;

    let now = Utc::now();
    let ttl_minutes = match req.ttl_minutes {
        0 => state.config.default_worker_ttl_minutes,
        ttl => ttl,
    };

    let worker = Worker {
        id: Uuid::new_v4().to_string(),
        name: req.name,
        hatchery_id: req.hatchery_id,
        model: req.model,
        status: WorkerStatus::Waiting,
        job_id: None,
        booked_job_id: req.booked_job_id,
        ttl_minutes,
        registered_at: now,
        last_beat: now,
    };

    state.workers.insert(&worker).await?;

    tracing::info!("Worker registered: {} ({})", worker.name, worker.id);

    Ok(worker)
}

/// Heartbeat; a disabled worker is told to stop
pub async fn refresh(state: &AppState, worker: &Worker) -> Result<()> {
    if worker.status == WorkerStatus::Disabled {
        return Err(WorkerError::Disabled(worker.name.clone()));
    }

    if !state.workers.touch(&worker.id, Utc::now()).await? {
        return Err(WorkerError::NotFound(worker.id.clone()));
    }

    tracing::debug!("Heartbeat received from worker: {}", worker.name);

    Ok(())
}

/// Unregister a worker at its own request
pub async fn unregister(state: &AppState, worker: &Worker) -> Result<()> {
    remove(state, worker).await?;

    tracing::info!("Worker unregistered: {}", worker.name);

    Ok(())
}

/// Disable a worker; it exits at its next heartbeat
pub async fn disable(state: &AppState, id: &str) -> Result<()> {
    let worker = get_worker(state, id).await?;

    state
        .workers
        .set_status(id, WorkerStatus::Disabled, worker.job_id)
        .await?;

    tracing::info!("Worker disabled: {}", worker.name);

    Ok(())
}

/// Force-unregister a worker, used by hatchery reapers
pub async fn delete(state: &AppState, id: &str) -> Result<()> {
    let worker = get_worker(state, id).await?;

    remove(state, &worker).await?;

    tracing::info!("Worker deleted: {}", worker.name);

    Ok(())
}

/// Get a worker by ID
pub async fn get_worker(state: &AppState, id: &str) -> Result<Worker> {
    state
        .workers
        .find_by_id(id)
        .await?
        .ok_or_else(|| WorkerError::NotFound(id.to_string()))
}

/// List all workers
pub async fn list(state: &AppState) -> Result<Vec<Worker>> {
    let workers = state.workers.list_all().await?;
    Ok(workers)
}

async fn remove(state: &AppState, worker: &Worker) -> Result<()> {
    if !state.workers.delete(&worker.id).await? {
        return Err(WorkerError::NotFound(worker.id.clone()));
    }

    queue::fail_orphaned_job(state, worker).await?;

    Ok(())
}

// =============================================================================
// Validation
// =============================================================================

fn validate_register_request(req: &RegisterWorker) -> Result<()> {
    if req.name.trim().is_empty() {
        return Err(WorkerError::ValidationError(
            "Worker name cannot be empty".to_string(),
        ));
    }

    if req.name.len() > 255 {
        return Err(WorkerError::ValidationError(
            "Worker name is too long (max 255 characters)".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use kiln_cache::LocalStore;
    use std::sync::Arc;

    fn state() -> AppState {
        AppState::in_memory(Arc::new(LocalStore::new()), Config::new("secret"))
    }

    fn request(token: &str) -> RegisterWorker {
        RegisterWorker {
            token: token.to_string(),
            name: "w1".to_string(),
            model: Some(3),
            hatchery_id: Some("h1".to_string()),
            booked_job_id: Some(12),
            ttl_minutes: 0,
        }
    }

    #[tokio::test]
    async fn test_register_assigns_identity() {
        let state = state();
        let first = register(&state, request("secret")).await.unwrap();
        let second = register(&state, request("secret")).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(first.status, WorkerStatus::Waiting);
        assert_eq!(first.booked_job_id, Some(12));
        assert_eq!(first.ttl_minutes, 10);
        assert_eq!(list(&state).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_register_rejects_bad_token() {
        let state = state();
        assert!(matches!(
            register(&state, request("wrong")).await,
            Err(WorkerError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_register_rejects_empty_name() {
        let state = state();
        let mut req = request("secret");
        req.name = " ".to_string();
        assert!(matches!(
            register(&state, req).await,
            Err(WorkerError::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_worker_refresh_refused() {
        let state = state();
        let worker = register(&state, request("secret")).await.unwrap();
        refresh(&state, &worker).await.unwrap();

        disable(&state, &worker.id).await.unwrap();
        let worker = get_worker(&state, &worker.id).await.unwrap();
        assert!(matches!(
            refresh(&state, &worker).await,
            Err(WorkerError::Disabled(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_unknown_worker() {
        let state = state();
        assert!(matches!(
            delete(&state, "nope").await,
            Err(WorkerError::NotFound(_))
        ));
    }
}
