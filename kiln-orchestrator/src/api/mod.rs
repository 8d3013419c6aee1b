//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod health;
pub mod queue;
pub mod session;
pub mod worker;

use axum::{
    Router,
    routing::{delete, get, post},
};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Queue endpoints
        .route("/queue", post(queue::enqueue_job).get(queue::list_queue))
        .route(
            "/queue/requirements/errors",
            post(queue::requirement_error).get(queue::list_requirement_errors),
        )
        .route("/queue/{id}", get(queue::get_job))
        .route("/queue/{id}/take", post(queue::take_job))
        .route("/queue/{id}/book", post(queue::book_job))
        .route("/queue/{id}/result", post(queue::submit_result))
        .route("/queue/{id}/log", post(queue::add_logs))
        .route("/queue/{id}/log/close", post(queue::close_logs))
        // Run endpoints
        .route("/run/{id}/cancel", post(queue::cancel_run))
        .route("/run/{id}", delete(queue::purge_run))
        // Worker endpoints
        .route("/worker", get(worker::list_workers))
        .route("/worker/register", post(worker::register_worker))
        .route("/worker/refresh", post(worker::refresh))
        .route("/worker/unregister", post(worker::unregister))
        .route("/worker/{id}/disable", post(worker::disable_worker))
        .route("/worker/{id}", delete(worker::delete_worker))
        // Hatchery endpoints
        .route("/hatchery", get(worker::list_hatcheries))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
