//! Health Check API Handler
//!
//! Health check endpoint for monitoring, reporting the store backend too.

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};

use crate::state::AppState;

/// GET /health
/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.store.status().await;

    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "OK", "store": store })),
    )
}
