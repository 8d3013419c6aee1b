//! Worker session extractor
//!
//! Worker calls carry `Authorization: Worker <id>`; the extractor resolves
//! it against the registry.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use kiln_core::domain::worker::Worker;
use kiln_core::dto::worker::SESSION_SCHEME;

use crate::api::error::ApiError;
use crate::state::AppState;

/// The registered worker behind a request
#[derive(Debug, Clone)]
pub struct WorkerSession(pub Worker);

impl FromRequestParts<AppState> for WorkerSession {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("Missing worker session".to_string()))?;

        let worker_id = parse_session(header)
            .ok_or_else(|| ApiError::Unauthorized("Malformed worker session".to_string()))?;

        let worker = state
            .workers
            .find_by_id(worker_id)
            .await?
            .ok_or_else(|| ApiError::Unauthorized(format!("Unknown worker {}", worker_id)))?;

        Ok(WorkerSession(worker))
    }
}

fn parse_session(header: &str) -> Option<&str> {
    let (scheme, id) = header.split_once(' ')?;
    let id = id.trim();
    (scheme == SESSION_SCHEME && !id.is_empty()).then_some(id)
}
