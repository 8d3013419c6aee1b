//! API Error Handling
//!
//! Unified error types and conversion for API responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::service::{log_service, queue_service, worker_service};

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Conflict(String),
    Gone(String),
    DatabaseError(sqlx::Error),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Gone(msg) => (StatusCode::GONE, msg),
            ApiError::DatabaseError(err) => {
                tracing::error!("Database error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::DatabaseError(err)
    }
}

impl From<kiln_cache::StoreError> for ApiError {
    fn from(err: kiln_cache::StoreError) -> Self {
        ApiError::InternalError(err.to_string())
    }
}

impl From<queue_service::QueueError> for ApiError {
    fn from(err: queue_service::QueueError) -> Self {
        use queue_service::QueueError;
        match err {
            QueueError::NotFound(id) => ApiError::NotFound(format!("Job {} not found", id)),
            QueueError::AlreadyClaimed(id) => {
                ApiError::Conflict(format!("Job {} is not available", id))
            }
            QueueError::NotHolder(id) => {
                ApiError::Conflict(format!("Job {} is held by another worker", id))
            }
            QueueError::Gone(id) => ApiError::Gone(format!("Job {} was cancelled", id)),
            QueueError::Forbidden(msg) => ApiError::Forbidden(msg),
            QueueError::ValidationError(msg) => ApiError::BadRequest(msg),
            QueueError::DatabaseError(err) => ApiError::DatabaseError(err),
        }
    }
}

impl From<worker_service::WorkerError> for ApiError {
    fn from(err: worker_service::WorkerError) -> Self {
        use worker_service::WorkerError;
        match err {
            WorkerError::NotFound(id) => ApiError::NotFound(format!("Worker {} not found", id)),
            WorkerError::Unauthorized(msg) => ApiError::Unauthorized(msg),
            WorkerError::Disabled(name) => {
                ApiError::Forbidden(format!("Worker {} is disabled", name))
            }
            WorkerError::ValidationError(msg) => ApiError::BadRequest(msg),
            WorkerError::DatabaseError(err) => ApiError::DatabaseError(err),
        }
    }
}

impl From<log_service::LogError> for ApiError {
    fn from(err: log_service::LogError) -> Self {
        use log_service::LogError;
        match err {
            LogError::JobNotFound(id) => ApiError::NotFound(format!("Job {} not found", id)),
            LogError::NotHolder(id) => {
                ApiError::Conflict(format!("Job {} is held by another worker", id))
            }
            LogError::ValidationError(msg) => ApiError::BadRequest(msg),
            LogError::DatabaseError(err) => ApiError::DatabaseError(err),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
