//! Error types for the Kiln client

use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur when using the Kiln client
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// API returned an error status code
    #[error("API error (status {status}): {message}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// Error message from the API
        message: String,
    },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    ParseError(String),

    /// A worker-only endpoint was called before registration
    #[error("No worker session, register first")]
    NoSession,
}

impl ClientError {
    /// Create an API error from status code and message
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiError {
            status,
            message: message.into(),
        }
    }

    /// HTTP status returned by the orchestrator, if the request got that far
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ApiError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Check if the orchestrator refused because someone else holds the job
    pub fn is_conflict(&self) -> bool {
        self.status() == Some(409)
    }

    /// Check if the target job was cancelled or purged
    pub fn is_gone(&self) -> bool {
        self.status() == Some(410)
    }

    /// Check if the worker was disabled by an operator
    pub fn is_forbidden(&self) -> bool {
        self.status() == Some(403)
    }

    /// Check if this error is a client error (4xx status)
    pub fn is_client_error(&self) -> bool {
        matches!(self.status(), Some(status) if (400..500).contains(&status))
    }

    /// Check if this error is a server error (5xx status)
    pub fn is_server_error(&self) -> bool {
        matches!(self.status(), Some(status) if status >= 500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_predicates() {
        assert!(ClientError::api_error(404, "").is_not_found());
        assert!(ClientError::api_error(409, "").is_conflict());
        assert!(ClientError::api_error(410, "").is_gone());
        assert!(ClientError::api_error(403, "").is_forbidden());
        assert!(ClientError::api_error(422, "").is_client_error());
        assert!(ClientError::api_error(503, "").is_server_error());
        assert!(!ClientError::NoSession.is_client_error());
        assert_eq!(ClientError::NoSession.status(), None);
    }
}
