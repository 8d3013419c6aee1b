//! Kiln HTTP Client
//!
//! A simple, type-safe HTTP client for communicating with the Kiln orchestrator API.
//!
//! Workers, hatcheries and operator tooling all talk to the orchestrator
//! through this one client, so every request shape lives in a single place.
//!
//! # Example
//!
//! ```no_run
//! use kiln_client::OrchestratorClient;
//! use kiln_core::dto::worker::RegisterWorker;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut client = OrchestratorClient::new("http://localhost:8080");
//!
//!     let worker = client.register_worker(&RegisterWorker {
//!         token: "secret".to_string(),
//!         name: "worker-1".to_string(),
//!         model: None,
//!         hatchery_id: None,
//!         booked_job_id: None,
//!         ttl_minutes: 10,
//!     }).await?;
//!     client.set_session(worker.id.clone());
//!
//!     for job in client.list_queue(None).await? {
//!         println!("waiting: {}", job.id);
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
mod queue;
mod workers;

// Re-export commonly used types
pub use error::{ClientError, Result};
pub use kiln_core::dto::job::JobInfo;

use kiln_core::dto::worker::SESSION_SCHEME;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;

/// HTTP client for the Kiln orchestrator API
///
/// Endpoints are organized into logical groups:
/// - Queue: listing, take, booking, results, logs, requirement errors
/// - Runs: cancellation and purge
/// - Workers: registration, heartbeat, operator actions
/// - Hatcheries: liveness listing
///
/// Worker-only endpoints need a session, set with
/// [`OrchestratorClient::set_session`] once registration succeeded.
#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    /// Base URL of the orchestrator (e.g., "http://localhost:8080")
    base_url: String,
    /// HTTP client instance
    client: Client,
    /// Worker id sent in the session header
    session: Option<String>,
}

impl OrchestratorClient {
    /// Create a new orchestrator client
    ///
    /// # Example
    /// ```
    /// use kiln_client::OrchestratorClient;
    ///
    /// let client = OrchestratorClient::new("http://localhost:8080");
    /// ```
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new orchestrator client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            session: None,
        }
    }

    /// Get the base URL of the orchestrator
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Worker id of the current session
    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Attach the worker identity returned by registration
    pub fn set_session(&mut self, worker_id: impl Into<String>) {
        self.session = Some(worker_id.into());
    }

    /// Forget the worker identity
    pub fn clear_session(&mut self) {
        self.session = None;
    }

    /// Checks the orchestrator is up, returns its status line
    pub async fn health(&self) -> Result<String> {
        let url = format!("{}/health", self.base_url);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ClientError::api_error(status.as_u16(), body));
        }
        Ok(body)
    }

    // =============================================================================
    // Request Helpers
    // =============================================================================

    /// Add the session header to a worker request
    fn authed(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let worker_id = self.session.as_deref().ok_or(ClientError::NoSession)?;
        Ok(request.header(
            reqwest::header::AUTHORIZATION,
            format!("{} {}", SESSION_SCHEME, worker_id),
        ))
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Handle an API response and deserialize JSON
    ///
    /// This method checks the status code and returns an appropriate error if
    /// the request failed, or deserializes the response body if successful.
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Handle an API response that returns no content
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = OrchestratorClient::new("http://localhost:8080");
        assert_eq!(client.base_url(), "http://localhost:8080");
        assert_eq!(client.session(), None);
    }

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = OrchestratorClient::new("http://localhost:8080/");
        assert_eq!(client.base_url(), "http://localhost:8080");
    }

    #[test]
    fn test_session_lifecycle() {
        let mut client = OrchestratorClient::new("http://localhost:8080");
        client.set_session("w-1");
        assert_eq!(client.session(), Some("w-1"));
        client.clear_session();
        assert_eq!(client.session(), None);
    }

    #[tokio::test]
    async fn test_worker_call_without_session_fails_fast() {
        let client = OrchestratorClient::new("http://127.0.0.1:9");
        let err = client.refresh().await.unwrap_err();
        assert!(matches!(err, ClientError::NoSession));
    }
}
