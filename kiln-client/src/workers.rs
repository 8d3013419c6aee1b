//! Worker and hatchery endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use kiln_core::domain::hatchery::HatcheryStatus;
use kiln_core::domain::worker::Worker;
use kiln_core::dto::worker::RegisterWorker;

impl OrchestratorClient {
    // =============================================================================
    // Worker Registration & Lifecycle
    // =============================================================================

    /// Register a worker with the orchestrator
    ///
    /// The returned worker carries the identity to pass to
    /// [`OrchestratorClient::set_session`].
    pub async fn register_worker(&self, form: &RegisterWorker) -> Result<Worker> {
        let url = format!("{}/worker/register", self.base_url);
        let response = self.client.post(&url).json(form).send().await?;

        self.handle_response(response).await
    }

    /// Send a heartbeat for the current session
    ///
    /// Answers 403 once the worker is disabled and 401 if the orchestrator
    /// forgot it.
    pub async fn refresh(&self) -> Result<()> {
        let url = format!("{}/worker/refresh", self.base_url);
        let response = self.authed(self.client.post(&url))?.send().await?;

        self.handle_empty_response(response).await
    }

    /// Unregister the current session
    pub async fn unregister(&self) -> Result<()> {
        let url = format!("{}/worker/unregister", self.base_url);
        let response = self.authed(self.client.post(&url))?.send().await?;

        self.handle_empty_response(response).await
    }

    // =============================================================================
    // Worker Administration
    // =============================================================================

    /// List all registered workers
    pub async fn list_workers(&self) -> Result<Vec<Worker>> {
        let url = format!("{}/worker", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Disable a worker, it exits at its next heartbeat
    pub async fn disable_worker(&self, worker_id: &str) -> Result<()> {
        let url = format!("{}/worker/{}/disable", self.base_url, worker_id);
        let response = self.client.post(&url).send().await?;

        self.handle_empty_response(response).await
    }

    /// Force-unregister a worker
    pub async fn delete_worker(&self, worker_id: &str) -> Result<()> {
        let url = format!("{}/worker/{}", self.base_url, worker_id);
        let response = self.client.delete(&url).send().await?;

        self.handle_empty_response(response).await
    }

    // =============================================================================
    // Hatcheries
    // =============================================================================

    /// List known hatcheries with their liveness
    pub async fn list_hatcheries(&self) -> Result<Vec<HatcheryStatus>> {
        let url = format!("{}/hatchery", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_refresh_forbidden_when_disabled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/worker/refresh"))
            .and(header("authorization", "Worker w-1"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let mut client = OrchestratorClient::new(server.uri());
        client.set_session("w-1");
        assert!(client.refresh().await.unwrap_err().is_forbidden());
    }

    #[tokio::test]
    async fn test_delete_worker() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/worker/w-9"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = OrchestratorClient::new(server.uri());
        client.delete_worker("w-9").await.unwrap();
    }
}
