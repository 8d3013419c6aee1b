//! Queue and run endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use chrono::Utc;
use kiln_core::domain::job::{Job, JobId, JobResult};
use kiln_core::domain::log::LogLine;
use kiln_core::dto::job::{JobInfo, NewJob};
use kiln_core::dto::log::{LogAck, LogBatch};
use kiln_core::dto::queue::{BookForm, RequirementError, TakeForm};

impl OrchestratorClient {
    // =============================================================================
    // Queue Listing
    // =============================================================================

    /// List Waiting jobs, oldest first
    ///
    /// # Arguments
    /// * `model` - Restrict the listing to jobs hinting this worker model
    pub async fn list_queue(&self, model: Option<i64>) -> Result<Vec<Job>> {
        let url = format!("{}/queue", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(model) = model {
            request = request.query(&[("model", model)]);
        }
        let response = request.send().await?;

        self.handle_response(response).await
    }

    /// Get a job by ID
    pub async fn get_job(&self, job_id: JobId) -> Result<Job> {
        let url = format!("{}/queue/{}", self.base_url, job_id);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Enqueue a new job
    ///
    /// # Example
    /// ```no_run
    /// # use kiln_client::OrchestratorClient;
    /// # use kiln_core::domain::job::Action;
    /// # use kiln_core::dto::job::NewJob;
    /// # async fn example() -> anyhow::Result<()> {
    /// let client = OrchestratorClient::new("http://localhost:8080");
    /// let job = client.enqueue_job(&NewJob {
    ///     run_id: 1,
    ///     action: Action { name: "build".to_string(), steps: vec![] },
    ///     requirements: vec![],
    ///     model: None,
    ///     parameters: Default::default(),
    ///     secrets: Default::default(),
    /// }).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn enqueue_job(&self, job: &NewJob) -> Result<Job> {
        let url = format!("{}/queue", self.base_url);
        let response = self.client.post(&url).json(job).send().await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Claim & Booking
    // =============================================================================

    /// Take (claim) a job for the current worker session
    ///
    /// Fails with 409 when another worker won the race, 404 for an unknown
    /// job and 410 once the job was cancelled.
    pub async fn take_job(&self, job_id: JobId, booked_job_id: Option<JobId>) -> Result<JobInfo> {
        let url = format!("{}/queue/{}/take", self.base_url, job_id);
        let form = TakeForm {
            time: Utc::now(),
            booked_job_id,
        };
        let response = self.authed(self.client.post(&url))?.json(&form).send().await?;

        self.handle_response(response).await
    }

    /// Book a job for a worker a hatchery is about to spawn
    pub async fn book_job(&self, job_id: JobId, form: &BookForm) -> Result<()> {
        let url = format!("{}/queue/{}/book", self.base_url, job_id);
        let response = self.client.post(&url).json(form).send().await?;

        self.handle_empty_response(response).await
    }

    // =============================================================================
    // Execution Reporting
    // =============================================================================

    /// Report the final result of a job
    pub async fn submit_result(&self, job_id: JobId, result: &JobResult) -> Result<()> {
        let url = format!("{}/queue/{}/result", self.base_url, job_id);
        let response = self.authed(self.client.post(&url))?.json(result).send().await?;

        self.handle_empty_response(response).await
    }

    /// Stream a batch of log lines for a job
    pub async fn send_logs(&self, job_id: JobId, lines: Vec<LogLine>) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }

        let url = format!("{}/queue/{}/log", self.base_url, job_id);
        let batch = LogBatch { job_id, lines };
        let response = self.authed(self.client.post(&url))?.json(&batch).send().await?;

        self.handle_empty_response(response).await
    }

    /// Close the log stream of a job, returns how many lines the server holds
    pub async fn close_logs(&self, job_id: JobId) -> Result<LogAck> {
        let url = format!("{}/queue/{}/log/close", self.base_url, job_id);
        let response = self.authed(self.client.post(&url))?.send().await?;

        self.handle_response(response).await
    }

    /// Report a requirement that could not be evaluated
    pub async fn post_requirement_error(&self, error: &RequirementError) -> Result<()> {
        let url = format!("{}/queue/requirements/errors", self.base_url);
        let response = self.authed(self.client.post(&url))?.json(error).send().await?;

        self.handle_empty_response(response).await
    }

    /// Latest requirement errors, one per requirement
    pub async fn list_requirement_errors(&self) -> Result<Vec<RequirementError>> {
        let url = format!("{}/queue/requirements/errors", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Runs
    // =============================================================================

    /// Cancel every unfinished job of a run
    pub async fn cancel_run(&self, run_id: i64) -> Result<()> {
        let url = format!("{}/run/{}/cancel", self.base_url, run_id);
        let response = self.client.post(&url).send().await?;

        self.handle_empty_response(response).await
    }

    /// Delete every job of a run
    pub async fn purge_run(&self, run_id: i64) -> Result<()> {
        let url = format!("{}/run/{}", self.base_url, run_id);
        let response = self.client.delete(&url).send().await?;

        self.handle_empty_response(response).await
    }
}
