//! Result reporting with a bounded retry budget

use kiln_client::OrchestratorClient;
use kiln_core::domain::job::{JobId, JobResult};
use tracing::{error, info, warn};

use crate::config::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Sent,
    /// The orchestrator no longer knows the job
    JobVanished,
    /// Every attempt failed, the result is dropped
    Abandoned,
}

/// Posts the result, retrying transient failures with a fixed backoff
pub async fn report_result(
    client: &OrchestratorClient,
    job_id: JobId,
    result: &JobResult,
    policy: RetryPolicy,
) -> ReportOutcome {
    for attempt in 1..=policy.attempts {
        match client.submit_result(job_id, result).await {
            Ok(()) => {
                info!("Result of job {} sent: {}", job_id, result.status);
                return ReportOutcome::Sent;
            }
            Err(e) if e.is_not_found() => {
                warn!("Cannot send result: job {} does not exist anymore", job_id);
                return ReportOutcome::JobVanished;
            }
            Err(e) => {
                warn!(
                    "Cannot send result of job {} (attempt {}/{}): {}",
                    job_id, attempt, policy.attempts, e
                );
            }
        }

        if attempt < policy.attempts {
            tokio::time::sleep(policy.backoff).await;
        }
    }

    error!(
        "Could not send result of job {} after {} attempts, giving up",
        job_id, policy.attempts
    );
    ReportOutcome::Abandoned
}
