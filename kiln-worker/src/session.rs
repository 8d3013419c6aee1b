//! Worker session
//!
//! Everything the agent mutates while it runs: identity, state, booked hint
//! and counters. It is passed by `&mut` through the poll cycle.

use kiln_client::OrchestratorClient;
use kiln_core::domain::job::JobId;
use std::time::Duration;
use tokio::time::Instant;

/// Lifecycle state of the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Unregistered,
    Waiting,
    Checking,
    Building,
    Terminated,
}

/// Why the agent stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Nothing was executed within the TTL
    IdleTimeout,
    /// One job was executed in single-use mode
    SingleUse,
    /// The orchestrator disabled this worker
    Disabled,
    /// The job whose result was being reported no longer exists
    JobVanished,
    /// Shutdown signal
    Shutdown,
}

pub struct WorkerSession {
    pub client: OrchestratorClient,
    pub state: WorkerState,
    pub booked_job_id: Option<JobId>,
    pub jobs_executed: u64,
    pub started_at: Instant,
}

impl WorkerSession {
    pub fn new(client: OrchestratorClient, booked_job_id: Option<JobId>) -> Self {
        Self {
            client,
            state: WorkerState::Unregistered,
            booked_job_id,
            jobs_executed: 0,
            started_at: Instant::now(),
        }
    }

    pub fn worker_id(&self) -> Option<&str> {
        self.client.session()
    }

    pub fn is_registered(&self) -> bool {
        self.client.session().is_some()
    }

    pub fn registered(&mut self, worker_id: impl Into<String>) {
        self.client.set_session(worker_id);
        self.state = WorkerState::Waiting;
    }

    /// Forgets the identity so the next cycle registers again
    pub fn clear_identity(&mut self) {
        self.client.clear_session();
        self.state = WorkerState::Unregistered;
    }

    pub fn idle_expired(&self, ttl: Duration) -> bool {
        idle_expired(self.jobs_executed, self.started_at.elapsed(), ttl)
    }
}

/// A worker that never executed anything leaves once its TTL has elapsed
pub fn idle_expired(jobs_executed: u64, alive_for: Duration, ttl: Duration) -> bool {
    jobs_executed == 0 && alive_for >= ttl
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_expired() {
        let ttl = Duration::from_secs(60);
        assert!(!idle_expired(0, Duration::from_secs(59), ttl));
        assert!(idle_expired(0, Duration::from_secs(60), ttl));
        assert!(!idle_expired(1, Duration::from_secs(3600), ttl));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_ttl_follows_clock() {
        let mut session = WorkerSession::new(OrchestratorClient::new("http://localhost:1"), None);
        let ttl = Duration::from_secs(120);

        assert!(!session.idle_expired(ttl));
        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(session.idle_expired(ttl));

        session.jobs_executed = 1;
        assert!(!session.idle_expired(ttl));
    }

    #[tokio::test]
    async fn test_identity() {
        let mut session = WorkerSession::new(OrchestratorClient::new("http://localhost:1"), Some(3));
        assert!(!session.is_registered());

        session.registered("abc");
        assert_eq!(session.worker_id(), Some("abc"));
        assert_eq!(session.state, WorkerState::Waiting);

        session.clear_identity();
        assert!(!session.is_registered());
        assert_eq!(session.state, WorkerState::Unregistered);
        assert_eq!(session.booked_job_id, Some(3));
    }
}
