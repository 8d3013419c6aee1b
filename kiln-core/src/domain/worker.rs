//! Worker domain model
//!
//! Represents an ephemeral agent that claims and executes jobs.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::job::JobId;

/// An ephemeral execution agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    /// Identifier assigned by the orchestrator at registration
    pub id: String,

    /// Human readable name, unique per hatchery
    pub name: String,

    /// Hatchery that spawned this worker, if any
    pub hatchery_id: Option<String>,

    /// Worker model id
    pub model: Option<i64>,

    /// Current status of the worker
    pub status: WorkerStatus,

    /// Job currently being built
    pub job_id: Option<JobId>,

    /// Job the spawning hatchery booked for this worker
    pub booked_job_id: Option<JobId>,

    /// Heartbeat silence tolerated before the worker is considered dead
    pub ttl_minutes: u32,

    /// When this worker registered
    pub registered_at: DateTime<Utc>,

    /// Last time this worker sent a heartbeat
    pub last_beat: DateTime<Utc>,
}

impl Worker {
    /// A worker silent for longer than its TTL is dead and must be reaped
    pub fn is_dead(&self, now: DateTime<Utc>) -> bool {
        now - self.last_beat > Duration::minutes(i64::from(self.ttl_minutes))
    }
}

/// Status of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerStatus {
    /// Idle, polling the queue
    Waiting,

    /// Evaluating requirements of queued jobs
    Checking,

    /// Executing a job
    Building,

    /// Disabled by an operator or the server, must not take jobs
    Disabled,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Waiting => "Waiting",
            WorkerStatus::Checking => "Checking",
            WorkerStatus::Building => "Building",
            WorkerStatus::Disabled => "Disabled",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Waiting" => Ok(WorkerStatus::Waiting),
            "Checking" => Ok(WorkerStatus::Checking),
            "Building" => Ok(WorkerStatus::Building),
            "Disabled" => Ok(WorkerStatus::Disabled),
            other => Err(format!("unknown worker status '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(last_beat: DateTime<Utc>) -> Worker {
        Worker {
            id: "id".to_string(),
            name: "w".to_string(),
            hatchery_id: None,
            model: None,
            status: WorkerStatus::Waiting,
            job_id: None,
            booked_job_id: None,
            ttl_minutes: 10,
            registered_at: last_beat,
            last_beat,
        }
    }

    #[test]
    fn test_worker_alive_within_ttl() {
        let now = Utc::now();
        assert!(!worker(now - Duration::minutes(9)).is_dead(now));
    }

    #[test]
    fn test_worker_dead_after_ttl() {
        let now = Utc::now();
        assert!(worker(now - Duration::minutes(11)).is_dead(now));
    }
}
