//! Job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::requirement::Requirement;

/// Numeric job identifier, unique and immutable once created
pub type JobId = i64;

/// A schedulable unit of pipeline work
///
/// Structure shared between orchestrator (persists) and worker (executes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Pipeline run this job belongs to
    pub run_id: i64,
    pub action: Action,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    pub status: JobStatus,
    /// Worker holding the claim while Building
    pub worker_id: Option<String>,
    /// Hatchery pre-assignment, if any
    pub booked_by: Option<Booking>,
    /// Worker model hint
    pub model: Option<i64>,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub done_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether `worker_name` may claim this job given its current booking
    pub fn claimable_by(&self, worker_name: &str, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Waiting {
            return false;
        }
        match &self.booked_by {
            None => true,
            Some(booking) => booking.worker_name == worker_name || booking.is_expired(now),
        }
    }

    /// Whether a hatchery may book this job right now
    pub fn bookable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Waiting
            && self.booked_by.as_ref().is_none_or(|b| b.is_expired(now))
    }
}

/// Ordered list of steps the worker runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// One step of an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    /// Shell script executed with `sh -c`
    pub script: String,
    /// Step-level timeout, the worker default applies when absent
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Run even after an earlier step failed; its own failure is not fatal
    #[serde(default)]
    pub optional: bool,
}

/// Job execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Waiting,
    Checking,
    Building,
    Success,
    Fail,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "Waiting",
            JobStatus::Checking => "Checking",
            JobStatus::Building => "Building",
            JobStatus::Success => "Success",
            JobStatus::Fail => "Fail",
            JobStatus::Cancelled => "Cancelled",
        }
    }

    /// Terminal states a result may carry
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Fail | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Waiting" => Ok(JobStatus::Waiting),
            "Checking" => Ok(JobStatus::Checking),
            "Building" => Ok(JobStatus::Building),
            "Success" => Ok(JobStatus::Success),
            "Fail" => Ok(JobStatus::Fail),
            "Cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// A hatchery's reservation of a job for one worker it is about to spawn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub worker_name: String,
    pub hatchery_id: String,
    /// The booking lapses after this instant if the worker never claims
    pub until: DateTime<Utc>,
}

impl Booking {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.until <= now
    }
}

/// Result of a job execution, reported by the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    /// Either `Success` or `Fail`
    pub status: JobStatus,
    pub duration_ms: u64,
    #[serde(default)]
    pub steps: Vec<StepResult>,
    pub reason: Option<String>,
    /// Log lines produced while executing
    #[serde(default)]
    pub log_lines: u64,
    /// Worker-side clock at report time
    pub remote_time: DateTime<Utc>,
}

impl JobResult {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Fail,
            duration_ms: 0,
            steps: Vec::new(),
            reason: Some(reason.into()),
            log_lines: 0,
            remote_time: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Success
    }
}

/// Outcome of a single step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Success,
    Fail,
    TimedOut,
    Skipped,
}
