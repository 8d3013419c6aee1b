//! Queue DTOs: take, booking, diagnostics and queue notifications

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::job::{JobId, JobStatus};
use crate::domain::requirement::RequirementType;

/// Body of `POST /queue/{id}/take`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeForm {
    pub time: DateTime<Utc>,
    /// Set when the worker is taking the job its hatchery booked for it
    pub booked_job_id: Option<JobId>,
}

/// Body of `POST /queue/{id}/book`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookForm {
    pub worker_name: String,
    pub hatchery_id: String,
    /// How long the booking holds if the worker never shows up
    pub ttl_secs: u64,
}

/// Body of `POST /queue/requirements/errors`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequirementError {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RequirementType,
    pub value: String,
    pub error: String,
}

/// Query string of `GET /queue`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueFilter {
    pub model: Option<i64>,
}

/// Entry pushed on the KV job queue when a job becomes Waiting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub queued_at: DateTime<Utc>,
}

/// Notification published on the queue events channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Queued { job_id: JobId, model: Option<i64> },
    Claimed { job_id: JobId, worker_id: String },
    Done { job_id: JobId, status: JobStatus },
    RunCancelled { run_id: i64 },
}

/// Store keys used by the job queue
pub mod keys {
    /// KV queue fed with a [`super::QueueEntry`] per newly Waiting job
    pub const JOBS: &str = "queue:jobs";

    /// Pub/sub channel carrying [`super::QueueEvent`]s
    pub const EVENTS: &str = "queue:events";

    /// Prefix of cached queue listings
    pub const LISTING: &str = "queue:listing";

    /// Set of the latest requirement check errors
    pub const REQUIREMENT_ERRORS: &str = "requirements:errors";

    /// Set of worker models demanded by Waiting jobs, rebuilt wholesale
    pub const REQUIRED_MODELS: &str = "requirements:models";

    /// Listing cache key for an optional model filter
    pub fn listing(model: Option<i64>) -> String {
        match model {
            Some(model) => format!("{}:model:{}", LISTING, model),
            None => format!("{}:all", LISTING),
        }
    }
}
