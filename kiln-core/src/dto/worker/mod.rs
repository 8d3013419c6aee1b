//! Worker DTOs

use serde::{Deserialize, Serialize};

use crate::domain::job::JobId;

/// Header carrying the worker identity after registration
pub const SESSION_HEADER: &str = "authorization";

/// Scheme prefix of the session header value
pub const SESSION_SCHEME: &str = "Worker";

/// Request to register a worker with the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorker {
    /// Shared registration token
    pub token: String,

    pub name: String,

    pub model: Option<i64>,

    pub hatchery_id: Option<String>,

    pub booked_job_id: Option<JobId>,

    /// Idle/heartbeat TTL declared by the worker
    pub ttl_minutes: u32,
}
