//! Job DTOs for inter-service communication

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::job::{Action, Job};
use crate::domain::requirement::Requirement;

/// Request to enqueue a new job, sent by the pipeline scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub run_id: i64,
    pub action: Action,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    pub model: Option<i64>,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    /// Never exposed in queue listings, only handed to the claiming worker
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

/// Everything a worker needs to execute a job it just claimed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub job: Job,
    pub worker_id: String,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}
