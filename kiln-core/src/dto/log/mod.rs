//! Log DTOs for inter-service communication

use serde::{Deserialize, Serialize};

use crate::domain::job::JobId;
use crate::domain::log::LogLine;

/// Most lines the orchestrator accepts in one batch
pub const MAX_BATCH_SIZE: usize = 1000;

/// Longest accepted log message, in chars
pub const MAX_MESSAGE_LENGTH: usize = 10_000;

/// Log batch streamed from worker to orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogBatch {
    pub job_id: JobId,
    pub lines: Vec<LogLine>,
}

/// Acknowledgement closing a job's log stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogAck {
    pub job_id: JobId,
    /// Lines the orchestrator holds for the job
    pub received: u64,
}
