//! Kiln Worker
//!
//! A build agent that registers with the orchestrator, scans the job queue,
//! claims jobs whose requirements it satisfies, executes their steps and
//! reports results.
//!
//! Architecture:
//! - Configuration: command line flags with environment fallbacks
//! - Session: identity and lifecycle state, owned by the agent loop
//! - Requirements: one check per requirement type
//! - Executor: shell steps with per-step timeouts
//! - Logs/Report: log streaming and result reporting with retries
//! - Heartbeat: background registration refresh

pub mod agent;
pub mod config;
pub mod executor;
pub mod heartbeat;
pub mod logs;
pub mod report;
pub mod requirements;
pub mod session;
pub mod shutdown;

pub use agent::Agent;
pub use config::{Args, Config};
pub use session::ExitReason;
