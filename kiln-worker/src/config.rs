//! Worker configuration
//!
//! Command line flags (each with an environment fallback) are turned into a
//! validated [`Config`] holding every interval as a [`Duration`].

use clap::Parser;
use kiln_core::domain::job::JobId;
use std::path::PathBuf;
use std::time::Duration;

use crate::requirements::local_hostname;

/// Command line of the worker binary
#[derive(Debug, Parser)]
#[command(name = "kiln-worker", about = "Kiln build worker", version)]
pub struct Args {
    /// Orchestrator base URL
    #[arg(long, env = "KILN_API")]
    pub api: String,

    /// Registration token
    #[arg(long, env = "KILN_TOKEN")]
    pub token: String,

    /// Worker name, defaults to the host name
    #[arg(long, env = "KILN_NAME")]
    pub name: Option<String>,

    /// Worker model id
    #[arg(long, env = "KILN_MODEL")]
    pub model: Option<i64>,

    /// Hatchery that spawned this worker
    #[arg(long, env = "KILN_HATCHERY")]
    pub hatchery: Option<String>,

    /// Job booked for this worker by its hatchery
    #[arg(long, env = "KILN_BOOKED_JOB_ID")]
    pub booked_job_id: Option<JobId>,

    /// Idle time to live, in minutes
    #[arg(long, env = "KILN_TTL", default_value_t = 30)]
    pub ttl: u64,

    /// Heartbeat interval, in seconds
    #[arg(long, env = "KILN_HEARTBEAT", default_value_t = 10)]
    pub heartbeat: u64,

    /// Exit after executing one job
    #[arg(long, env = "KILN_SINGLE_USE")]
    pub single_use: bool,

    /// Working directory for builds, defaults to the system temp dir
    #[arg(long, env = "KILN_BASEDIR")]
    pub basedir: Option<PathBuf>,
}

/// Retry budget for operations that must not be lost on a transient failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

/// Worker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Orchestrator base URL (e.g., "http://localhost:8080")
    pub api_url: String,

    pub token: String,

    pub name: String,

    pub model: Option<i64>,

    pub hatchery_id: Option<String>,

    /// Claimed first, then forgotten after one queue cycle
    pub booked_job_id: Option<JobId>,

    /// Exit when no job was executed within this time
    pub ttl: Duration,

    pub heartbeat_interval: Duration,

    pub single_use: bool,

    pub basedir: PathBuf,

    /// Time between two queue scans
    pub poll_interval: Duration,

    /// Wait after a failed registration
    pub register_backoff: Duration,

    /// How often buffered build logs are streamed
    pub log_send_interval: Duration,

    /// Timeout of steps that do not declare their own
    pub step_timeout: Duration,

    pub result_retry: RetryPolicy,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(api_url: impl Into<String>, token: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            token: token.into(),
            name: name.into(),
            model: None,
            hatchery_id: None,
            booked_job_id: None,
            ttl: Duration::from_secs(30 * 60),
            heartbeat_interval: Duration::from_secs(10),
            single_use: false,
            basedir: std::env::temp_dir(),
            poll_interval: Duration::from_secs(5),
            register_backoff: Duration::from_secs(10),
            log_send_interval: Duration::from_secs(1),
            step_timeout: Duration::from_secs(60 * 60),
            result_retry: RetryPolicy {
                attempts: 10,
                backoff: Duration::from_secs(5),
            },
        }
    }

    /// Builds the configuration from parsed command line flags
    pub fn from_args(args: Args) -> Self {
        let name = args.name.unwrap_or_else(local_hostname);
        let mut config = Self::new(args.api, args.token, name);

        config.model = args.model;
        config.hatchery_id = args.hatchery;
        config.booked_job_id = args.booked_job_id;
        config.ttl = Duration::from_secs(args.ttl.saturating_mul(60));
        config.heartbeat_interval = Duration::from_secs(args.heartbeat);
        config.single_use = args.single_use;
        if let Some(basedir) = args.basedir {
            config.basedir = basedir;
        }

        config
    }

    /// TTL announced at registration
    pub fn ttl_minutes(&self) -> u32 {
        u32::try_from(self.ttl.as_secs() / 60).unwrap_or(u32::MAX)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("name cannot be empty");
        }

        if self.token.is_empty() {
            anyhow::bail!("token cannot be empty");
        }

        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            anyhow::bail!("api url must start with http:// or https://");
        }

        if self.heartbeat_interval.is_zero() {
            anyhow::bail!("heartbeat interval must be greater than 0");
        }

        if self.poll_interval.is_zero() {
            anyhow::bail!("poll interval must be greater than 0");
        }

        if self.ttl.is_zero() {
            anyhow::bail!("ttl must be greater than 0");
        }

        if self.result_retry.attempts == 0 {
            anyhow::bail!("result retry attempts must be greater than 0");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec![
            "kiln-worker",
            "--api",
            "http://localhost:8080",
            "--token",
            "secret",
        ];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_default_config() {
        let config = Config::new("http://localhost:8080", "secret", "w1");
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.result_retry.attempts, 10);
        assert_eq!(config.ttl_minutes(), 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_args() {
        let config = Config::from_args(args(&[
            "--name",
            "spawned-1",
            "--booked-job-id",
            "42",
            "--ttl",
            "2",
            "--heartbeat",
            "3",
            "--single-use",
        ]));

        assert_eq!(config.name, "spawned-1");
        assert_eq!(config.booked_job_id, Some(42));
        assert_eq!(config.ttl, Duration::from_secs(120));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(3));
        assert!(config.single_use);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::new("http://localhost:8080", "secret", "w1");

        config.api_url = "localhost:8080".to_string();
        assert!(config.validate().is_err());
        config.api_url = "http://localhost:8080".to_string();

        config.heartbeat_interval = Duration::ZERO;
        assert!(config.validate().is_err());
        config.heartbeat_interval = Duration::from_secs(1);

        config.name = " ".to_string();
        assert!(config.validate().is_err());
    }
}
