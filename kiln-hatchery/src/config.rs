//! Hatchery configuration

use clap::Parser;
use kiln_core::domain::requirement::RequirementType;
use std::path::PathBuf;
use std::time::Duration;

/// Command line of the hatchery binary
#[derive(Debug, Parser)]
#[command(name = "kiln-hatchery", about = "Kiln worker autoscaler", version)]
pub struct Args {
    /// Orchestrator base URL
    #[arg(long, env = "KILN_API")]
    pub api: String,

    /// Registration token handed to spawned workers
    #[arg(long, env = "KILN_TOKEN")]
    pub token: String,

    /// Store shared with the orchestrator, a redis:// URL
    #[arg(long, env = "KILN_CACHE_URL")]
    pub cache_url: String,

    #[arg(long, env = "KILN_HATCHERY_NAME", default_value = "local")]
    pub name: String,

    /// Spawn ceiling
    #[arg(long, env = "KILN_MAX_WORKERS", default_value_t = 4)]
    pub max_workers: usize,

    /// Worker models this hatchery can spawn, comma separated
    #[arg(long, env = "KILN_MODELS", value_delimiter = ',')]
    pub models: Vec<i64>,

    /// TTL of spawned workers, in minutes
    #[arg(long, env = "KILN_WORKER_TTL", default_value_t = 10)]
    pub worker_ttl: u64,

    /// Seconds between two provisioning passes
    #[arg(long, env = "KILN_PROVISION_INTERVAL", default_value_t = 2)]
    pub provision_interval: u64,

    /// Seconds between two reaper passes
    #[arg(long, env = "KILN_REAP_INTERVAL", default_value_t = 30)]
    pub reap_interval: u64,

    /// Seconds between two hatchery heartbeats
    #[arg(long, env = "KILN_HATCHERY_HEARTBEAT", default_value_t = 10)]
    pub heartbeat: u64,

    /// Spawns started in a single provisioning pass
    #[arg(long, env = "KILN_MAX_CONCURRENT_PROVISIONING", default_value_t = 10)]
    pub max_concurrent_provisioning: usize,

    /// Worker executable spawned for each job
    #[arg(long, env = "KILN_WORKER_BINARY", default_value = "kiln-worker")]
    pub worker_binary: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub token: String,
    pub cache_url: String,
    pub name: String,
    pub max_workers: usize,
    pub models: Vec<i64>,
    /// Requirement kinds spawned workers can satisfy
    pub requirement_types: Vec<RequirementType>,
    pub worker_ttl: Duration,
    pub provision_interval: Duration,
    pub reap_interval: Duration,
    pub heartbeat_interval: Duration,
    pub max_concurrent_provisioning: usize,
    /// How long a booking holds while the spawned worker boots
    pub booking_ttl: Duration,
    /// Age after which an instance without a registered worker is killed
    pub orphan_grace: Duration,
    pub worker_binary: PathBuf,
}

impl Config {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            token: token.into(),
            cache_url: "redis://127.0.0.1:6379".to_string(),
            name: name.into(),
            max_workers: 4,
            models: Vec::new(),
            requirement_types: process_requirement_types(),
            worker_ttl: Duration::from_secs(10 * 60),
            provision_interval: Duration::from_secs(2),
            reap_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            max_concurrent_provisioning: 10,
            booking_ttl: Duration::from_secs(120),
            orphan_grace: Duration::from_secs(120),
            worker_binary: PathBuf::from("kiln-worker"),
        }
    }

    pub fn from_args(args: Args) -> Self {
        let mut config = Self::new(args.api, args.token, args.name);
        config.cache_url = args.cache_url;
        config.max_workers = args.max_workers;
        config.models = args.models;
        config.worker_ttl = Duration::from_secs(args.worker_ttl.saturating_mul(60));
        config.provision_interval = Duration::from_secs(args.provision_interval);
        config.reap_interval = Duration::from_secs(args.reap_interval);
        config.heartbeat_interval = Duration::from_secs(args.heartbeat);
        config.max_concurrent_provisioning = args.max_concurrent_provisioning;
        config.worker_binary = args.worker_binary;
        config
    }

    pub fn worker_ttl_minutes(&self) -> u32 {
        u32::try_from(self.worker_ttl.as_secs() / 60).unwrap_or(u32::MAX)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("hatchery name cannot be empty");
        }

        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            anyhow::bail!("api url must start with http:// or https://");
        }

        // An in-process store never reaches the orchestrator
        if !self.cache_url.starts_with("redis://") && !self.cache_url.starts_with("rediss://") {
            anyhow::bail!(
                "cache url must be the redis:// store shared with the orchestrator, got '{}'",
                self.cache_url
            );
        }

        if self.max_workers == 0 {
            anyhow::bail!("max workers must be greater than 0");
        }

        if self.max_concurrent_provisioning == 0 {
            anyhow::bail!("max concurrent provisioning must be greater than 0");
        }

        if self.provision_interval.is_zero()
            || self.reap_interval.is_zero()
            || self.heartbeat_interval.is_zero()
        {
            anyhow::bail!("intervals must be greater than 0");
        }

        if self.worker_ttl < Duration::from_secs(60) {
            anyhow::bail!("worker ttl must be at least one minute");
        }

        Ok(())
    }
}

/// Local processes cannot bring side services or pick a memory size
fn process_requirement_types() -> Vec<RequirementType> {
    vec![
        RequirementType::Binary,
        RequirementType::Network,
        RequirementType::Hostname,
        RequirementType::Plugin,
        RequirementType::Model,
        RequirementType::Os,
    ]
}
