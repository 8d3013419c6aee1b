//! Orchestrator configuration

use std::time::Duration;

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres URL; the in-memory repositories are used when absent
    pub database_url: Option<String>,

    /// Store URL: `local` or `redis://...`
    pub cache_url: String,

    /// Address the HTTP server binds to
    pub bind_addr: String,

    /// Shared token workers present at registration
    pub worker_token: String,

    /// How long a queue listing snapshot stays cached
    pub listing_ttl: Duration,

    /// TTL given to workers that register without declaring one
    pub default_worker_ttl_minutes: u32,

    /// Interval between two rebuilds of the required-models set
    pub requirement_cache_interval: Duration,
}

impl Config {
    /// Creates a configuration with defaults and the given worker token
    pub fn new(worker_token: impl Into<String>) -> Self {
        Self {
            database_url: None,
            cache_url: "local".to_string(),
            bind_addr: "0.0.0.0:8080".to_string(),
            worker_token: worker_token.into(),
            listing_ttl: Duration::from_secs(2),
            default_worker_ttl_minutes: 10,
            requirement_cache_interval: Duration::from_secs(5),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - KILN_WORKER_TOKEN (required)
    /// - DATABASE_URL (optional, in-memory repositories when unset)
    /// - KILN_CACHE_URL (optional, default: local)
    /// - ORCHESTRATOR_BIND_ADDR (optional, default: 0.0.0.0:8080)
    /// - KILN_LISTING_TTL (optional, seconds, default: 2)
    /// - KILN_WORKER_TTL (optional, minutes, default: 10)
    pub fn from_env() -> anyhow::Result<Self> {
        let worker_token = std::env::var("KILN_WORKER_TOKEN")
            .map_err(|_| anyhow::anyhow!("KILN_WORKER_TOKEN environment variable not set"))?;

        let mut config = Self::new(worker_token);

        config.database_url = std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty());

        if let Ok(url) = std::env::var("KILN_CACHE_URL") {
            config.cache_url = url;
        }

        if let Ok(addr) = std::env::var("ORCHESTRATOR_BIND_ADDR") {
            config.bind_addr = addr;
        }

        if let Some(ttl) = std::env::var("KILN_LISTING_TTL")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            config.listing_ttl = Duration::from_secs(ttl);
        }

        if let Some(ttl) = std::env::var("KILN_WORKER_TTL")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
        {
            config.default_worker_ttl_minutes = ttl;
        }

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_token.is_empty() {
            anyhow::bail!("worker_token cannot be empty");
        }

        if self.bind_addr.is_empty() {
            anyhow::bail!("bind_addr cannot be empty");
        }

        if self.listing_ttl.is_zero() {
            anyhow::bail!("listing_ttl must be greater than 0");
        }

        if self.default_worker_ttl_minutes == 0 {
            anyhow::bail!("default worker ttl must be greater than 0");
        }

        if self.requirement_cache_interval.is_zero() {
            anyhow::bail!("requirement_cache_interval must be greater than 0");
        }

        Ok(())
    }
}
