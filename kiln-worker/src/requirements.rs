//! Requirement checks
//!
//! Each [`RequirementType`] has exactly one check. A check answers whether
//! this worker satisfies the requirement, or fails when it cannot tell
//! (malformed value, unreadable environment); failures are reported to the
//! orchestrator as diagnostics.

use anyhow::{Context, Result};
use kiln_core::domain::job::Job;
use kiln_core::domain::requirement::{Requirement, RequirementType};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpStream;

const NETWORK_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// What requirement checks look at
#[derive(Debug, Clone)]
pub struct CheckContext {
    pub model: Option<i64>,
    pub hostname: String,
    pub plugin_dir: PathBuf,
}

impl CheckContext {
    pub fn new(model: Option<i64>, basedir: &Path) -> Self {
        Self {
            model,
            hostname: local_hostname(),
            plugin_dir: basedir.join("plugins"),
        }
    }
}

/// Outcome of evaluating all requirements of a job
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Runnable,
    /// First requirement that is not met
    Unmet(String),
    /// A requirement could not be evaluated
    Error {
        requirement: Requirement,
        error: String,
    },
}

/// Evaluates requirements in order, stopping at the first that is not met
pub async fn evaluate(job: &Job, ctx: &CheckContext) -> Verdict {
    if let Some(model) = job.model {
        if ctx.model != Some(model) {
            return Verdict::Unmet(format!("model {}", model));
        }
    }

    for requirement in &job.requirements {
        match check(requirement, ctx).await {
            Ok(true) => {}
            Ok(false) => return Verdict::Unmet(requirement.name.clone()),
            Err(e) => {
                return Verdict::Error {
                    requirement: requirement.clone(),
                    error: format!("{:#}", e),
                };
            }
        }
    }

    Verdict::Runnable
}

/// Checks a single requirement
pub async fn check(requirement: &Requirement, ctx: &CheckContext) -> Result<bool> {
    let value = requirement.value.trim();
    match requirement.kind {
        RequirementType::Binary => Ok(check_binary(value)),
        RequirementType::Network => check_network(value).await,
        RequirementType::Hostname => Ok(ctx.hostname == value),
        RequirementType::Plugin => Ok(ctx.plugin_dir.join(value).is_file()),
        RequirementType::Model => check_model(value, ctx.model),
        // Provided by the hatchery when it picks or prepares the instance
        RequirementType::Service | RequirementType::Memory => Ok(true),
        RequirementType::Os => check_os(value),
    }
}

fn check_binary(name: &str) -> bool {
    if name.contains('/') {
        return is_executable(Path::new(name));
    }

    std::env::var_os("PATH")
        .map(|path| std::env::split_paths(&path).any(|dir| is_executable(&dir.join(name))))
        .unwrap_or(false)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

async fn check_network(address: &str) -> Result<bool> {
    if address.rsplit_once(':').is_none() {
        anyhow::bail!("expected host:port, got '{}'", address);
    }

    match tokio::time::timeout(NETWORK_CHECK_TIMEOUT, TcpStream::connect(address)).await {
        Ok(Ok(_)) => Ok(true),
        Ok(Err(e)) => {
            tracing::debug!("Network requirement {} unreachable: {}", address, e);
            Ok(false)
        }
        Err(_) => Ok(false),
    }
}

fn check_model(value: &str, model: Option<i64>) -> Result<bool> {
    let wanted: i64 = value
        .parse()
        .with_context(|| format!("invalid model id '{}'", value))?;
    Ok(model == Some(wanted))
}

fn check_os(value: &str) -> Result<bool> {
    let (os, arch) = value
        .split_once('/')
        .with_context(|| format!("expected os/arch, got '{}'", value))?;
    Ok(os == std::env::consts::OS && arch == std::env::consts::ARCH)
}

/// Host name of this machine, `localhost` when it cannot be read
pub fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/proc/sys/kernel/hostname").ok())
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
