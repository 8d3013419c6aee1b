//! Worker provisioning backends
//!
//! A [`Provisioner`] starts and stops worker instances. The shipped backend
//! runs workers as local child processes.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_core::domain::job::JobId;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// What a new worker is started with
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnRequest {
    pub name: String,
    pub model: Option<i64>,
    pub booked_job_id: Option<JobId>,
    pub hatchery_id: String,
    pub ttl_minutes: u32,
}

/// A running worker instance
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerInstance {
    pub name: String,
    pub model: Option<i64>,
    pub booked_job_id: Option<JobId>,
    pub spawned_at: DateTime<Utc>,
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn spawn(&self, request: SpawnRequest) -> Result<WorkerInstance>;

    /// Stops an instance; unknown names are ignored
    async fn kill(&self, name: &str) -> Result<()>;

    /// Instances still running
    async fn list(&self) -> Result<Vec<WorkerInstance>>;
}

// =============================================================================
// Local processes
// =============================================================================

/// Spawns `kiln-worker` child processes on this machine
pub struct ProcessProvisioner {
    binary: PathBuf,
    args: Vec<String>,
    api_url: String,
    token: String,
    children: Mutex<HashMap<String, (Child, WorkerInstance)>>,
}

impl ProcessProvisioner {
    pub fn new(binary: PathBuf, api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            binary,
            args: Vec::new(),
            api_url: api_url.into(),
            token: token.into(),
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Extra arguments passed to every spawned worker
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, (Child, WorkerInstance)>> {
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn command(&self, request: &SpawnRequest) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .args(&self.args)
            .env("KILN_API", &self.api_url)
            .env("KILN_TOKEN", &self.token)
            .env("KILN_NAME", &request.name)
            .env("KILN_HATCHERY", &request.hatchery_id)
            .env("KILN_TTL", request.ttl_minutes.to_string())
            .env("KILN_SINGLE_USE", "true")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(model) = request.model {
            command.env("KILN_MODEL", model.to_string());
        }
        if let Some(job_id) = request.booked_job_id {
            command.env("KILN_BOOKED_JOB_ID", job_id.to_string());
        }
        command
    }
}

#[async_trait]
impl Provisioner for ProcessProvisioner {
    async fn spawn(&self, request: SpawnRequest) -> Result<WorkerInstance> {
        let child = self
            .command(&request)
            .spawn()
            .with_context(|| format!("Cannot start {}", self.binary.display()))?;

        let instance = WorkerInstance {
            name: request.name.clone(),
            model: request.model,
            booked_job_id: request.booked_job_id,
            spawned_at: Utc::now(),
        };
        info!(
            "Spawned worker {} (pid {:?})",
            instance.name,
            child.id()
        );

        self.lock().insert(request.name, (child, instance.clone()));
        Ok(instance)
    }

    async fn kill(&self, name: &str) -> Result<()> {
        let Some((mut child, _)) = self.lock().remove(name) else {
            debug!("No instance named {}", name);
            return Ok(());
        };

        child
            .kill()
            .await
            .with_context(|| format!("Cannot kill worker {}", name))?;
        info!("Killed worker {}", name);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<WorkerInstance>> {
        let mut children = self.lock();

        children.retain(|name, (child, _)| match child.try_wait() {
            Ok(Some(status)) => {
                debug!("Worker {} exited: {}", name, status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("Cannot poll worker {}: {}", name, e);
                true
            }
        });

        Ok(children.values().map(|(_, instance)| instance.clone()).collect())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn request(name: &str) -> SpawnRequest {
        SpawnRequest {
            name: name.to_string(),
            model: Some(1),
            booked_job_id: Some(5),
            hatchery_id: "h1".to_string(),
            ttl_minutes: 10,
        }
    }

    #[tokio::test]
    async fn test_spawn_list_kill() {
        let provisioner =
            ProcessProvisioner::new(PathBuf::from("sleep"), "http://x", "t").with_args(["30"]);

        let instance = provisioner.spawn(request("w-1")).await.unwrap();
        assert_eq!(instance.booked_job_id, Some(5));
        assert_eq!(provisioner.list().await.unwrap(), vec![instance]);

        provisioner.kill("w-1").await.unwrap();
        assert!(provisioner.list().await.unwrap().is_empty());
        // Killing twice is harmless
        provisioner.kill("w-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_exited_instances_leave_the_list() {
        let provisioner = ProcessProvisioner::new(PathBuf::from("true"), "http://x", "t");
        provisioner.spawn(request("w-2")).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert!(provisioner.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let provisioner =
            ProcessProvisioner::new(PathBuf::from("/nonexistent/kiln-worker"), "http://x", "t");
        assert!(provisioner.spawn(request("w-3")).await.is_err());
        assert!(provisioner.list().await.unwrap().is_empty());
    }
}
