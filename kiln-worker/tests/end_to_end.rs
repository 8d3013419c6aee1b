//! A worker session against a real in-memory orchestrator

use kiln_cache::LocalStore;
use kiln_client::OrchestratorClient;
use kiln_core::domain::job::{Action, JobStatus, Step, StepStatus};
use kiln_core::dto::job::NewJob;
use kiln_orchestrator::config::Config as OrchestratorConfig;
use kiln_orchestrator::repository::{MemoryJobRepository, MemoryLogRepository, MemoryWorkerRepository};
use kiln_orchestrator::{api, state::AppState};
use kiln_worker::executor::ShellStepRunner;
use kiln_worker::{Agent, Config, ExitReason};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TOKEN: &str = "secret";

#[tokio::test]
async fn test_single_use_worker_builds_job() {
    let jobs = Arc::new(MemoryJobRepository::new());
    let logs = Arc::new(MemoryLogRepository::new());
    let state = AppState::new(
        jobs.clone(),
        Arc::new(MemoryWorkerRepository::new()),
        logs.clone(),
        Arc::new(LocalStore::new()),
        OrchestratorConfig::new(TOKEN),
    );
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = OrchestratorClient::new(&base_url);
    let job = client
        .enqueue_job(&NewJob {
            run_id: 1,
            action: Action {
                name: "build".to_string(),
                steps: vec![Step {
                    name: "hello".to_string(),
                    script: "echo hello from $KILN_PARAM_TARGET".to_string(),
                    timeout_secs: Some(30),
                    optional: false,
                }],
            },
            requirements: vec![],
            model: None,
            parameters: HashMap::from([("target".to_string(), serde_json::json!("kiln"))]),
            secrets: HashMap::new(),
        })
        .await
        .unwrap();

    let mut config = Config::new(&base_url, TOKEN, "e2e-worker");
    config.single_use = true;
    config.poll_interval = Duration::from_millis(50);
    config.log_send_interval = Duration::from_millis(20);
    config.basedir = std::env::temp_dir().join(format!("kiln-e2e-{}", uuid::Uuid::new_v4()));

    let agent = Agent::new(config, Arc::new(ShellStepRunner));
    let reason = tokio::time::timeout(Duration::from_secs(30), agent.run(CancellationToken::new()))
        .await
        .unwrap();

    assert_eq!(reason, ExitReason::SingleUse);
    assert_eq!(jobs.claim_count(), 1);

    let done = client.get_job(job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Success);

    let result = jobs.result_of(job.id).unwrap();
    assert_eq!(result.steps.len(), 1);
    assert_eq!(result.steps[0].status, StepStatus::Success);
    assert!(result.log_lines >= 1);

    // The worker unregistered on its way out
    assert!(client.list_workers().await.unwrap().is_empty());
}
