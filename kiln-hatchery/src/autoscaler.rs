//! Autoscaling loop
//!
//! One [`Autoscaler`] drives a hatchery: it announces itself in the shared
//! store, keeps a heartbeat key alive, spawns one booked worker per unserved
//! job and reaps workers that stopped beating.

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use kiln_cache::{Store, StoreExt, Subscription};
use kiln_client::OrchestratorClient;
use kiln_core::domain::hatchery::Hatchery;
use kiln_core::dto::hatchery::{HatcheryBeat, keys};
use kiln_core::dto::queue::{BookForm, QueueEvent, keys as queue_keys};
use std::sync::Arc;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::planner::{SpawnPlan, plan_spawns};
use crate::provisioner::{Provisioner, SpawnRequest};

pub struct Autoscaler {
    config: Config,
    client: OrchestratorClient,
    store: Arc<dyn Store>,
    provisioner: Arc<dyn Provisioner>,
    identity: Hatchery,
}

impl Autoscaler {
    /// The hatchery id is its name, so a restarted hatchery reaps the
    /// workers of its previous life.
    pub fn new(config: Config, store: Arc<dyn Store>, provisioner: Arc<dyn Provisioner>) -> Self {
        let identity = Hatchery {
            id: config.name.clone(),
            name: config.name.clone(),
            models: config.models.clone(),
            requirement_types: config.requirement_types.clone(),
            max_workers: config.max_workers,
            registered_at: Utc::now(),
        };

        Self {
            client: OrchestratorClient::new(config.api_url.clone()),
            config,
            store,
            provisioner,
            identity,
        }
    }

    pub fn identity(&self) -> &Hatchery {
        &self.identity
    }

    // =============================================================================
    // Hatchery registry
    // =============================================================================

    pub async fn announce(&self) {
        self.store
            .set_add(keys::HATCHERIES, &self.identity.id, &self.identity)
            .await;
        info!("Hatchery {} announced", self.identity.id);
    }

    pub async fn beat(&self) {
        let workers = match self.provisioner.list().await {
            Ok(instances) => instances.len(),
            Err(e) => {
                warn!("Cannot list instances: {:#}", e);
                0
            }
        };
        let beat = HatcheryBeat {
            at: Utc::now(),
            workers,
        };

        self.store
            .set(
                &keys::beat(&self.identity.id),
                &beat,
                Some(self.config.heartbeat_interval * 3),
            )
            .await;
    }

    // =============================================================================
    // Provisioning
    // =============================================================================

    /// Runs one provisioning pass, returns how many workers were spawned
    pub async fn provision_once(&self) -> Result<usize> {
        let jobs = self
            .client
            .list_queue(None)
            .await
            .context("Cannot list queue")?;
        let workers = self
            .client
            .list_workers()
            .await
            .context("Cannot list workers")?;
        let instances = self.provisioner.list().await?;

        let plans = plan_spawns(
            &self.identity,
            &jobs,
            &workers,
            &instances,
            self.config.max_concurrent_provisioning,
            Utc::now(),
        );
        if plans.is_empty() {
            return Ok(0);
        }
        debug!("Provisioning {} workers", plans.len());

        let spawned = join_all(plans.into_iter().map(|plan| self.provision(plan)))
            .await
            .into_iter()
            .filter(|spawned| *spawned)
            .count();

        Ok(spawned)
    }

    /// Books the job for a fresh worker name, then spawns that worker
    async fn provision(&self, plan: SpawnPlan) -> bool {
        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!("{}-{}", self.config.name, &suffix[..8]);

        let form = BookForm {
            worker_name: name.clone(),
            hatchery_id: self.identity.id.clone(),
            ttl_secs: self.config.booking_ttl.as_secs(),
        };
        match self.client.book_job(plan.job_id, &form).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                debug!("Job {} already booked, skipping", plan.job_id);
                return false;
            }
            Err(e) if e.is_not_found() || e.is_gone() => {
                debug!("Job {} left the queue, skipping", plan.job_id);
                return false;
            }
            Err(e) => {
                warn!("Cannot book job {}: {}", plan.job_id, e);
                return false;
            }
        }

        let request = SpawnRequest {
            name,
            model: plan.model,
            booked_job_id: Some(plan.job_id),
            hatchery_id: self.identity.id.clone(),
            ttl_minutes: self.config.worker_ttl_minutes(),
        };
        match self.provisioner.spawn(request).await {
            Ok(instance) => {
                info!("Worker {} spawned for job {}", instance.name, plan.job_id);
                true
            }
            Err(e) => {
                // The booking lapses on its own
                error!("Cannot spawn worker for job {}: {:#}", plan.job_id, e);
                false
            }
        }
    }

    // =============================================================================
    // Reaper
    // =============================================================================

    /// Runs one reaper pass, returns how many instances were stopped
    pub async fn reap_once(&self) -> Result<usize> {
        let now = Utc::now();
        let workers = self
            .client
            .list_workers()
            .await
            .context("Cannot list workers")?;
        let ours: Vec<_> = workers
            .iter()
            .filter(|w| w.hatchery_id.as_deref() == Some(self.identity.id.as_str()))
            .collect();

        let mut reaped = 0;
        for worker in ours.iter().filter(|w| w.is_dead(now)) {
            info!(
                "Reaping worker {} ({}), last beat at {}",
                worker.name, worker.id, worker.last_beat
            );
            match self.client.delete_worker(&worker.id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("Cannot delete worker {}: {}", worker.id, e),
            }
            if let Err(e) = self.provisioner.kill(&worker.name).await {
                warn!("{:#}", e);
            }
            reaped += 1;
        }

        let instances = self.provisioner.list().await?;
        for instance in instances {
            let registered = ours.iter().any(|w| w.name == instance.name);
            let past_grace = (now - instance.spawned_at)
                .to_std()
                .is_ok_and(|age| age > self.config.orphan_grace);
            if registered || !past_grace {
                continue;
            }

            warn!("Worker {} never registered, killing it", instance.name);
            if let Err(e) = self.provisioner.kill(&instance.name).await {
                warn!("{:#}", e);
            }
            reaped += 1;
        }

        Ok(reaped)
    }

    // =============================================================================
    // Main loop
    // =============================================================================

    /// Runs until `token` is cancelled, then stops every instance
    pub async fn run(&self, token: CancellationToken) {
        self.announce().await;
        self.beat().await;

        let mut events = match self.store.subscribe(queue_keys::EVENTS).await {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                warn!("Cannot subscribe to queue events, polling only: {}", e);
                None
            }
        };

        let mut beat_tick = interval(self.config.heartbeat_interval);
        let mut provision_tick = interval(self.config.provision_interval);
        let mut reap_tick = interval(self.config.reap_interval);
        for ticker in [&mut beat_tick, &mut provision_tick, &mut reap_tick] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = beat_tick.tick() => self.beat().await,
                _ = provision_tick.tick() => self.provision_pass().await,
                _ = reap_tick.tick() => {
                    if let Err(e) = self.reap_once().await {
                        warn!("Reaper pass failed: {:#}", e);
                    }
                }
                event = next_event(&mut events, &token) => match event {
                    Some(QueueEvent::Queued { job_id, .. }) => {
                        debug!("Job {} queued, provisioning early", job_id);
                        self.provision_pass().await;
                    }
                    Some(_) => {}
                    None => events = None,
                }
            }
        }

        self.shutdown().await;
    }

    async fn provision_pass(&self) {
        match self.provision_once().await {
            Ok(0) => {}
            Ok(spawned) => info!("Spawned {} workers", spawned),
            Err(e) => warn!("Provisioning pass failed: {:#}", e),
        }
    }

    async fn shutdown(&self) {
        let instances = match self.provisioner.list().await {
            Ok(instances) => instances,
            Err(e) => {
                warn!("Cannot list instances: {:#}", e);
                return;
            }
        };

        info!("Stopping {} workers", instances.len());
        for instance in instances {
            if let Err(e) = self.provisioner.kill(&instance.name).await {
                warn!("{:#}", e);
            }
        }
    }
}

/// Next queue event, pending forever once the subscription is gone
async fn next_event(
    events: &mut Option<Subscription>,
    token: &CancellationToken,
) -> Option<QueueEvent> {
    match events {
        Some(subscription) => subscription.next::<QueueEvent>(token).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioner::WorkerInstance;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration};
    use kiln_cache::LocalStore;
    use kiln_core::domain::job::{Action, Job, JobId, JobStatus};
    use kiln_core::domain::worker::{Worker, WorkerStatus};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct FakeProvisioner {
        instances: Mutex<Vec<WorkerInstance>>,
        spawned: Mutex<Vec<SpawnRequest>>,
        killed: Mutex<Vec<String>>,
    }

    impl FakeProvisioner {
        fn with_instance(self, name: &str, spawned_at: DateTime<Utc>) -> Self {
            self.instances.lock().unwrap().push(WorkerInstance {
                name: name.to_string(),
                model: None,
                booked_job_id: None,
                spawned_at,
            });
            self
        }

        fn killed(&self) -> Vec<String> {
            let mut killed = self.killed.lock().unwrap().clone();
            killed.sort();
            killed
        }
    }

    #[async_trait]
    impl Provisioner for FakeProvisioner {
        async fn spawn(&self, request: SpawnRequest) -> Result<WorkerInstance> {
            let instance = WorkerInstance {
                name: request.name.clone(),
                model: request.model,
                booked_job_id: request.booked_job_id,
                spawned_at: Utc::now(),
            };
            self.instances.lock().unwrap().push(instance.clone());
            self.spawned.lock().unwrap().push(request);
            Ok(instance)
        }

        async fn kill(&self, name: &str) -> Result<()> {
            self.instances.lock().unwrap().retain(|i| i.name != name);
            self.killed.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn list(&self) -> Result<Vec<WorkerInstance>> {
            Ok(self.instances.lock().unwrap().clone())
        }
    }

    fn config(server: &MockServer) -> Config {
        let mut config = Config::new(server.uri(), "secret", "h1");
        config.models = vec![1];
        config
    }

    fn job(id: JobId) -> Job {
        Job {
            id,
            run_id: 1,
            action: Action {
                name: "build".to_string(),
                steps: vec![],
            },
            requirements: vec![],
            status: JobStatus::Waiting,
            worker_id: None,
            booked_by: None,
            model: None,
            parameters: HashMap::new(),
            queued_at: Utc::now() - Duration::seconds(60 - id),
            started_at: None,
            done_at: None,
        }
    }

    fn worker(id: &str, hatchery: &str, last_beat: DateTime<Utc>) -> Worker {
        Worker {
            id: id.to_string(),
            name: format!("name-{}", id),
            hatchery_id: Some(hatchery.to_string()),
            model: Some(1),
            status: WorkerStatus::Building,
            job_id: None,
            booked_job_id: None,
            ttl_minutes: 10,
            registered_at: last_beat,
            last_beat,
        }
    }

    async fn mount_listing(server: &MockServer, jobs: Vec<Job>, workers: Vec<Worker>) {
        Mock::given(method("GET"))
            .and(path("/queue"))
            .respond_with(ResponseTemplate::new(200).set_body_json(jobs))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/worker"))
            .respond_with(ResponseTemplate::new(200).set_body_json(workers))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_announce_and_beat() {
        let server = MockServer::start().await;
        let store: Arc<dyn Store> = Arc::new(LocalStore::new());
        let provisioner = FakeProvisioner::default().with_instance("w", Utc::now());
        let autoscaler = Autoscaler::new(config(&server), store.clone(), Arc::new(provisioner));

        autoscaler.announce().await;
        autoscaler.announce().await;
        autoscaler.beat().await;

        assert_eq!(store.set_card(keys::HATCHERIES).await.unwrap(), 1);
        let announced: Vec<Hatchery> = store.set_scan(keys::HATCHERIES, 1).await.unwrap();
        assert_eq!(announced[0].models, vec![1]);
        let beat: HatcheryBeat = store.get(&keys::beat("h1")).await.unwrap();
        assert_eq!(beat.workers, 1);
    }

    #[tokio::test]
    async fn test_books_before_spawning_and_skips_conflicts() {
        let server = MockServer::start().await;
        mount_listing(&server, vec![job(1), job(2)], vec![]).await;
        Mock::given(method("POST"))
            .and(path("/queue/1/book"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/queue/2/book"))
            .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
                "error": "already booked"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provisioner = Arc::new(FakeProvisioner::default());
        let autoscaler = Autoscaler::new(
            config(&server),
            Arc::new(LocalStore::new()),
            provisioner.clone(),
        );

        assert_eq!(autoscaler.provision_once().await.unwrap(), 1);

        let spawned = provisioner.spawned.lock().unwrap().clone();
        assert_eq!(spawned.len(), 1);
        assert_eq!(spawned[0].booked_job_id, Some(1));
        assert_eq!(spawned[0].model, Some(1));
        assert_eq!(spawned[0].hatchery_id, "h1");
        assert!(spawned[0].name.starts_with("h1-"));
    }

    #[tokio::test]
    async fn test_full_hatchery_does_not_book() {
        let server = MockServer::start().await;
        mount_listing(&server, vec![job(1)], vec![]).await;
        Mock::given(method("POST"))
            .and(path("/queue/1/book"))
            .respond_with(ResponseTemplate::new(204))
            .expect(0)
            .mount(&server)
            .await;

        let mut provisioner = FakeProvisioner::default();
        for i in 0..4 {
            provisioner = provisioner.with_instance(&format!("w{}", i), Utc::now());
        }
        let autoscaler = Autoscaler::new(
            config(&server),
            Arc::new(LocalStore::new()),
            Arc::new(provisioner),
        );

        assert_eq!(autoscaler.provision_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reaps_dead_workers_and_orphans() {
        let server = MockServer::start().await;
        let now = Utc::now();
        let workers = vec![
            worker("dead", "h1", now - Duration::minutes(20)),
            worker("alive", "h1", now),
            worker("foreign", "h2", now - Duration::minutes(20)),
        ];
        mount_listing(&server, vec![], workers).await;
        Mock::given(method("DELETE"))
            .and(path("/worker/dead"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let provisioner = Arc::new(
            FakeProvisioner::default()
                .with_instance("name-dead", now - Duration::minutes(30))
                .with_instance("name-alive", now - Duration::minutes(30))
                .with_instance("orphan", now - Duration::minutes(5))
                .with_instance("booting", now),
        );
        let autoscaler = Autoscaler::new(
            config(&server),
            Arc::new(LocalStore::new()),
            provisioner.clone(),
        );

        assert_eq!(autoscaler.reap_once().await.unwrap(), 2);
        assert_eq!(provisioner.killed(), vec!["name-dead", "orphan"]);
    }

    #[tokio::test]
    async fn test_run_stops_instances_on_shutdown() {
        let server = MockServer::start().await;
        mount_listing(&server, vec![], vec![]).await;

        let provisioner = Arc::new(FakeProvisioner::default().with_instance("w", Utc::now()));
        let store: Arc<dyn Store> = Arc::new(LocalStore::new());
        let autoscaler = Autoscaler::new(config(&server), store.clone(), provisioner.clone());

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            canceller.cancel();
        });

        tokio::time::timeout(std::time::Duration::from_secs(5), autoscaler.run(token))
            .await
            .unwrap();

        assert_eq!(provisioner.killed(), vec!["w"]);
        assert_eq!(store.set_card(keys::HATCHERIES).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_queued_event_triggers_provisioning() {
        let server = MockServer::start().await;
        mount_listing(&server, vec![job(7)], vec![]).await;
        Mock::given(method("POST"))
            .and(path("/queue/7/book"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let mut config = config(&server);
        config.provision_interval = std::time::Duration::from_secs(3600);
        let provisioner = Arc::new(FakeProvisioner::default());
        let store: Arc<dyn Store> = Arc::new(LocalStore::new());
        let autoscaler = Arc::new(Autoscaler::new(config, store.clone(), provisioner.clone()));

        let token = CancellationToken::new();
        let handle = {
            let autoscaler = autoscaler.clone();
            let token = token.clone();
            tokio::spawn(async move { autoscaler.run(token).await })
        };

        // The first tick provisions job 7; the event must provision again
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        store
            .publish(queue_keys::EVENTS, &QueueEvent::Queued { job_id: 7, model: None })
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(provisioner.spawned.lock().unwrap().len(), 2);
    }
}
