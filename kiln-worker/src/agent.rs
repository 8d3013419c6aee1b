//! Worker agent
//!
//! Registers, then scans the queue every poll interval. A scan evaluates the
//! requirements of each Waiting job (only the booked one while a booking
//! hint is pending), claims the first runnable job, executes it and reports
//! the result. The agent leaves when it stayed idle for its whole TTL, after
//! one job in single-use mode, when disabled, or on shutdown.

use anyhow::Context;
use kiln_client::OrchestratorClient;
use kiln_core::domain::job::{Job, JobResult};
use kiln_core::domain::requirement::Requirement;
use kiln_core::dto::job::JobInfo;
use kiln_core::dto::queue::RequirementError;
use kiln_core::dto::worker::RegisterWorker;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, RetryPolicy};
use crate::executor::{self, StepEnv, StepRunner};
use crate::heartbeat::{HeartbeatSignal, spawn_heartbeat};
use crate::logs::{LogBuffer, flush_and_close, spawn_log_sender};
use crate::report::{ReportOutcome, report_result};
use crate::requirements::{self, CheckContext, Verdict};
use crate::session::{ExitReason, WorkerSession, WorkerState};

enum Attempt {
    /// The claim failed, scanning goes on
    NotTaken,
    /// A job was executed, the cycle ends
    Executed(Option<ExitReason>),
}

pub struct Agent {
    config: Config,
    runner: Arc<dyn StepRunner>,
    checks: CheckContext,
}

impl Agent {
    pub fn new(config: Config, runner: Arc<dyn StepRunner>) -> Self {
        let checks = CheckContext::new(config.model, &config.basedir);
        Self {
            config,
            runner,
            checks,
        }
    }

    /// Runs until the worker has a reason to stop
    pub async fn run(&self, token: CancellationToken) -> ExitReason {
        let client = OrchestratorClient::new(&self.config.api_url);
        let mut session = WorkerSession::new(client, self.config.booked_job_id);
        let (signals_tx, mut signals) = mpsc::unbounded_channel();
        let mut heartbeat: Option<(JoinHandle<()>, CancellationToken)> = None;

        let reason = 'agent: loop {
            while let Ok(signal) = signals.try_recv() {
                match signal {
                    HeartbeatSignal::Lost => {
                        warn!("Disconnected from orchestrator, registering again");
                        session.clear_identity();
                    }
                    HeartbeatSignal::Disabled => break 'agent ExitReason::Disabled,
                }
            }

            if token.is_cancelled() {
                break ExitReason::Shutdown;
            }

            if !session.is_registered() {
                stop_heartbeat(heartbeat.take()).await;

                if let Err(e) = self.register(&mut session).await {
                    warn!("{:#}", e);
                    if sleep_or_cancel(self.config.register_backoff, &token).await {
                        break ExitReason::Shutdown;
                    }
                    continue;
                }

                let heartbeat_token = token.child_token();
                let handle = spawn_heartbeat(
                    session.client.clone(),
                    self.config.heartbeat_interval,
                    signals_tx.clone(),
                    heartbeat_token.clone(),
                );
                heartbeat = Some((handle, heartbeat_token));
            }

            if session.idle_expired(self.config.ttl) {
                info!("Nothing executed within {:?}, time to exit", self.config.ttl);
                break ExitReason::IdleTimeout;
            }

            if let Some(reason) = self.check_queue(&mut session, &token).await {
                break reason;
            }

            if sleep_or_cancel(self.config.poll_interval, &token).await {
                break ExitReason::Shutdown;
            }
        };

        stop_heartbeat(heartbeat.take()).await;
        self.unregister(&mut session).await;
        session.state = WorkerState::Terminated;

        info!("Worker stopped: {:?}", reason);
        reason
    }

    async fn register(&self, session: &mut WorkerSession) -> anyhow::Result<()> {
        info!("Registering on orchestrator {}", self.config.api_url);

        let form = RegisterWorker {
            token: self.config.token.clone(),
            name: self.config.name.clone(),
            model: self.config.model,
            hatchery_id: self.config.hatchery_id.clone(),
            booked_job_id: session.booked_job_id,
            ttl_minutes: self.config.ttl_minutes(),
        };
        let worker = session
            .client
            .register_worker(&form)
            .await
            .context("Cannot register")?;

        info!("Registered as {} ({})", worker.name, worker.id);
        session.registered(worker.id);
        Ok(())
    }

    async fn unregister(&self, session: &mut WorkerSession) {
        if !session.is_registered() {
            return;
        }
        if let Err(e) = session.client.unregister().await {
            warn!("Could not unregister: {}", e);
        }
        session.clear_identity();
    }

    /// One scan of the queue
    ///
    /// A booked job hint restricts the first scan that actually sees the
    /// queue, then is dropped whether or not the booked job was listed.
    async fn check_queue(
        &self,
        session: &mut WorkerSession,
        token: &CancellationToken,
    ) -> Option<ExitReason> {
        let jobs = match session.client.list_queue(None).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("Cannot get build queue: {}", e);
                return None;
            }
        };
        debug!("{} jobs in queue", jobs.len());

        session.state = WorkerState::Checking;
        let booked = session.booked_job_id.take();
        if let Some(id) = booked {
            if !jobs.iter().any(|job| job.id == id) {
                info!("Booked job {} is not in the queue anymore", id);
            }
            debug!("Booked job hint cleared");
        }
        let mut outcome = None;

        for job in &jobs {
            if booked.is_some_and(|id| id != job.id) {
                continue;
            }

            match requirements::evaluate(job, &self.checks).await {
                Verdict::Runnable => {}
                Verdict::Unmet(name) => {
                    debug!("Job {}: requirement {} not met", job.id, name);
                    continue;
                }
                Verdict::Error { requirement, error } => {
                    self.report_requirement_error(session, requirement, error).await;
                    continue;
                }
            }

            match self.take_and_run(session, job, booked == Some(job.id), token).await {
                Attempt::NotTaken => continue,
                Attempt::Executed(reason) => {
                    outcome = reason;
                    break;
                }
            }
        }

        session.state = WorkerState::Waiting;
        outcome
    }

    async fn report_requirement_error(
        &self,
        session: &WorkerSession,
        requirement: Requirement,
        error: String,
    ) {
        warn!(
            "Error checking requirement {} ({}={}): {}",
            requirement.name, requirement.kind, requirement.value, error
        );
        let report = RequirementError {
            name: requirement.name,
            kind: requirement.kind,
            value: requirement.value,
            error,
        };
        if let Err(e) = session.client.post_requirement_error(&report).await {
            warn!("Cannot report requirement error: {}", e);
        }
    }

    async fn take_and_run(
        &self,
        session: &mut WorkerSession,
        job: &Job,
        booked: bool,
        token: &CancellationToken,
    ) -> Attempt {
        let info = match session.client.take_job(job.id, booked.then_some(job.id)).await {
            Ok(info) => info,
            Err(e) if e.is_conflict() => {
                debug!("Job {} already taken", job.id);
                return Attempt::NotTaken;
            }
            Err(e) if e.is_gone() || e.is_not_found() => {
                info!("Job {} is no longer available", job.id);
                return Attempt::NotTaken;
            }
            Err(e) => {
                warn!("Cannot take job {}: {}", job.id, e);
                return Attempt::NotTaken;
            }
        };

        if booked {
            info!("Took job {}, this was my booked job", job.id);
        } else {
            info!("Took job {}", job.id);
        }
        session.jobs_executed += 1;
        session.state = WorkerState::Building;

        let result = self.build(&session.client, &info, token).await;

        let policy = if token.is_cancelled() {
            RetryPolicy {
                attempts: 1,
                ..self.config.result_retry
            }
        } else {
            self.config.result_retry
        };
        let outcome = report_result(&session.client, job.id, &result, policy).await;
        session.state = WorkerState::Waiting;

        match outcome {
            ReportOutcome::JobVanished => Attempt::Executed(Some(ExitReason::JobVanished)),
            ReportOutcome::Sent | ReportOutcome::Abandoned if self.config.single_use => {
                info!("Single-use worker, exiting");
                Attempt::Executed(Some(ExitReason::SingleUse))
            }
            ReportOutcome::Sent | ReportOutcome::Abandoned => Attempt::Executed(None),
        }
    }

    /// Executes a claimed job in its own workspace while streaming logs
    async fn build(
        &self,
        client: &OrchestratorClient,
        info: &JobInfo,
        token: &CancellationToken,
    ) -> JobResult {
        let job_id = info.job.id;
        let workdir = self.config.basedir.join(format!("kiln-job-{}", job_id));
        if let Err(e) = tokio::fs::create_dir_all(&workdir).await {
            return JobResult::failed(format!(
                "Cannot create workspace {}: {}",
                workdir.display(),
                e
            ));
        }

        let logs = LogBuffer::new();
        let sender_token = CancellationToken::new();
        let sender = spawn_log_sender(
            client.clone(),
            job_id,
            logs.clone(),
            self.config.log_send_interval,
            sender_token.clone(),
        );

        let env = StepEnv::for_job(info, workdir.clone(), self.config.step_timeout);
        let result = executor::execute(self.runner.as_ref(), info, &env, &logs, token).await;

        sender_token.cancel();
        if let Err(e) = sender.await {
            warn!("Log sender of job {} panicked: {}", job_id, e);
        }
        flush_and_close(client, job_id, &logs).await;

        if let Err(e) = tokio::fs::remove_dir_all(&workdir).await {
            warn!("Cannot clean workspace {}: {}", workdir.display(), e);
        }

        info!("Job {} finished: {}", job_id, result.status);
        result
    }
}

async fn stop_heartbeat(heartbeat: Option<(JoinHandle<()>, CancellationToken)>) {
    if let Some((handle, token)) = heartbeat {
        token.cancel();
        let _ = handle.await;
    }
}

/// Sleeps for `duration`, returns `true` if cancelled first
async fn sleep_or_cancel(duration: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
