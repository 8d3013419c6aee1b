//! Spawn planning
//!
//! Decides, from a queue listing and the current fleet, which jobs get a
//! freshly spawned worker this pass. Pure: no I/O, no clock.

use chrono::{DateTime, Utc};
use kiln_core::domain::hatchery::Hatchery;
use kiln_core::domain::job::{Job, JobId, JobStatus};
use kiln_core::domain::requirement::RequirementType;
use kiln_core::domain::worker::{Worker, WorkerStatus};
use std::collections::BTreeMap;

use crate::provisioner::WorkerInstance;

/// One worker to spawn, booked for one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnPlan {
    pub job_id: JobId,
    pub model: Option<i64>,
}

/// Model a job needs from this hatchery
///
/// `Ok(None)` when any worker fits, `Err(())` when the hatchery cannot
/// provide a worker for the job at all.
fn model_for(job: &Job, hatchery: &Hatchery) -> Result<Option<i64>, ()> {
    let mut wanted = job.model;

    for requirement in &job.requirements {
        if !hatchery.requirement_types.contains(&requirement.kind) {
            return Err(());
        }
        if requirement.kind == RequirementType::Model {
            let model = requirement.value.trim().parse::<i64>().map_err(|_| ())?;
            match wanted {
                Some(other) if other != model => return Err(()),
                _ => wanted = Some(model),
            }
        }
    }

    match wanted {
        Some(model) if !hatchery.models.contains(&model) => Err(()),
        Some(model) => Ok(Some(model)),
        None => Ok(hatchery.models.first().copied()),
    }
}

/// Plans the spawns of one provisioning pass
///
/// Waiting jobs nobody holds a live booking on are grouped by the model
/// they need. Idle workers of this hatchery already cover part of each
/// group, unless they are headed for a booked job still in the queue; one worker is planned per remaining job, oldest first, within the
/// free capacity and the per-pass ceiling.
pub fn plan_spawns(
    hatchery: &Hatchery,
    jobs: &[Job],
    workers: &[Worker],
    instances: &[WorkerInstance],
    max_per_pass: usize,
    now: DateTime<Utc>,
) -> Vec<SpawnPlan> {
    let running = instances.len();
    let budget = hatchery
        .max_workers
        .saturating_sub(running)
        .min(max_per_pass);
    if budget == 0 {
        return Vec::new();
    }

    let mut demand: BTreeMap<Option<i64>, Vec<&Job>> = BTreeMap::new();
    for job in jobs {
        if job.status != JobStatus::Waiting || !job.bookable(now) {
            continue;
        }
        match model_for(job, hatchery) {
            Ok(model) => demand.entry(model).or_default().push(job),
            Err(()) => tracing::debug!("Job {} cannot be served by this hatchery", job.id),
        }
    }

    let mut idle: BTreeMap<Option<i64>, usize> = BTreeMap::new();
    for worker in workers {
        let ours = worker.hatchery_id.as_deref() == Some(hatchery.id.as_str());
        let idle_now = matches!(worker.status, WorkerStatus::Waiting | WorkerStatus::Checking);
        let free = worker.booked_job_id.is_none_or(|booked| {
            !jobs
                .iter()
                .any(|job| job.id == booked && job.status == JobStatus::Waiting)
        });
        if ours && idle_now && free && !worker.is_dead(now) {
            *idle.entry(worker.model).or_default() += 1;
        }
    }

    let mut candidates: Vec<SpawnPlan> = Vec::new();
    let mut queued_at = BTreeMap::new();
    for (model, mut group) in demand {
        group.sort_by_key(|job| (job.queued_at, job.id));
        let covered = idle.get(&model).copied().unwrap_or(0);
        for job in group.into_iter().skip(covered) {
            queued_at.insert(job.id, job.queued_at);
            candidates.push(SpawnPlan {
                job_id: job.id,
                model,
            });
        }
    }

    candidates.sort_by_key(|plan| (queued_at.get(&plan.job_id).copied(), plan.job_id));
    candidates.truncate(budget);
    candidates
}
