//! Background loops
//!
//! - the queue dispatcher consumes queue entries and republishes them as
//!   [`QueueEvent::Queued`] notifications for hatcheries
//! - the requirement cache loader rebuilds the set of models Waiting jobs ask for

use kiln_cache::StoreExt;
use kiln_core::dto::queue::{QueueEntry, QueueEvent, keys};
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;

use crate::state::AppState;

/// Consume `queue:jobs` until `token` is cancelled
pub async fn run_dispatcher(state: AppState, token: CancellationToken) {
    tracing::info!("Queue dispatcher started");

    while let Some(entry) = state
        .store
        .dequeue_with_cancellation::<QueueEntry>(&token, keys::JOBS)
        .await
    {
        dispatch(&state, entry).await;
    }

    tracing::info!("Queue dispatcher stopped");
}

async fn dispatch(state: &AppState, entry: QueueEntry) {
    let job = match state.jobs.find_by_id(entry.job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            tracing::debug!("Dropping queue entry of purged job {}", entry.job_id);
            return;
        }
        Err(e) => {
            tracing::error!("Cannot load queued job {}: {}", entry.job_id, e);
            return;
        }
    };

    tracing::debug!(
        "Dispatching job {} queued at {}",
        job.id,
        entry.queued_at
    );
    state
        .store
        .publish(
            keys::EVENTS,
            &QueueEvent::Queued {
                job_id: job.id,
                model: job.model,
            },
        )
        .await;
}

/// Rebuild `requirements:models` every interval until `token` is cancelled
pub async fn run_requirement_cache(state: AppState, token: CancellationToken) {
    let mut ticker = tokio::time::interval(state.config.requirement_cache_interval);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = reload_required_models(&state).await {
                    tracing::warn!("Cannot reload requirement cache: {}", e);
                }
            }
        }
    }

    tracing::info!("Requirement cache loader stopped");
}

/// Replace the required-models set with the models of the Waiting jobs
pub async fn reload_required_models(state: &AppState) -> anyhow::Result<()> {
    let jobs = state.jobs.list_waiting(None).await?;
    let models: BTreeSet<i64> = jobs.iter().filter_map(|job| job.model).collect();

    // Sets cannot lose members: rebuild from scratch
    state.store.delete(keys::REQUIRED_MODELS).await?;
    for model in &models {
        state
            .store
            .set_add(keys::REQUIRED_MODELS, &model.to_string(), model)
            .await;
    }

    tracing::debug!("Requirement cache reloaded: {} models", models.len());

    Ok(())
}
