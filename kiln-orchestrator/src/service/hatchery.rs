//! Hatchery Service
//!
//! Hatcheries announce themselves in the store; the orchestrator only reads
//! that bookkeeping back.

use kiln_cache::{StoreError, StoreExt};
use kiln_core::domain::hatchery::{Hatchery, HatcheryStatus};
use kiln_core::dto::hatchery::{HatcheryBeat, keys};
use kiln_core::dto::queue::keys as queue_keys;

use crate::state::AppState;

/// Every hatchery ever announced, with liveness from its heartbeat key
///
/// Demand comes from the required-models cache, so it lags the queue by at
/// most one reload interval.
pub async fn list(state: &AppState) -> Result<Vec<HatcheryStatus>, StoreError> {
    let count = state.store.set_card(keys::HATCHERIES).await?;
    let hatcheries: Vec<Hatchery> = state.store.set_scan(keys::HATCHERIES, count).await?;

    let count = state.store.set_card(queue_keys::REQUIRED_MODELS).await?;
    let required: Vec<i64> = state
        .store
        .set_scan(queue_keys::REQUIRED_MODELS, count)
        .await?;

    let mut statuses = Vec::with_capacity(hatcheries.len());
    for hatchery in hatcheries {
        let beat = state.store.get::<HatcheryBeat>(&keys::beat(&hatchery.id)).await;
        let mut demanded_models: Vec<i64> = hatchery
            .models
            .iter()
            .copied()
            .filter(|model| required.contains(model))
            .collect();
        demanded_models.sort_unstable();
        statuses.push(HatcheryStatus {
            alive: beat.is_some(),
            last_beat: beat.map(|b| b.at),
            demanded_models,
            hatchery,
        });
    }

    Ok(statuses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use chrono::Utc;
    use kiln_cache::LocalStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn hatchery(id: &str) -> Hatchery {
        Hatchery {
            id: id.to_string(),
            name: format!("hatchery-{}", id),
            models: vec![1],
            requirement_types: vec![],
            max_workers: 4,
            registered_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_liveness_follows_beat_key() {
        let state = AppState::in_memory(Arc::new(LocalStore::new()), Config::new("secret"));
        state.store.set_add(keys::HATCHERIES, "a", &hatchery("a")).await;
        state.store.set_add(keys::HATCHERIES, "b", &hatchery("b")).await;
        state
            .store
            .set(
                &keys::beat("a"),
                &HatcheryBeat {
                    at: Utc::now(),
                    workers: 2,
                },
                Some(Duration::from_secs(30)),
            )
            .await;

        let statuses = list(&state).await.unwrap();
        assert_eq!(statuses.len(), 2);
        let a = statuses.iter().find(|s| s.hatchery.id == "a").unwrap();
        let b = statuses.iter().find(|s| s.hatchery.id == "b").unwrap();
        assert!(a.alive);
        assert!(!b.alive);
        assert!(b.last_beat.is_none());
    }

    #[tokio::test]
    async fn test_demand_comes_from_required_models() {
        let state = AppState::in_memory(Arc::new(LocalStore::new()), Config::new("secret"));
        let mut offering = hatchery("a");
        offering.models = vec![3, 1, 2];
        state.store.set_add(keys::HATCHERIES, "a", &offering).await;
        state.store.set_add(queue_keys::REQUIRED_MODELS, "2", &2i64).await;
        state.store.set_add(queue_keys::REQUIRED_MODELS, "3", &3i64).await;
        state.store.set_add(queue_keys::REQUIRED_MODELS, "9", &9i64).await;

        let statuses = list(&state).await.unwrap();
        assert_eq!(statuses[0].demanded_models, vec![2, 3]);
    }
}
