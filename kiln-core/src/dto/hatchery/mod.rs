//! Hatchery DTOs

use serde::{Deserialize, Serialize};

/// Store keys shared by hatcheries and their observers
pub mod keys {
    /// Set of every hatchery that ever announced itself
    pub const HATCHERIES: &str = "hatcheries";

    /// Heartbeat key of one hatchery, expires when beats stop
    pub fn beat(hatchery_id: &str) -> String {
        format!("hatchery:{}:beat", hatchery_id)
    }
}

/// Heartbeat value written by a hatchery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HatcheryBeat {
    pub at: chrono::DateTime<chrono::Utc>,
    /// Workers currently provisioned by the hatchery
    pub workers: usize,
}
