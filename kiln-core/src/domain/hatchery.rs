//! Hatchery domain model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::requirement::RequirementType;

/// A long-lived process that provisions workers on demand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hatchery {
    pub id: String,
    pub name: String,
    /// Worker models this hatchery can spawn
    pub models: Vec<i64>,
    /// Requirement kinds its workers can satisfy
    pub requirement_types: Vec<RequirementType>,
    /// Spawn ceiling
    pub max_workers: usize,
    pub registered_at: DateTime<Utc>,
}

/// Hatchery as seen by observers, with its liveness
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HatcheryStatus {
    pub hatchery: Hatchery,
    pub last_beat: Option<DateTime<Utc>>,
    /// False once heartbeats stop; such a hatchery is not spawn-eligible
    pub alive: bool,
    /// Models of this hatchery that Waiting jobs currently ask for
    #[serde(default)]
    pub demanded_models: Vec<i64>,
}
