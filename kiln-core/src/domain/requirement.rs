//! Requirement domain types
//!
//! A job declares requirements; a worker must satisfy every one of them
//! before it may claim the job.

use serde::{Deserialize, Serialize};

/// A capability a job demands from the worker that runs it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Requirement {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RequirementType,
    pub value: String,
}

impl Requirement {
    pub fn new(name: impl Into<String>, kind: RequirementType, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            value: value.into(),
        }
    }
}

/// Closed set of requirement kinds, each with its own check strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequirementType {
    /// An executable reachable through `PATH`
    Binary,
    /// A `host:port` that accepts TCP connections
    Network,
    /// The worker host name
    Hostname,
    /// A plugin file installed in the worker plugin directory
    Plugin,
    /// The worker model id
    Model,
    /// A side service provisioned next to the worker by the hatchery
    Service,
    /// Memory size, satisfied by the hatchery when choosing an instance
    Memory,
    /// `os/arch` pair such as `linux/x86_64`
    Os,
}

impl std::fmt::Display for RequirementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RequirementType::Binary => "binary",
            RequirementType::Network => "network",
            RequirementType::Hostname => "hostname",
            RequirementType::Plugin => "plugin",
            RequirementType::Model => "model",
            RequirementType::Service => "service",
            RequirementType::Memory => "memory",
            RequirementType::Os => "os",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requirement_serializes_type_field() {
        let req = Requirement::new("git", RequirementType::Binary, "git");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "binary");
        assert_eq!(json["value"], "git");
    }
}
