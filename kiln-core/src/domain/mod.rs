//! Core domain types
//!
//! These types represent the entities the dispatch subsystem coordinates.
//! They are shared between the orchestrator (which persists them), the
//! workers (which execute jobs) and the hatcheries (which provision workers).

pub mod hatchery;
pub mod job;
pub mod log;
pub mod requirement;
pub mod worker;
