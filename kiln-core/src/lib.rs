//! Kiln Core
//!
//! Core types shared by every Kiln process.
//!
//! This crate contains:
//! - Domain types: jobs, requirements, workers, hatcheries, logs
//! - DTOs: request/response bodies exchanged with the orchestrator

pub mod domain;
pub mod dto;
