//! Kiln Orchestrator
//!
//! HTTP API and background loops coordinating the job queue, the worker
//! registry and the hatcheries.

pub mod api;
pub mod config;
pub mod db;
pub mod repository;
pub mod service;
pub mod shutdown;
pub mod state;
