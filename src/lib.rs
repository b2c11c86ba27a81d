#![forbid(unsafe_code)]

//! Crash-recoverable phase orchestrator for search and content ingestion
//! pipelines.

pub mod app;
pub mod collaborators;
pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod phases;
pub mod resilience;
pub mod scheduler;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
