//! Launch orchestrator - record migration and blue/green cutover
//!
//! This library moves records from a legacy store into a new one with
//! verifiable, idempotent bundles, and drives a health-gated traffic cutover
//! between two environments with automatic rollback.

use std::sync::Arc;

pub mod config;
pub mod deployment;
pub mod error;
pub mod handlers;
pub mod infrastructure;
pub mod migration;
pub mod routes;
pub mod services;

// Re-export commonly used types
pub use error::{AppError, Result};

/// Application state shared across control API handlers
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<deployment::RolloutController>,
}
