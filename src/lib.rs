//! QueryGIS Desktop - Rust Backend Library
//!
//! This library provides the backend of the QueryGIS assistant: a
//! natural-language query goes to the LLM backend, the returned code runs
//! against the loaded GIS project, and failures are corrected or escalated.
//! It includes:
//! - Business logic services (context, worker, escalation, correction,
//!   orchestrator)
//! - Storage layer (JSON config, settings store, first-run marker)
//! - Data models and utilities

pub mod models;
pub mod services;
pub mod storage;
pub mod utils;

pub use models::settings::{AppConfig, SettingsUpdate};
pub use services::{QueryOrchestrator, QueryOutcome, QueryStatus};
pub use storage::{ConfigService, FirstRunMarker, SettingsStore};
pub use utils::error::{AppError, AppResult};
