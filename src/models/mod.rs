//! Data Models
//!
//! Serializable configuration types.

pub mod settings;

pub use settings::{AppConfig, SettingsUpdate};
