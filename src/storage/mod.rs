//! Storage Layer
//!
//! Handles data persistence: JSON config, the settings store and the
//! first-run marker.

pub mod config;
pub mod settings;

pub use config::*;
pub use settings::*;
