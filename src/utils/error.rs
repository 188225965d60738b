//! Error Handling
//!
//! Application-level error type for the QueryGIS desktop core.
//! Lower layers keep their own error enums and convert into this one.

use thiserror::Error;

use query_gis_core::CoreError;
use query_gis_llm::LlmError;
use query_gis_tools::SandboxError;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persisted settings (API key, first-run marker) errors
    #[error("Settings error: {0}")]
    Settings(String),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend transport errors
    #[error("{0}")]
    Backend(#[from] LlmError),

    /// Host project / session errors
    #[error("{0}")]
    Core(#[from] CoreError),

    /// Script execution machinery errors
    #[error("{0}")]
    Sandbox(#[from] SandboxError),

    /// Validation errors (empty query, missing API key)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation superseded or cancelled by the user
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a settings error
    pub fn settings(msg: impl Into<String>) -> Self {
        Self::Settings(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Convert AppError to a string for display in the transcript
impl From<AppError> for String {
    fn from(err: AppError) -> String {
        err.to_string()
    }
}
