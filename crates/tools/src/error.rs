//! Sandbox Error Types

use thiserror::Error;

/// Failures of the execution machinery itself.
///
/// A script that raises is not a `SandboxError`; it is a failed
/// `ExecutionOutcome`. These errors mean the script could not be run or
/// observed at all.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Failed to start script runtime: {0}")]
    Spawn(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Script timed out after {0} seconds")]
    Timeout(u64),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Layer '{name}' not found. Available layers: {}", available.join(", "))]
    LayerNotFound { name: String, available: Vec<String> },
}

impl SandboxError {
    pub fn spawn(msg: impl Into<String>) -> Self {
        Self::Spawn(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;
