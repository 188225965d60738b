//! QueryGIS Core
//!
//! Foundational types for the QueryGIS Desktop workspace. This crate has no
//! dependencies on the transport, the script runtime or the shell.
//!
//! ## Module Organization
//!
//! - `error` - Core error types (`CoreError`, `CoreResult`)
//! - `session` - Per-query attempt state (`QuerySession`, `ExecutionMode`)
//! - `transcript` - Append-only chat transcript (`Transcript`, `ChatRole`)
//! - `progress` - Progress events and sinks (`ProgressEvent`, `ProgressSink`)
//! - `host` - Host project capability trait (`HostProject`, `InMemoryProject`)

pub mod error;
pub mod host;
pub mod progress;
pub mod session;
pub mod transcript;

// ── Error Types ────────────────────────────────────────────────────────
pub use error::{CoreError, CoreResult};

// ── Session & Transcript ───────────────────────────────────────────────
pub use session::{ExecutionMode, QuerySession, MAX_ATTEMPTS, MAX_TOOL_FOLLOWUPS};
pub use transcript::{ChatRole, Transcript, TranscriptEntry};

// ── Progress ───────────────────────────────────────────────────────────
pub use progress::{ChannelProgress, CollectingProgress, NullProgress, ProgressEvent, ProgressSink};

// ── Host Capabilities ──────────────────────────────────────────────────
pub use host::{
    FeatureRow, FieldInfo, HostProject, InMemoryProject, LayerInfo, LayerKind, ProjectSnapshot,
};
