//! QueryGIS LLM
//!
//! Everything that talks to the QueryGIS backend:
//! - Chat and fix payloads, and the transport error taxonomy (`types`)
//! - Pooled HTTP client factory (`http_client`)
//! - Chat/fix transport with transient retry and cancellation (`transport`)
//! - Reply parsing into prose, code blocks and tool requests (`response`)
//! - Masked, fire-and-forget failure telemetry (`telemetry`)

pub mod http_client;
pub mod response;
pub mod telemetry;
pub mod transport;
pub mod types;

pub use http_client::build_http_client;
pub use response::{
    extract_code_blocks, extract_non_code_text, extract_payload_text, parse_backend_response,
    ParsedResponse, ToolRequest,
};
pub use telemetry::{
    mask_sensitive, TelemetryEvent, TelemetryPhase, TelemetryReporter, TelemetrySettings,
};
pub use transport::{
    parse_fix_reply, BackendTransport, HttpBackend, TransportSettings, DEFAULT_CHAT_URL,
    DEFAULT_FIX_URL,
};
pub use types::*;
