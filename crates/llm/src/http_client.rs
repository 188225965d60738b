//! HTTP Client Factory
//!
//! Provides a factory function for building pooled reqwest clients with the
//! per-call ceilings used by the backend transport and telemetry.

use std::time::Duration;

use crate::types::{LlmError, LlmResult};

/// Idle connections kept per backend host.
const POOL_MAX_IDLE_PER_HOST: usize = 4;

/// How long an idle pooled connection is kept.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Build a `reqwest::Client` with connection pooling and timeouts.
///
/// `timeout` bounds the whole request, `connect_timeout` only the TCP/TLS
/// handshake.
pub fn build_http_client(timeout: Duration, connect_timeout: Duration) -> LlmResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(connect_timeout)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .build()
        .map_err(|e| LlmError::Other {
            message: format!("failed to build HTTP client: {}", e),
        })
}
