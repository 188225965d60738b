//! Backend Transport
//!
//! One outbound POST per call to the fixed chat or fix endpoint.
//!
//! - Pooled `reqwest` client with a per-call ceiling
//! - Up to `max_attempts` tries for 502/503/504, connection failures and
//!   timeouts; every other failure is returned immediately
//! - Cooperative cancellation checked before each step and raced against
//!   the in-flight request
//!
//! Transport retries are independent of attempt escalation, which reacts to
//! application-level failures only.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use query_gis_core::{ProgressEvent, ProgressSink};

use crate::http_client::build_http_client;
use crate::response::extract_payload_text;
use crate::types::{parse_http_error, ChatPayload, FixPayload, FixReply, LlmError, LlmResult};

/// Default chat endpoint
pub const DEFAULT_CHAT_URL: &str = "https://www.querygis.com/chat";

/// Default fix endpoint
pub const DEFAULT_FIX_URL: &str = "https://www.querygis.com/fix";

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub chat_url: String,
    pub fix_url: String,
    /// Ceiling for one chat call.
    pub request_timeout: Duration,
    /// Ceiling for one fix call.
    pub fix_timeout: Duration,
    pub connect_timeout: Duration,
    /// Total tries per call for transient failures.
    pub max_attempts: u32,
    /// Pause between transient retries.
    pub retry_delay: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            chat_url: DEFAULT_CHAT_URL.to_string(),
            fix_url: DEFAULT_FIX_URL.to_string(),
            request_timeout: Duration::from_secs(120),
            fix_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(10),
            max_attempts: 2,
            retry_delay: Duration::from_millis(500),
        }
    }
}

impl TransportSettings {
    /// Check that both endpoints are absolute http(s) URLs.
    pub fn validate(&self) -> LlmResult<()> {
        for endpoint in [&self.chat_url, &self.fix_url] {
            let parsed = url::Url::parse(endpoint).map_err(|e| LlmError::InvalidRequest {
                message: format!("invalid endpoint '{}': {}", endpoint, e),
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(LlmError::InvalidRequest {
                    message: format!("endpoint '{}' must use http or https", endpoint),
                });
            }
        }
        if self.max_attempts == 0 {
            return Err(LlmError::InvalidRequest {
                message: "max_attempts must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// The two backend calls the orchestrator makes.
#[async_trait]
pub trait BackendTransport: Send + Sync {
    /// Send a chat payload and return the raw reply body.
    async fn send_chat(
        &self,
        payload: &ChatPayload,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> LlmResult<String>;

    /// Ask the fix endpoint to patch broken code.
    async fn request_fix(&self, payload: &FixPayload) -> LlmResult<FixReply>;
}

/// `BackendTransport` over HTTPS.
pub struct HttpBackend {
    settings: TransportSettings,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(settings: TransportSettings) -> LlmResult<Self> {
        settings.validate()?;
        let ceiling = settings.request_timeout.max(settings.fix_timeout);
        let client = build_http_client(ceiling, settings.connect_timeout)?;
        Ok(Self { settings, client })
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    async fn post_once<B: Serialize + Sync + ?Sized>(
        &self,
        url: &str,
        body: &B,
        timeout: Duration,
    ) -> LlmResult<String> {
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| map_request_error(e, url))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| map_request_error(e, url))?;

        if !status.is_success() {
            return Err(parse_http_error(status.as_u16(), &text));
        }
        Ok(text)
    }

    async fn post_with_retry<B: Serialize + Sync + ?Sized>(
        &self,
        url: &str,
        body: &B,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> LlmResult<String> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(LlmError::Cancelled);
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => Err(LlmError::Cancelled),
                r = self.post_once(url, body, timeout) => r,
            };

            match result {
                Err(e) if e.is_transient() && attempt < self.settings.max_attempts => {
                    tracing::warn!(
                        "[Transport] attempt {}/{} to {} failed, retrying: {}",
                        attempt,
                        self.settings.max_attempts,
                        url,
                        e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                        _ = tokio::time::sleep(self.settings.retry_delay) => {}
                    }
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl BackendTransport for HttpBackend {
    async fn send_chat(
        &self,
        payload: &ChatPayload,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> LlmResult<String> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        progress.emit(ProgressEvent::Connecting);
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        progress.emit(ProgressEvent::Sending);

        tracing::info!(
            "[Transport] POST {} (mode={}, context={} chars)",
            self.settings.chat_url,
            payload.mode,
            payload.context.len()
        );
        let body = self
            .post_with_retry(
                &self.settings.chat_url,
                payload,
                self.settings.request_timeout,
                cancel,
            )
            .await?;

        progress.emit(ProgressEvent::Processing);
        Ok(body)
    }

    async fn request_fix(&self, payload: &FixPayload) -> LlmResult<FixReply> {
        tracing::info!(
            "[Transport] POST {} (thinking={:?}, code={} chars)",
            self.settings.fix_url,
            payload.thinking_level,
            payload.broken_code.len()
        );
        let body = self
            .post_with_retry(
                &self.settings.fix_url,
                payload,
                self.settings.fix_timeout,
                &CancellationToken::new(),
            )
            .await?;
        parse_fix_reply(&body)
    }
}

/// Interpret a fix endpoint body: `{output:{text}, token_count?}`, legacy
/// text fields, or raw text.
pub fn parse_fix_reply(body: &str) -> LlmResult<FixReply> {
    let (text, token_count) = match serde_json::from_str::<Value>(body) {
        Ok(data @ Value::Object(_)) => {
            let text = extract_payload_text(&data).ok_or_else(|| LlmError::ParseError {
                message: "fix response carries no text".to_string(),
            })?;
            (text, data.get("token_count").and_then(Value::as_u64))
        }
        _ => (body.to_string(), None),
    };

    if text.trim().is_empty() {
        return Err(LlmError::ParseError {
            message: "fix response is empty".to_string(),
        });
    }
    Ok(FixReply { text, token_count })
}

fn map_request_error(err: reqwest::Error, url: &str) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout {
            message: "Request timeout - server did not respond in time".to_string(),
        }
    } else if err.is_connect() {
        LlmError::NetworkError {
            message: format!("Cannot connect to backend server at {}", url),
        }
    } else if err.is_decode() || err.is_body() {
        LlmError::ParseError {
            message: err.to_string(),
        }
    } else {
        LlmError::NetworkError {
            message: err.to_string(),
        }
    }
}
