//! Backend Types
//!
//! Wire payloads for the chat and fix endpoints, and the transport error type.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use query_gis_core::ExecutionMode;

/// Longest slice of an error body quoted back to the user.
const ERROR_BODY_PREVIEW: usize = 300;

// ============================================================================
// Payloads
// ============================================================================

/// Body of a chat request. Built once per attempt and never mutated after
/// it is handed to the transport.
#[derive(Clone, Serialize)]
pub struct ChatPayload {
    pub api_key: String,
    pub context: String,
    pub user_input: String,
    pub model: String,
    pub mode: ExecutionMode,
    /// Local context facets the backend may ask for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_info: Option<String>,
    /// Accumulated failure text carried into an escalated attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// The tool request being answered (tool follow-up mode only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_request: Option<Value>,
    /// Collected facet data answering `tool_request`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_data: Option<Value>,
}

impl std::fmt::Debug for ChatPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatPayload")
            .field("api_key", &"***")
            .field("context_len", &self.context.len())
            .field("user_input", &self.user_input)
            .field("model", &self.model)
            .field("mode", &self.mode)
            .field("has_error_message", &self.error_message.is_some())
            .field("has_tool_data", &self.tool_data.is_some())
            .finish()
    }
}

/// Deliberation budget requested from the fix endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    Low,
    High,
}

impl ThinkingLevel {
    /// Low on the first correction round, high on every later one.
    pub fn for_round(round: u32) -> Self {
        if round == 0 {
            ThinkingLevel::Low
        } else {
            ThinkingLevel::High
        }
    }
}

/// Body of a fix request.
#[derive(Clone, Serialize)]
pub struct FixPayload {
    pub api_key: String,
    pub context: String,
    pub user_input: String,
    pub broken_code: String,
    pub error_message: String,
    pub model: String,
    pub thinking_level: ThinkingLevel,
}

impl std::fmt::Debug for FixPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixPayload")
            .field("api_key", &"***")
            .field("broken_code_len", &self.broken_code.len())
            .field("error_message_len", &self.error_message.len())
            .field("model", &self.model)
            .field("thinking_level", &self.thinking_level)
            .finish()
    }
}

/// Parsed reply of the fix endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixReply {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u64>,
}

// ============================================================================
// Errors
// ============================================================================

/// Transport-level failure of a backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    /// API key rejected
    AuthenticationFailed { message: String },
    /// Backend refused the request body
    InvalidRequest { message: String },
    /// Non-2xx reply
    ServerError { message: String, status: Option<u16> },
    /// Could not reach the backend
    NetworkError { message: String },
    /// Backend did not answer within the per-call ceiling
    Timeout { message: String },
    /// Reply body could not be interpreted
    ParseError { message: String },
    /// The request was superseded or cancelled
    Cancelled,
    /// Other error
    Other { message: String },
}

impl LlmError {
    /// Errors the transport retries on its own: gateway statuses,
    /// connection failures and timeouts.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::ServerError { status, .. } => matches!(status, Some(502 | 503 | 504)),
            LlmError::NetworkError { .. } | LlmError::Timeout { .. } => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmError::AuthenticationFailed { message } => {
                write!(f, "Authentication failed: {}", message)
            }
            LlmError::InvalidRequest { message } => {
                write!(f, "Invalid request: {}", message)
            }
            LlmError::ServerError { message, status } => {
                if let Some(s) = status {
                    write!(f, "Server error {}: {}", s, message)
                } else {
                    write!(f, "Server error: {}", message)
                }
            }
            LlmError::NetworkError { message } => write!(f, "Network error: {}", message),
            LlmError::Timeout { message } => write!(f, "{}", message),
            LlmError::ParseError { message } => write!(f, "Parse error: {}", message),
            LlmError::Cancelled => write!(f, "Request cancelled"),
            LlmError::Other { message } => write!(f, "Error: {}", message),
        }
    }
}

impl std::error::Error for LlmError {}

/// Result type for backend operations
pub type LlmResult<T> = Result<T, LlmError>;

/// Map a non-2xx reply to an `LlmError`.
///
/// The message is the JSON `error` or `message` field when present,
/// otherwise the leading part of the raw body.
pub fn parse_http_error(status: u16, body: &str) -> LlmError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .or_else(|| v.get("message"))
                .map(|m| match m {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
        })
        .unwrap_or_else(|| body.chars().take(ERROR_BODY_PREVIEW).collect());

    match status {
        401 | 403 => LlmError::AuthenticationFailed { message },
        400 | 422 => LlmError::InvalidRequest { message },
        _ => LlmError::ServerError {
            message,
            status: Some(status),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_payload() -> ChatPayload {
        ChatPayload {
            api_key: "secret-key".to_string(),
            context: "layers: roads".to_string(),
            user_input: "buffer roads".to_string(),
            model: "gemini-2.5-flash".to_string(),
            mode: ExecutionMode::InstructionOnly,
            tool_info: None,
            error_message: None,
            tool_request: None,
            tool_data: None,
        }
    }

    #[test]
    fn test_chat_payload_skips_absent_fields() {
        let json = serde_json::to_value(chat_payload()).unwrap();
        assert_eq!(json["mode"], "instruction_only");
        assert!(json.get("error_message").is_none());
        assert!(json.get("tool_data").is_none());
    }

    #[test]
    fn test_payload_debug_hides_api_key() {
        let dbg = format!("{:?}", chat_payload());
        assert!(!dbg.contains("secret-key"));
    }

    #[test]
    fn test_thinking_level_by_round() {
        assert_eq!(ThinkingLevel::for_round(0), ThinkingLevel::Low);
        assert_eq!(ThinkingLevel::for_round(1), ThinkingLevel::High);
        assert_eq!(ThinkingLevel::for_round(5), ThinkingLevel::High);
        assert_eq!(serde_json::to_string(&ThinkingLevel::High).unwrap(), "\"high\"");
    }

    #[test]
    fn test_parse_http_error_json_body() {
        let err = parse_http_error(500, r#"{"error": "model overloaded"}"#);
        assert_eq!(err.to_string(), "Server error 500: model overloaded");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_parse_http_error_raw_body_truncated() {
        let body = "x".repeat(1000);
        match parse_http_error(503, &body) {
            LlmError::ServerError { message, status } => {
                assert_eq!(message.len(), 300);
                assert_eq!(status, Some(503));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_http_error_auth() {
        let err = parse_http_error(401, r#"{"message": "bad key"}"#);
        assert!(matches!(err, LlmError::AuthenticationFailed { .. }));
    }

    #[test]
    fn test_transient_classification() {
        assert!(parse_http_error(502, "").is_transient());
        assert!(parse_http_error(504, "").is_transient());
        assert!(LlmError::Timeout { message: "t".into() }.is_transient());
        assert!(LlmError::NetworkError { message: "n".into() }.is_transient());
        assert!(!LlmError::Cancelled.is_transient());
        assert!(!parse_http_error(400, "").is_transient());
    }
}
