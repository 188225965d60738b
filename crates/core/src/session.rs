//! Query Session
//!
//! One user-submitted natural-language request and the attempt state that
//! travels with it. The orchestrator owns at most one session at a time;
//! dropping the session is the reset point (terminal response, terminal
//! error, or supersession by a new submission).

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Highest attempt number a session may reach.
///
/// Attempt 1 sends instructions with the light context, attempt 2 the full
/// project context in retrieval mode.
pub const MAX_ATTEMPTS: u8 = 2;

/// Tool follow-up rounds permitted inside one attempt.
pub const MAX_TOOL_FOLLOWUPS: u8 = 1;

/// Request mode tag sent with every chat payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Light request: instructions plus active-layer context.
    InstructionOnly,
    /// Escalated request: full project scan, retrieval-augmented.
    RagFull,
    /// Re-send carrying the context facets the backend asked for.
    ToolFollowup,
}

impl ExecutionMode {
    /// Wire tag for this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::InstructionOnly => "instruction_only",
            ExecutionMode::RagFull => "rag_full",
            ExecutionMode::ToolFollowup => "tool_followup",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a single query from submission to terminal response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySession {
    id: String,
    text: String,
    attempt: u8,
    mode: ExecutionMode,
    auto_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    pending_attempt: bool,
    tool_followups: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_code: Option<String>,
}

impl QuerySession {
    /// Start a session at attempt 1 in instruction-only mode.
    pub fn new(id: impl Into<String>, text: impl Into<String>, auto_run: bool) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            attempt: 1,
            mode: ExecutionMode::InstructionOnly,
            auto_run,
            error_message: None,
            pending_attempt: false,
            tool_followups: 0,
            last_code: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn attempt(&self) -> u8 {
        self.attempt
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.mode = mode;
    }

    /// Whether returned code should be executed without asking.
    pub fn auto_run(&self) -> bool {
        self.auto_run
    }

    /// Accumulated failure text across the session, newest last.
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Append a failure reason to the accumulated error message.
    pub fn record_error(&mut self, reason: impl AsRef<str>) {
        let reason = reason.as_ref().trim();
        if reason.is_empty() {
            return;
        }
        match self.error_message.as_mut() {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(reason);
            }
            None => self.error_message = Some(reason.to_string()),
        }
    }

    /// True while a further escalation is still possible.
    pub fn can_escalate(&self) -> bool {
        self.attempt < MAX_ATTEMPTS
    }

    /// Move to the next attempt in `rag_full` mode.
    ///
    /// Marks the session as pending so the response handler keeps it alive
    /// until the escalated reply arrives.
    pub fn begin_escalation(&mut self, reason: &str) -> CoreResult<u8> {
        if !self.can_escalate() {
            return Err(CoreError::session(format!(
                "attempt {} is already the last attempt",
                self.attempt
            )));
        }
        self.attempt += 1;
        self.mode = ExecutionMode::RagFull;
        self.pending_attempt = true;
        self.tool_followups = 0;
        self.record_error(reason);
        Ok(self.attempt)
    }

    pub fn is_pending(&self) -> bool {
        self.pending_attempt
    }

    /// Clear the pending flag, returning whether it was set.
    pub fn take_pending(&mut self) -> bool {
        std::mem::take(&mut self.pending_attempt)
    }

    /// Register a tool follow-up; false once the per-attempt budget is spent.
    pub fn try_tool_followup(&mut self) -> bool {
        if self.tool_followups >= MAX_TOOL_FOLLOWUPS {
            return false;
        }
        self.tool_followups += 1;
        self.mode = ExecutionMode::ToolFollowup;
        true
    }

    /// The most recently chosen code block.
    pub fn last_code(&self) -> Option<&str> {
        self.last_code.as_deref()
    }

    pub fn set_last_code(&mut self, code: impl Into<String>) {
        self.last_code = Some(code.into());
    }
}
