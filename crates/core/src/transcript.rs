//! Chat Transcript
//!
//! Append-only ordered record of what the user asked and what came back.
//! The orchestration core only ever pushes entries.

use serde::{Deserialize, Serialize};

/// Author of a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatRole {
    #[serde(rename = "user")]
    User,
    /// Code returned by the backend (runnable / editable in the shell).
    #[serde(rename = "assistant")]
    Assistant,
    /// Plain messages: prose, print output, status and errors.
    #[serde(rename = "assistant-print")]
    AssistantPrint,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::AssistantPrint => "assistant-print",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: ChatRole,
    #[serde(rename = "content")]
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry and return a reference to it.
    pub fn push(&mut self, role: ChatRole, text: impl Into<String>) -> &TranscriptEntry {
        self.entries.push(TranscriptEntry {
            role,
            text: text.into(),
        });
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&TranscriptEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Text of the most recent user entry, or "" when there is none.
    pub fn last_user_text(&self) -> &str {
        self.entries
            .iter()
            .rev()
            .find(|e| e.role == ChatRole::User)
            .map(|e| e.text.as_str())
            .unwrap_or("")
    }
}
