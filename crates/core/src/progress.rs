//! Progress Events
//!
//! Status text flowing from the transport, sandbox and orchestrator to
//! whatever displays progress (dock panel, console, tests).

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// A single progress notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Transport is opening the connection.
    Connecting,
    /// Request body is on the wire.
    Sending,
    /// Reply received, being processed.
    Processing,
    /// Free-form status line.
    Status { message: String },
    /// Passive warning (e.g. telemetry delivery failed).
    Warning { message: String },
    /// Terminal status for the current operation.
    Finished { message: String, success: bool },
}

impl ProgressEvent {
    pub fn status(message: impl Into<String>) -> Self {
        ProgressEvent::Status {
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        ProgressEvent::Warning {
            message: message.into(),
        }
    }

    pub fn finished(message: impl Into<String>, success: bool) -> Self {
        ProgressEvent::Finished {
            message: message.into(),
            success,
        }
    }

    /// Display text for a status line.
    pub fn label(&self) -> String {
        match self {
            ProgressEvent::Connecting => "Connecting to backend server".to_string(),
            ProgressEvent::Sending => "Sending request to server".to_string(),
            ProgressEvent::Processing => "Processing response".to_string(),
            ProgressEvent::Status { message } => message.clone(),
            ProgressEvent::Warning { message } => format!("Warning: {}", message),
            ProgressEvent::Finished { message, .. } => message.clone(),
        }
    }
}

/// Receiver of progress events. Implementations must not block.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);

    /// Shorthand for a status line.
    fn status(&self, message: &str) {
        self.emit(ProgressEvent::status(message));
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelProgress {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelProgress {
    fn emit(&self, event: ProgressEvent) {
        // Receiver gone means nobody is displaying progress any more.
        let _ = self.tx.send(event);
    }
}

/// Keeps every event in memory; used for headless runs and tests.
#[derive(Debug, Default)]
pub struct CollectingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Labels of all recorded events, in order.
    pub fn labels(&self) -> Vec<String> {
        self.events().iter().map(ProgressEvent::label).collect()
    }
}

impl ProgressSink for CollectingProgress {
    fn emit(&self, event: ProgressEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
