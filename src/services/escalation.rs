//! Attempt Escalation
//!
//! Decides whether a failed attempt gets one more try with the full
//! project context, and which context an attempt sends.

use query_gis_core::{ExecutionMode, HostProject, QuerySession};

use super::context::ContextCollector;

#[derive(Debug, Clone, Default)]
pub struct EscalationController;

impl EscalationController {
    pub fn new() -> Self {
        Self
    }

    /// Move the session to its escalated attempt. Returns false, and leaves
    /// the session untouched, when the last attempt has already been used.
    pub fn advance(&self, session: &mut QuerySession, reason: &str) -> bool {
        match session.begin_escalation(reason) {
            Ok(attempt) => {
                tracing::info!(
                    "[Escalation] session {} moved to attempt {} ({}): {}",
                    session.id(),
                    attempt,
                    session.mode(),
                    first_line(reason)
                );
                true
            }
            Err(e) => {
                tracing::info!("[Escalation] session {} not escalated: {}", session.id(), e);
                false
            }
        }
    }

    /// Context for the session's current attempt: light on attempt 1,
    /// a full scan once escalated.
    pub fn context_for(
        &self,
        session: &QuerySession,
        collector: &ContextCollector,
        host: &dyn HostProject,
    ) -> String {
        if session.attempt() > 1 || session.mode() == ExecutionMode::RagFull {
            collector.full(host)
        } else {
            collector.light(host)
        }
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}
