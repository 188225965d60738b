//! Self-Correction Loop
//!
//! When executed code fails, send the error, the (truncated) code and a
//! fresh small context snapshot to the fix endpoint, run the patch, and
//! repeat for a bounded number of rounds.
//!
//! ```text
//! EXECUTING -> SUCCESS
//!           -> SOFT_ERROR | HARD_ERROR -> REQUEST_FIX -> PATCHED -> EXECUTING (round + 1)
//!                                                     -> FIX_FAILED -> TERMINAL
//! ```
//!
//! The loop is terminal once `MAX_FIX_ROUNDS` patches have failed or the
//! fix service itself fails.

use std::sync::Arc;

use query_gis_core::ProgressSink;
use query_gis_llm::{
    extract_code_blocks, BackendTransport, FixPayload, TelemetryEvent, TelemetryPhase,
    TelemetryReporter, ThinkingLevel,
};
use query_gis_tools::{prepend_runtime_imports, ExecutionOutcome, Sandbox};

use super::context::ContextCollector;

/// Fix rounds allowed for one failing execution.
pub const MAX_FIX_ROUNDS: u32 = 2;

/// Longest code excerpt sent to the fix endpoint.
pub const MAX_FIX_CODE_CHARS: usize = 8000;

/// Longest error excerpt sent to the fix endpoint (the tail is kept).
pub const MAX_ERROR_TAIL_CHARS: usize = 2000;

const GENERIC_FIX_FAILURE: &str = "Execution failed and could not be corrected";

/// Keep the head and tail of long code, dropping the middle.
pub fn truncate_code(code: &str, max_chars: usize) -> String {
    let total = code.chars().count();
    if total <= max_chars {
        return code.to_string();
    }
    let marker = format!("\n# ... {} characters omitted ...\n", total - max_chars);
    let head_len = max_chars * 3 / 4;
    let tail_len = max_chars - head_len;
    let head: String = code.chars().take(head_len).collect();
    let tail: String = code.chars().skip(total - tail_len).collect();
    format!("{}{}{}", head, marker, tail)
}

/// The last `max_chars` characters of an error text.
pub fn error_tail(error: &str, max_chars: usize) -> String {
    let error = error.trim();
    let total = error.chars().count();
    if total <= max_chars {
        return error.to_string();
    }
    let tail: String = error.chars().skip(total - max_chars).collect();
    format!("...{}", tail)
}

/// Identity of the query a fix belongs to.
#[derive(Debug, Clone)]
pub struct FixRequestContext<'a> {
    pub api_key: &'a str,
    pub user_text: &'a str,
    pub run_id: &'a str,
}

/// How the correction loop ended.
#[derive(Debug, Clone)]
pub enum CorrectionOutcome {
    /// A patch ran successfully. `code` is the patch without the import
    /// header.
    Fixed {
        code: String,
        execution: ExecutionOutcome,
        rounds: u32,
    },
    /// No patch succeeded.
    Failed {
        /// Failed execution the summary is drawn from.
        execution: ExecutionOutcome,
        rounds: u32,
        /// Set when the loop stopped because the fix service failed.
        fix_error: Option<String>,
    },
}

impl CorrectionOutcome {
    pub fn is_fixed(&self) -> bool {
        matches!(self, CorrectionOutcome::Fixed { .. })
    }

    /// Fix requests that were answered and executed.
    pub fn rounds(&self) -> u32 {
        match self {
            CorrectionOutcome::Fixed { rounds, .. } | CorrectionOutcome::Failed { rounds, .. } => {
                *rounds
            }
        }
    }

    pub fn execution(&self) -> &ExecutionOutcome {
        match self {
            CorrectionOutcome::Fixed { execution, .. }
            | CorrectionOutcome::Failed { execution, .. } => execution,
        }
    }

    /// User-facing cause of a failed correction.
    pub fn terminal_summary(&self) -> Option<String> {
        match self {
            CorrectionOutcome::Fixed { .. } => None,
            CorrectionOutcome::Failed {
                execution,
                fix_error,
                ..
            } => {
                let summary = execution
                    .summary
                    .clone()
                    .unwrap_or_else(|| GENERIC_FIX_FAILURE.to_string());
                Some(match fix_error {
                    Some(e) => format!("{}\n(Fix request failed: {})", summary, e),
                    None => summary,
                })
            }
        }
    }
}

pub struct SelfCorrection {
    transport: Arc<dyn BackendTransport>,
    collector: ContextCollector,
    telemetry: TelemetryReporter,
    model: String,
    plugin_version: String,
    max_rounds: u32,
}

impl SelfCorrection {
    pub fn new(
        transport: Arc<dyn BackendTransport>,
        collector: ContextCollector,
        telemetry: TelemetryReporter,
        model: impl Into<String>,
        plugin_version: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            collector,
            telemetry,
            model: model.into(),
            plugin_version: plugin_version.into(),
            max_rounds: MAX_FIX_ROUNDS,
        }
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    /// Patch and re-run `code` until it succeeds or the rounds run out.
    /// `failure` is the outcome of the initial execution.
    pub async fn correct(
        &self,
        sandbox: &Sandbox,
        request: &FixRequestContext<'_>,
        code: &str,
        failure: ExecutionOutcome,
        progress: &dyn ProgressSink,
    ) -> CorrectionOutcome {
        let mut current_code = code.to_string();
        let mut last = failure;

        for round in 0..self.max_rounds {
            let error_text = last
                .error_text()
                .or(last.summary.as_deref())
                .unwrap_or(GENERIC_FIX_FAILURE)
                .to_string();
            progress.status(&format!(
                "Requesting a fix (round {} of {})",
                round + 1,
                self.max_rounds
            ));
            tracing::info!(
                "[SelfCorrection] run {} round {} requesting fix",
                request.run_id,
                round + 1
            );

            let patch = match self
                .request_patch(
                    sandbox,
                    request,
                    &current_code,
                    &error_text,
                    ThinkingLevel::for_round(round),
                )
                .await
            {
                Ok(patch) => patch,
                Err(e) => {
                    tracing::warn!("[SelfCorrection] fix request failed: {}", e);
                    return CorrectionOutcome::Failed {
                        execution: last,
                        rounds: round,
                        fix_error: Some(e),
                    };
                }
            };

            progress.status("Executing corrected code");
            let execution = sandbox
                .execute(&prepend_runtime_imports(&patch), progress)
                .await;
            if execution.success() {
                tracing::info!("[SelfCorrection] round {} succeeded", round + 1);
                return CorrectionOutcome::Fixed {
                    code: patch,
                    execution,
                    rounds: round + 1,
                };
            }
            tracing::info!(
                "[SelfCorrection] round {} still failing: {}",
                round + 1,
                execution.summary.as_deref().unwrap_or("")
            );
            current_code = patch;
            last = execution;
        }

        CorrectionOutcome::Failed {
            execution: last,
            rounds: self.max_rounds,
            fix_error: None,
        }
    }

    /// One fix request for code that failed the pre-execution syntax
    /// check. Returns the patch when it passes the check.
    pub async fn fix_syntax(
        &self,
        sandbox: &Sandbox,
        request: &FixRequestContext<'_>,
        code: &str,
        syntax_error: &str,
    ) -> Result<String, String> {
        let patch = self
            .request_patch(sandbox, request, code, syntax_error, ThinkingLevel::Low)
            .await?;
        match sandbox.check_syntax(&patch).await {
            Ok(None) => Ok(patch),
            Ok(Some(still)) => Err(still),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn request_patch(
        &self,
        sandbox: &Sandbox,
        request: &FixRequestContext<'_>,
        code: &str,
        error_text: &str,
        thinking_level: ThinkingLevel,
    ) -> Result<String, String> {
        let payload = FixPayload {
            api_key: request.api_key.to_string(),
            context: self.collector.snapshot(sandbox.host().as_ref()),
            user_input: request.user_text.to_string(),
            broken_code: truncate_code(code, MAX_FIX_CODE_CHARS),
            error_message: error_tail(error_text, MAX_ERROR_TAIL_CHARS),
            model: self.model.clone(),
            thinking_level,
        };

        let reply = self
            .transport
            .request_fix(&payload)
            .await
            .map_err(|e| e.to_string());

        let (patch, telemetry_message) = match &reply {
            Ok(reply) => {
                let patch = extract_code_blocks(&reply.text).pop();
                let message = format!(
                    "[FIX thinking={:?} tokens={}] {}",
                    thinking_level,
                    reply.token_count.map(|t| t.to_string()).unwrap_or_else(|| "-".into()),
                    if patch.is_some() { "Patch received." } else { "No code in fix reply." }
                );
                (patch, message)
            }
            Err(e) => (None, format!("Fix request failed: {}", e)),
        };
        self.telemetry.report(
            TelemetryEvent::new(
                TelemetryPhase::Fix,
                request.user_text,
                &payload.context,
                patch.as_deref().unwrap_or(&payload.broken_code),
                &telemetry_message,
            )
            .with_meta("plugin_version", self.plugin_version.as_str())
            .with_meta("run_id", request.run_id)
            .with_meta("error", payload.error_message.as_str()),
        );

        reply?;
        patch.ok_or_else(|| "Fix service returned no code".to_string())
    }
}
