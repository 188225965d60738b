//! Query Orchestrator
//!
//! Drives one natural-language query from submission to a terminal
//! response:
//!
//! 1. validate input, persist a changed API key, supersede any live query
//! 2. send the attempt's payload on a background worker
//! 3. answer at most one tool request per attempt with collected facets
//! 4. pick the last code block, syntax-check it (one-shot fix on failure)
//! 5. execute it when auto-run is on, self-correct on failure
//! 6. escalate once to the full-context attempt on application failure
//!
//! Transport failures are reported as they are and never escalate.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use query_gis_core::{
    ChatRole, HostProject, ProgressEvent, ProgressSink, QuerySession, Transcript,
};
use query_gis_llm::{
    parse_backend_response, BackendTransport, ChatPayload, HttpBackend, LlmError, LlmResult,
    TelemetryEvent, TelemetryPhase, TelemetryReporter,
};
use query_gis_tools::{
    prepend_runtime_imports, ExecutionOutcome, ProcessRuntime, Sandbox, ThrottledProgress,
};

use super::context::ContextCollector;
use super::correction::{CorrectionOutcome, FixRequestContext, SelfCorrection};
use super::escalation::EscalationController;
use super::worker::{BackendWorker, WorkerHandle};
use crate::models::AppConfig;
use crate::storage::SettingsStore;
use crate::utils::error::{AppError, AppResult};

/// Length of the per-query run id.
const RUN_ID_LEN: usize = 12;

/// How a query ended.
#[derive(Debug, Clone)]
pub enum QueryStatus {
    /// Code ran successfully, possibly after `fix_rounds` corrections.
    Completed {
        code: String,
        execution: ExecutionOutcome,
        fix_rounds: u32,
    },
    /// Code was returned but auto-run is off.
    CodeReady { code: String },
    /// The backend answered with text only.
    Answered { text: String },
    /// Application-level failure after escalation was exhausted.
    Failed { message: String },
    /// The backend could not be reached or refused the request.
    TransportFailed { message: String },
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub run_id: String,
    /// Attempt the query ended on (1 or 2).
    pub attempt: u8,
    pub status: QueryStatus,
}

impl QueryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            QueryStatus::Completed { .. } | QueryStatus::CodeReady { .. } | QueryStatus::Answered { .. }
        )
    }
}

pub struct QueryOrchestrator {
    pipeline: Pipeline,
    session: Option<QuerySession>,
}

/// Everything except the live session, so the session can be borrowed
/// alongside it.
struct Pipeline {
    transport: Arc<dyn BackendTransport>,
    sandbox: Sandbox,
    collector: ContextCollector,
    escalation: EscalationController,
    correction: SelfCorrection,
    telemetry: TelemetryReporter,
    progress: Arc<dyn ProgressSink>,
    settings_store: Option<Arc<SettingsStore>>,
    model: String,
    plugin_version: String,
    auto_run: bool,
    cancel_wait: Duration,
    cancel: CancellationToken,
    worker: Option<WorkerHandle>,
    transcript: Transcript,
    last_run_id: Option<String>,
}

impl QueryOrchestrator {
    pub fn new(
        config: &AppConfig,
        transport: Arc<dyn BackendTransport>,
        sandbox: Sandbox,
        telemetry: TelemetryReporter,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        let collector = ContextCollector::new(config.context_char_budget);
        let telemetry = telemetry.with_progress(progress.clone());
        let correction = SelfCorrection::new(
            transport.clone(),
            collector.clone(),
            telemetry.clone(),
            config.model.clone(),
            config.plugin_version.clone(),
        );
        Self {
            pipeline: Pipeline {
                transport,
                sandbox,
                collector,
                escalation: EscalationController::new(),
                correction,
                telemetry,
                progress: Arc::new(ThrottledProgress::new(progress)),
                settings_store: None,
                model: config.model.clone(),
                plugin_version: config.plugin_version.clone(),
                auto_run: config.auto_run,
                cancel_wait: config.cancel_wait(),
                cancel: CancellationToken::new(),
                worker: None,
                transcript: Transcript::new(),
                last_run_id: None,
            },
            session: None,
        }
    }

    /// Wire the HTTP backend, telemetry reporter and child-process runtime
    /// described by `config`.
    pub fn from_config(
        config: &AppConfig,
        host: Arc<dyn HostProject>,
        progress: Arc<dyn ProgressSink>,
    ) -> AppResult<Self> {
        config.validate().map_err(AppError::config)?;
        let transport = Arc::new(HttpBackend::new(config.transport_settings())?);
        let telemetry = TelemetryReporter::new(config.telemetry_settings())?;
        let runtime = Arc::new(ProcessRuntime::new(
            config.python_path.clone(),
            config.exec_timeout(),
        ));
        Ok(Self::new(
            config,
            transport,
            Sandbox::new(host, runtime),
            telemetry,
            progress,
        ))
    }

    /// Persist API keys used for queries in `store`.
    pub fn with_settings_store(mut self, store: Arc<SettingsStore>) -> Self {
        self.pipeline.settings_store = Some(store);
        self
    }

    pub fn transcript(&self) -> &Transcript {
        &self.pipeline.transcript
    }

    /// The live session, if a query is in flight.
    pub fn session(&self) -> Option<&QuerySession> {
        self.session.as_ref()
    }

    pub fn auto_run(&self) -> bool {
        self.pipeline.auto_run
    }

    pub fn set_auto_run(&mut self, auto_run: bool) {
        self.pipeline.auto_run = auto_run;
    }

    pub fn host(&self) -> &Arc<dyn HostProject> {
        self.pipeline.sandbox.host()
    }

    /// Token cancelling whatever request is in flight. Clone it to cancel
    /// from another task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.pipeline.cancel.clone()
    }

    /// Submit a query and drive it to a terminal response.
    pub async fn submit(&mut self, text: &str, api_key: &str) -> AppResult<QueryOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::validation("Query is empty"));
        }
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(AppError::validation("API key is required"));
        }
        self.pipeline.remember_api_key(api_key);

        if let Some(previous) = self.session.take() {
            tracing::info!("[Orchestrator] superseding session {}", previous.id());
        }
        self.pipeline.stop_worker().await;
        if self.pipeline.cancel.is_cancelled() {
            self.pipeline.cancel = CancellationToken::new();
        }

        let run_id = new_run_id();
        tracing::info!("[Orchestrator] session {} started", run_id);
        self.pipeline.last_run_id = Some(run_id.clone());
        let session = self
            .session
            .insert(QuerySession::new(run_id, text, self.pipeline.auto_run));

        self.pipeline.transcript.push(ChatRole::User, text);
        self.pipeline.progress.status("Processing query");
        self.pipeline.telemetry.report(
            self.pipeline
                .event(TelemetryPhase::UserQuery, session, "", "", "User query dispatched to backend.")
                .with_meta("model", self.pipeline.model.as_str())
                .with_meta("phase", "user_query")
                .with_meta("os", std::env::consts::OS),
        );

        let status = self.pipeline.drive(session, api_key).await;
        let outcome = QueryOutcome {
            run_id: session.id().to_string(),
            attempt: session.attempt(),
            status,
        };
        self.session = None;
        Ok(outcome)
    }

    /// Execute code from the transcript (possibly edited by the user).
    /// Failures are reported but not corrected.
    pub async fn run_code(&mut self, code: &str) -> AppResult<ExecutionOutcome> {
        if code.trim().is_empty() {
            return Err(AppError::validation("Nothing to run"));
        }
        Ok(self.pipeline.run_manual(code).await)
    }

    /// Cancel the live request and drop its session.
    pub async fn cancel(&mut self) {
        self.pipeline.cancel.cancel();
        self.pipeline.stop_worker().await;
        if let Some(session) = self.session.take() {
            tracing::info!("[Orchestrator] session {} cancelled", session.id());
        }
    }
}

impl Pipeline {
    async fn drive(&mut self, session: &mut QuerySession, api_key: &str) -> QueryStatus {
        let user_text = session.text().to_string();
        let run_id = session.id().to_string();
        let fix_context = FixRequestContext {
            api_key,
            user_text: &user_text,
            run_id: &run_id,
        };
        let mut tool_exchange: Option<(Value, Value)> = None;

        loop {
            let context = self.escalation.context_for(
                session,
                &self.collector,
                self.sandbox.host().as_ref(),
            );
            let (tool_request, tool_data) = match tool_exchange.take() {
                Some((request, data)) => (Some(request), Some(data)),
                None => (None, None),
            };
            let payload = ChatPayload {
                api_key: api_key.to_string(),
                context: context.clone(),
                user_input: user_text.clone(),
                model: self.model.clone(),
                mode: session.mode(),
                tool_info: Some(self.collector.tool_info()),
                error_message: session.error_message().map(str::to_string),
                tool_request,
                tool_data,
            };
            self.telemetry.report(self.event(
                TelemetryPhase::LlmCall,
                session,
                &context,
                "",
                &format!("Request sent (attempt {}, mode {})", session.attempt(), session.mode()),
            ));

            let raw = match self.call_backend(payload).await {
                Ok(raw) => raw,
                Err(LlmError::Cancelled) => {
                    self.progress
                        .emit(ProgressEvent::finished("Request cancelled", false));
                    return QueryStatus::Cancelled;
                }
                Err(e) => {
                    let message = e.to_string();
                    tracing::warn!(
                        "[Orchestrator] transport failure, not escalating: {}",
                        message
                    );
                    self.push_error(&message);
                    return QueryStatus::TransportFailed { message };
                }
            };
            session.take_pending();
            let mut parsed = parse_backend_response(&raw);

            if let Some(request) = parsed.tool_request.take() {
                if session.try_tool_followup() {
                    tracing::info!(
                        "[Orchestrator] backend requested facets {:?}",
                        request.facets
                    );
                    self.progress.status("Collecting requested project context");
                    let data = self
                        .collector
                        .collect_facets(self.sandbox.host().as_ref(), &request);
                    tool_exchange = Some((request.raw, data));
                    continue;
                }
                match self.escalate_or_fail(
                    session,
                    "Backend requested additional context more than once",
                ) {
                    Some(status) => return status,
                    None => continue,
                }
            }

            let Some(code) = parsed.actionable_code().map(str::to_string) else {
                let text = parsed.display_text.trim().to_string();
                if text.is_empty() {
                    match self.escalate_or_fail(session, "Empty response from backend") {
                        Some(status) => return status,
                        None => continue,
                    }
                }
                self.transcript.push(ChatRole::AssistantPrint, text.as_str());
                self.progress
                    .emit(ProgressEvent::finished("Response processed", true));
                return QueryStatus::Answered { text };
            };

            session.set_last_code(code.as_str());
            self.telemetry.report(self.event(
                TelemetryPhase::AiAnswer,
                session,
                "",
                &code,
                &format!("[AI_CODE_LEN={}] Code received.", code.chars().count()),
            ));
            self.transcript.push(ChatRole::Assistant, code.as_str());

            let code = match self.sandbox.check_syntax(&code).await {
                Ok(None) => code,
                Ok(Some(syntax_error)) => {
                    tracing::info!("[Orchestrator] syntax check failed: {}", syntax_error);
                    self.progress.status("Fixing syntax error");
                    match self
                        .correction
                        .fix_syntax(&self.sandbox, &fix_context, &code, &syntax_error)
                        .await
                    {
                        Ok(patch) => {
                            session.set_last_code(patch.as_str());
                            self.transcript.push(ChatRole::Assistant, patch.as_str());
                            patch
                        }
                        Err(still) => {
                            let reason = format!("Syntax error could not be fixed: {}", still);
                            match self.escalate_or_fail(session, &reason) {
                                Some(status) => return status,
                                None => continue,
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("[Orchestrator] syntax check unavailable: {}", e);
                    code
                }
            };

            if !session.auto_run() {
                self.progress
                    .emit(ProgressEvent::finished("Response processed", true));
                return QueryStatus::CodeReady { code };
            }

            let execution = self
                .sandbox
                .execute(&prepend_runtime_imports(&code), self.progress.as_ref())
                .await;
            self.report_execution(session, &code, &execution);
            if execution.success() {
                self.push_success(&execution);
                return QueryStatus::Completed {
                    code,
                    execution,
                    fix_rounds: 0,
                };
            }
            self.transcript
                .push(ChatRole::AssistantPrint, execution.status_line());

            let correction = self
                .correction
                .correct(
                    &self.sandbox,
                    &fix_context,
                    &code,
                    execution,
                    self.progress.as_ref(),
                )
                .await;
            match correction {
                CorrectionOutcome::Fixed {
                    code,
                    execution,
                    rounds,
                } => {
                    session.set_last_code(code.as_str());
                    self.report_execution(session, &code, &execution);
                    self.transcript.push(ChatRole::Assistant, code.as_str());
                    self.push_success(&execution);
                    return QueryStatus::Completed {
                        code,
                        execution,
                        fix_rounds: rounds,
                    };
                }
                failed @ CorrectionOutcome::Failed { .. } => {
                    let reason = failed
                        .terminal_summary()
                        .unwrap_or_else(|| "Execution failed".to_string());
                    match self.escalate_or_fail(session, &reason) {
                        Some(status) => return status,
                        None => continue,
                    }
                }
            }
        }
    }

    /// Escalate the session, or end it with `reason` when escalation is
    /// spent. `None` means the caller should send the escalated request.
    fn escalate_or_fail(&mut self, session: &mut QuerySession, reason: &str) -> Option<QueryStatus> {
        if self.escalation.advance(session, reason) {
            self.progress.status("Retrying with full project context");
            return None;
        }
        self.push_error(reason);
        Some(QueryStatus::Failed {
            message: reason.to_string(),
        })
    }

    /// Send one chat request on a fresh worker, stopping any previous one.
    async fn call_backend(&mut self, payload: ChatPayload) -> LlmResult<String> {
        self.stop_worker().await;
        let worker = BackendWorker::spawn(
            self.transport.clone(),
            payload,
            self.cancel.child_token(),
            self.progress.clone(),
        );
        let result = self.worker.insert(worker).wait().await;
        self.worker = None;
        result
    }

    async fn stop_worker(&mut self) {
        if let Some(previous) = self.worker.take() {
            previous.cancel_and_wait(self.cancel_wait).await;
        }
    }

    async fn run_manual(&mut self, code: &str) -> ExecutionOutcome {
        let execution = self
            .sandbox
            .execute(&prepend_runtime_imports(code), self.progress.as_ref())
            .await;

        let run_id = self.last_run_id.clone().unwrap_or_default();
        let user_text = self.transcript.last_user_text().to_string();
        self.telemetry.report(
            TelemetryEvent::new(
                TelemetryPhase::ExecutionResult,
                &user_text,
                "",
                code,
                &execution_message(&execution),
            )
            .with_meta("plugin_version", self.plugin_version.as_str())
            .with_meta("run_id", run_id),
        );

        if execution.success() {
            self.push_success(&execution);
        } else {
            let details = execution
                .summary
                .clone()
                .unwrap_or_else(|| "Execution failed".to_string());
            self.transcript
                .push(ChatRole::AssistantPrint, format!("Execution Error:\n{}", details));
            self.transcript
                .push(ChatRole::AssistantPrint, execution.status_line());
            self.progress
                .emit(ProgressEvent::finished("Execution error", false));
        }
        execution
    }

    fn push_success(&mut self, execution: &ExecutionOutcome) {
        let output = execution.stdout.trim();
        if !output.is_empty() {
            self.transcript
                .push(ChatRole::AssistantPrint, format!("Print output:\n{}", output));
        }
        self.transcript
            .push(ChatRole::AssistantPrint, execution.status_line());
        self.progress
            .emit(ProgressEvent::finished("Code execution succeeded!", true));
    }

    fn push_error(&mut self, message: &str) {
        let message = message.trim();
        let message = if message.is_empty() {
            "Unknown error"
        } else {
            message
        };
        self.transcript
            .push(ChatRole::AssistantPrint, format!("Error:\n{}", message));
        self.progress
            .emit(ProgressEvent::finished("Request failed", false));
    }

    fn remember_api_key(&self, api_key: &str) {
        if let Some(store) = &self.settings_store {
            if let Err(e) = store.remember_api_key(api_key) {
                tracing::warn!("[Orchestrator] could not persist API key: {}", e);
            }
        }
    }

    fn report_execution(&self, session: &QuerySession, code: &str, execution: &ExecutionOutcome) {
        self.telemetry.report(self.event(
            TelemetryPhase::ExecutionResult,
            session,
            "",
            code,
            &execution_message(execution),
        ));
    }

    fn event(
        &self,
        phase: TelemetryPhase,
        session: &QuerySession,
        context: &str,
        code: &str,
        message: &str,
    ) -> TelemetryEvent {
        TelemetryEvent::new(phase, session.text(), context, code, message)
            .with_meta("plugin_version", self.plugin_version.as_str())
            .with_meta("run_id", session.id())
    }
}

/// `SUCCESS` plus printed output, or the full error text.
fn execution_message(execution: &ExecutionOutcome) -> String {
    if execution.success() {
        let output = execution.stdout.trim();
        if output.is_empty() {
            "SUCCESS".to_string()
        } else {
            format!("SUCCESS\nPRINT:\n{}", output)
        }
    } else {
        execution
            .error_text()
            .or(execution.summary.as_deref())
            .unwrap_or("Execution failed")
            .to_string()
    }
}

fn new_run_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(RUN_ID_LEN);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_shape() {
        let id = new_run_id();
        assert_eq!(id.len(), RUN_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_run_id());
    }

    #[test]
    fn test_execution_message() {
        let mut execution = ExecutionOutcome {
            verdict: query_gis_tools::OutputVerdict::Success,
            stdout: "42 features\n".into(),
            summary: None,
            elapsed: Duration::from_millis(5),
            rolled_back: Vec::new(),
        };
        assert_eq!(execution_message(&execution), "SUCCESS\nPRINT:\n42 features");

        execution.stdout.clear();
        assert_eq!(execution_message(&execution), "SUCCESS");

        execution.verdict = query_gis_tools::OutputVerdict::HardError {
            exception: "Traceback\nValueError: bad".into(),
        };
        assert_eq!(execution_message(&execution), "Traceback\nValueError: bad");
    }
}
