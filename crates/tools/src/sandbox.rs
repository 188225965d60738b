//! Execution Sandbox
//!
//! Runs generated code against the host project:
//!
//! 1. apply the source rewrites (feedback injection, bare-return wrapping)
//! 2. build the standard scope from the current layers
//! 3. run through the configured `ScriptRuntime`
//! 4. classify the output; on failure remove layers the run added and
//!    summarize the cause
//!
//! There is no isolation from the host: executed code can do anything the
//! host API allows.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use query_gis_core::{HostProject, ProgressSink};

use crate::error::SandboxResult;
use crate::lexer::check_balance;
use crate::outcome::{classify_output, summarize_failure, ExecutionOutcome};
use crate::rewrite::prepare_for_execution;
use crate::runtime::{RuntimeOutput, ScriptRuntime};
use crate::scope::ExecutionScope;

pub struct Sandbox {
    host: Arc<dyn HostProject>,
    runtime: Arc<dyn ScriptRuntime>,
}

impl Sandbox {
    pub fn new(host: Arc<dyn HostProject>, runtime: Arc<dyn ScriptRuntime>) -> Self {
        Self { host, runtime }
    }

    pub fn host(&self) -> &Arc<dyn HostProject> {
        &self.host
    }

    /// Syntax problems in `code`, if any. The rewritten source is checked,
    /// the same text `execute` runs, so a bare top-level `return` passes.
    /// Bracket and quote balance is checked locally before asking the
    /// runtime to compile.
    pub async fn check_syntax(&self, code: &str) -> SandboxResult<Option<String>> {
        if let Err(e) = check_balance(code) {
            return Ok(Some(format!("SyntaxError: {}", e)));
        }
        self.runtime.check_syntax(&prepare_for_execution(code)).await
    }

    /// Execute `code` and report how it went. Never fails: runtime
    /// breakdowns are reported as hard errors.
    pub async fn execute(&self, code: &str, progress: &dyn ProgressSink) -> ExecutionOutcome {
        let prepared = prepare_for_execution(code);
        let layers_before: HashSet<String> = self.host.layer_ids().into_iter().collect();
        let log_mark = self.host.message_log().len();
        let scope = ExecutionScope::standard(self.host.as_ref());

        progress.status("Executing code");
        let started = Instant::now();
        let output = match self.runtime.run(&prepared, &scope, progress).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!("[Sandbox] runtime failure: {}", e);
                RuntimeOutput::raised(e.to_string())
            }
        };
        let elapsed = started.elapsed();
        let verdict = classify_output(&output);

        let (summary, rolled_back) = if verdict.is_success() {
            (None, Vec::new())
        } else {
            let rolled_back = self.rollback(&layers_before);
            let log = self.host.message_log();
            let recent = &log[log_mark.min(log.len())..];
            (Some(summarize_failure(&output, recent)), rolled_back)
        };

        tracing::info!(
            "[Sandbox] run finished success={} elapsed={:?} rolled_back={}",
            verdict.is_success(),
            elapsed,
            rolled_back.len()
        );

        ExecutionOutcome {
            verdict,
            stdout: output.stdout,
            summary,
            elapsed,
            rolled_back,
        }
    }

    /// Remove every layer that was not present before the run.
    fn rollback(&self, before: &HashSet<String>) -> Vec<String> {
        let mut removed = Vec::new();
        for id in self.host.layer_ids() {
            if before.contains(&id) {
                continue;
            }
            match self.host.remove_layer(&id) {
                Ok(()) => removed.push(id),
                Err(e) => tracing::warn!("[Sandbox] could not remove layer {}: {}", id, e),
            }
        }
        if !removed.is_empty() {
            tracing::info!("[Sandbox] rolled back {} layer(s) added by failed run", removed.len());
        }
        removed
    }
}
