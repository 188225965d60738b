//! Script Runtimes
//!
//! `ScriptRuntime` is the seam between the sandbox and whatever actually
//! evaluates Python. `ProcessRuntime` runs each script in a fresh
//! interpreter process:
//!
//! - the scope is rendered into a prelude of bindings and helper functions
//! - the script is embedded as a string literal and `exec`'d, so syntax
//!   errors surface as exceptions with a traceback
//! - progress signals arrive on stderr as `@@progress {json}` lines and are
//!   forwarded live through `RunProgress`
//! - `report_outcome(success, message)` prints an `@@querygis-outcome`
//!   line that the sandbox treats as authoritative

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;

use query_gis_core::ProgressSink;

use crate::error::{SandboxError, SandboxResult};
use crate::progress::{ProgressSignal, RunProgress};
use crate::scope::{Capability, ExecutionScope, LayerHelper};

/// Prefix of a structured outcome line on stdout.
pub const OUTCOME_PREFIX: &str = "@@querygis-outcome ";

/// Prefix of a progress signal line on stderr.
pub const PROGRESS_PREFIX: &str = "@@progress ";

/// Line on stderr separating diagnostics from the traceback.
pub const EXCEPTION_MARKER: &str = "@@querygis-exception";

/// Result the script reported about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredOutcome {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

/// Everything observed from one script run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeOutput {
    /// Printed output with protocol lines removed.
    pub stdout: String,
    /// Traceback or exception text when the script raised.
    pub exception: Option<String>,
    pub outcome: Option<StructuredOutcome>,
    /// Diagnostic lines written outside the traceback (driver warnings).
    pub log_lines: Vec<String>,
}

impl RuntimeOutput {
    pub fn printed(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn raised(exception: impl Into<String>) -> Self {
        Self {
            exception: Some(exception.into()),
            ..Default::default()
        }
    }

    pub fn with_outcome(mut self, success: bool, message: impl Into<String>) -> Self {
        self.outcome = Some(StructuredOutcome {
            success,
            message: message.into(),
        });
        self
    }

    pub fn with_log_line(mut self, line: impl Into<String>) -> Self {
        self.log_lines.push(line.into());
        self
    }
}

/// Evaluates prepared scripts.
#[async_trait]
pub trait ScriptRuntime: Send + Sync {
    /// Run `code` with the names in `scope` bound.
    async fn run(
        &self,
        code: &str,
        scope: &ExecutionScope,
        progress: &dyn ProgressSink,
    ) -> SandboxResult<RuntimeOutput>;

    /// Compile without running. `Some(message)` describes a syntax error.
    async fn check_syntax(&self, code: &str) -> SandboxResult<Option<String>>;
}

// ============================================================================
// Process runtime
// ============================================================================

const PRELUDE: &str = r#"import sys as _qg_sys
import os as _qg_os
import json as _qg_json
import traceback as _qg_traceback

def _qg_emit(event, **fields):
    fields["event"] = event
    _qg_sys.stderr.write("@@progress " + _qg_json.dumps(fields) + "\n")
    _qg_sys.stderr.flush()

def report_outcome(success, message=""):
    print("@@querygis-outcome " + _qg_json.dumps({"success": bool(success), "message": str(message)}))

_qg_snapshot_layers = @@LAYERS@@

try:
    from qgis.core import QgsProject as _qg_project
    def _qg_layers():
        return list(_qg_project.instance().mapLayers().values())
    def _qg_name(layer):
        return layer.name()
except ImportError:
    def _qg_layers():
        return list(_qg_snapshot_layers)
    def _qg_name(layer):
        return layer["name"]

def _qg_find_layer_by_keyword(keyword):
    layers = _qg_layers()
    for layer in layers:
        if _qg_name(layer) == keyword:
            return layer
    lowered = keyword.lower()
    for layer in layers:
        if lowered in _qg_name(layer).lower():
            return layer
    return None

def _qg_get_layer_safe(layer_name):
    layers = _qg_layers()
    for candidate in (layer_name, _qg_os.path.splitext(layer_name)[0]):
        for layer in layers:
            if _qg_name(layer) == candidate:
                return layer
    found = _qg_find_layer_by_keyword(layer_name)
    if found is not None:
        return found
    print(f"Layer '{layer_name}' not found.")
    print("Available layers:")
    for layer in layers:
        print(f"  - {_qg_name(layer)}")
    return None

def _qg_shorten_layer_name(long_name, max_len=50):
    if len(long_name) > max_len:
        return long_name[:max_len - 3] + "..."
    return long_name

try:
    from qgis.core import QgsProcessingFeedback as _qg_feedback_base
except ImportError:
    _qg_feedback_base = object

class _QgFeedback(_qg_feedback_base):
    def setProgress(self, p):
        try:
            super().setProgress(p)
        except AttributeError:
            pass
        _qg_emit("percent", value=float(p))

    def pushInfo(self, info):
        try:
            super().pushInfo(info)
        except AttributeError:
            pass
        if info:
            _qg_emit("info", text=str(info))

def _qg_wrap_run(real_run):
    state = {"seen": 0, "done": 0}
    def _wrapped(alg_id, params, *args, **kwargs):
        state["seen"] += 1
        _qg_emit("started", step=state["seen"])
        try:
            result = real_run(alg_id, params, *args, **kwargs)
        except Exception:
            _qg_emit("failed")
            raise
        state["done"] += 1
        _qg_emit("done", done=state["done"], seen=state["seen"])
        return result
    return _wrapped

"#;

const RUNNER: &str = r#"
_qg_code = @@CODE@@
try:
    exec(compile(_qg_code, "<querygis>", "exec"), globals())
except SystemExit:
    raise
except BaseException:
    _qg_sys.stdout.flush()
    _qg_sys.stderr.write("@@querygis-exception\n")
    _qg_traceback.print_exc()
    _qg_sys.stderr.flush()
    _qg_sys.exit(1)
"#;

const SYNTAX_CHECK: &str = r#"import sys
_qg_code = @@CODE@@
try:
    compile(_qg_code, "<querygis>", "exec")
except SyntaxError as exc:
    print(f"{type(exc).__name__}: {exc.msg} (line {exc.lineno})")
    sys.exit(3)
"#;

fn render_binding(name: &str, capability: &Capability) -> String {
    match capability {
        Capability::Module { module } => format!(
            "try:\n    import {module} as {name}\nexcept ImportError:\n    {name} = None\n"
        ),
        Capability::Symbol { module, symbol } => format!(
            "try:\n    from {module} import {symbol} as {name}\nexcept ImportError:\n    {name} = None\n"
        ),
        Capability::ProcessingRunner => format!(
            "try:\n    import processing as {name}\n    {name}.run = _qg_wrap_run({name}.run)\nexcept ImportError:\n    {name} = None\n"
        ),
        Capability::ProgressFeedback => format!("{name} = _QgFeedback()\n"),
        Capability::LayerHelper(helper) => {
            let target = match helper {
                LayerHelper::FindByKeyword => "_qg_find_layer_by_keyword",
                LayerHelper::GetSafe => "_qg_get_layer_safe",
                LayerHelper::ShortenName => "_qg_shorten_layer_name",
            };
            format!("{name} = {target}\n")
        }
    }
}

/// Full interpreter input for running `code` in `scope`.
pub fn render_script(code: &str, scope: &ExecutionScope) -> SandboxResult<String> {
    let layers: Vec<serde_json::Value> = scope
        .layers()
        .iter()
        .map(|l| serde_json::json!({ "id": l.id, "name": l.name }))
        .collect();

    let mut script = PRELUDE.replace("@@LAYERS@@", &serde_json::to_string(&layers)?);
    for (name, capability) in scope.entries() {
        script.push_str(&render_binding(name, capability));
    }
    script.push_str(&RUNNER.replace("@@CODE@@", &serde_json::to_string(code)?));
    Ok(script)
}

/// Interpreter input that only compiles `code`.
pub fn render_syntax_check(code: &str) -> SandboxResult<String> {
    Ok(SYNTAX_CHECK.replace("@@CODE@@", &serde_json::to_string(code)?))
}

/// Remove outcome lines from captured stdout; the last one wins.
pub fn split_protocol_lines(raw: &str) -> (String, Option<StructuredOutcome>) {
    let mut outcome = None;
    let mut kept = Vec::new();
    for line in raw.lines() {
        match line.strip_prefix(OUTCOME_PREFIX) {
            Some(payload) => match serde_json::from_str::<StructuredOutcome>(payload) {
                Ok(parsed) => outcome = Some(parsed),
                Err(_) => kept.push(line),
            },
            None => kept.push(line),
        }
    }
    (kept.join("\n"), outcome)
}

/// Separate diagnostics from the traceback written after
/// [`EXCEPTION_MARKER`].
pub fn split_stderr(
    lines: Vec<String>,
    success: bool,
    exit_code: Option<i32>,
) -> (Vec<String>, Option<String>) {
    if let Some(marker) = lines.iter().position(|l| l.trim() == EXCEPTION_MARKER) {
        let exception = lines[marker + 1..].join("\n");
        let mut log = lines;
        log.truncate(marker);
        return (log, Some(exception));
    }
    if success {
        return (lines, None);
    }
    let exception = if lines.is_empty() {
        match exit_code {
            Some(code) => format!("Interpreter exited with status {}", code),
            None => "Interpreter was terminated by a signal".to_string(),
        }
    } else {
        lines.join("\n")
    };
    (Vec::new(), Some(exception))
}

/// Read a stream to its end. Invalid UTF-8 is replaced, not an error:
/// native drivers write in the system code page.
async fn read_lossy<R: AsyncRead + Unpin>(reader: R) -> std::io::Result<String> {
    let mut raw = Vec::new();
    BufReader::new(reader).read_to_end(&mut raw).await?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

async fn pump_stderr<R: AsyncRead + Unpin>(
    stderr: R,
    run_progress: &mut RunProgress,
    sink: &dyn ProgressSink,
) -> std::io::Result<Vec<String>> {
    let mut segments = BufReader::new(stderr).split(b'\n');
    let mut kept = Vec::new();
    while let Some(segment) = segments.next_segment().await? {
        let decoded = String::from_utf8_lossy(&segment);
        let line = decoded.strip_suffix('\r').unwrap_or(&*decoded);
        match line.strip_prefix(PROGRESS_PREFIX) {
            Some(payload) => {
                if let Some(text) = ProgressSignal::parse(payload)
                    .and_then(|signal| run_progress.apply(&signal))
                {
                    sink.status(&text);
                }
            }
            None => kept.push(line.to_string()),
        }
    }
    Ok(kept)
}

/// Runs scripts in a child interpreter process.
#[derive(Debug, Clone)]
pub struct ProcessRuntime {
    interpreter: PathBuf,
    timeout: Duration,
}

impl ProcessRuntime {
    pub fn new(interpreter: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            interpreter: interpreter.into(),
            timeout,
        }
    }

    pub fn interpreter(&self) -> &std::path::Path {
        &self.interpreter
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.interpreter);
        cmd.arg("-u")
            .arg("-")
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn spawn_with_input(&self, input: &str) -> SandboxResult<tokio::process::Child> {
        let mut child = self.command().spawn().map_err(|e| {
            SandboxError::spawn(format!("{}: {}", self.interpreter.display(), e))
        })?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::runtime("interpreter stdin unavailable"))?;
        stdin.write_all(input.as_bytes()).await?;
        stdin.shutdown().await?;
        Ok(child)
    }
}

impl Default for ProcessRuntime {
    fn default() -> Self {
        Self::new("python3", Duration::from_secs(600))
    }
}

#[async_trait]
impl ScriptRuntime for ProcessRuntime {
    async fn run(
        &self,
        code: &str,
        scope: &ExecutionScope,
        progress: &dyn ProgressSink,
    ) -> SandboxResult<RuntimeOutput> {
        let script = render_script(code, scope)?;
        let mut child = self.spawn_with_input(&script).await?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::runtime("interpreter stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::runtime("interpreter stderr unavailable"))?;

        let mut run_progress = RunProgress::new();
        let collected = timeout(self.timeout, async {
            tokio::join!(
                read_lossy(stdout),
                pump_stderr(stderr, &mut run_progress, progress),
                child.wait(),
            )
        })
        .await;

        let (raw, stderr_lines, status) = match collected {
            Ok(parts) => parts,
            Err(_) => {
                let _ = child.start_kill();
                tracing::warn!("[Sandbox] script exceeded {:?}, killed", self.timeout);
                return Err(SandboxError::Timeout(self.timeout.as_secs()));
            }
        };
        let status = status?;
        let (stdout, outcome) = split_protocol_lines(&raw?);
        let (log_lines, exception) = split_stderr(stderr_lines?, status.success(), status.code());

        Ok(RuntimeOutput {
            stdout,
            exception,
            outcome,
            log_lines,
        })
    }

    async fn check_syntax(&self, code: &str) -> SandboxResult<Option<String>> {
        let child = self.spawn_with_input(&render_syntax_check(code)?).await?;
        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => return Err(SandboxError::Timeout(self.timeout.as_secs())),
        };
        if output.status.success() {
            return Ok(None);
        }
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !stdout.is_empty() {
            return Ok(Some(stdout));
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Ok(Some(if stderr.is_empty() {
            "Syntax check failed".to_string()
        } else {
            stderr
        }))
    }
}
