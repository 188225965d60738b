//! Execution Outcomes
//!
//! Classification of a script run into success, soft error or hard error,
//! and the short failure summary shown to the user.
//!
//! A structured outcome reported by the script decides the verdict. Without
//! one, printed output is scanned for success and failure markers; the
//! later of the two wins.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::runtime::RuntimeOutput;

const GENERIC_FAILURE: &str = "Execution failed without an error message";

const FAILURE_PREFIXES: &[&str] = &[
    "Traceback (most recent call last)",
    "Error",
    "ERROR",
    "[ERROR]",
    "Failed",
    "FAILED",
    "Exception",
];
const FAILURE_FRAGMENTS: &[&str] = &["❌", "실패", "오류", "에러"];

/// Words marking a failure anywhere in a line, compared case-insensitively.
const FAILURE_WORDS: &[&str] = &["error", "exception"];

/// Exception class name suffixes (`ValueError`, `QgsProcessingException`).
const EXCEPTION_SUFFIXES: &[&str] = &["Error", "Exception"];

const SUCCESS_PREFIXES: &[&str] = &["Success", "SUCCESS", "Done", "Completed", "[OK]"];
const SUCCESS_FRAGMENTS: &[&str] = &["✅", "성공", "완료"];

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputVerdict {
    Success,
    /// No exception, but the script reported or printed a failure.
    SoftError { message: String },
    /// The script raised.
    HardError { exception: String },
}

impl OutputVerdict {
    pub fn is_success(&self) -> bool {
        matches!(self, OutputVerdict::Success)
    }

    /// Full error text, as sent to the fix service.
    pub fn error_text(&self) -> Option<&str> {
        match self {
            OutputVerdict::Success => None,
            OutputVerdict::SoftError { message } => Some(message),
            OutputVerdict::HardError { exception } => Some(exception),
        }
    }
}

/// Result of one sandboxed execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub verdict: OutputVerdict,
    /// Printed output, protocol lines removed.
    pub stdout: String,
    /// Short failure summary; `None` on success.
    pub summary: Option<String>,
    pub elapsed: Duration,
    /// Layers removed because the failing run had added them.
    pub rolled_back: Vec<String>,
}

impl ExecutionOutcome {
    pub fn success(&self) -> bool {
        self.verdict.is_success()
    }

    pub fn error_text(&self) -> Option<&str> {
        self.verdict.error_text()
    }

    /// "Execution complete · 350ms" or "Execution failed · 1.2s".
    pub fn status_line(&self) -> String {
        let label = if self.success() {
            "Execution complete"
        } else {
            "Execution failed"
        };
        format!("{} · {}", label, format_elapsed(self.elapsed))
    }
}

fn has_failure_word(line: &str) -> bool {
    line.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|word| !word.is_empty())
        .any(|word| {
            FAILURE_WORDS.iter().any(|w| word.eq_ignore_ascii_case(w))
                || EXCEPTION_SUFFIXES
                    .iter()
                    .any(|suffix| word.len() > suffix.len() && word.ends_with(suffix))
        })
}

fn is_failure_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    FAILURE_PREFIXES.iter().any(|p| trimmed.starts_with(p))
        || FAILURE_FRAGMENTS.iter().any(|f| line.contains(f))
        || has_failure_word(line)
}

fn is_success_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    SUCCESS_PREFIXES.iter().any(|p| trimmed.starts_with(p))
        || SUCCESS_FRAGMENTS.iter().any(|f| line.contains(f))
}

/// Printed lines carrying a failure marker.
pub fn failure_lines(stdout: &str) -> Vec<&str> {
    stdout
        .lines()
        .filter(|l| is_failure_line(l))
        .map(str::trim)
        .collect()
}

/// Decide how a run ended.
pub fn classify_output(output: &RuntimeOutput) -> OutputVerdict {
    if let Some(exception) = &output.exception {
        return OutputVerdict::HardError {
            exception: exception.clone(),
        };
    }
    if let Some(outcome) = &output.outcome {
        return if outcome.success {
            OutputVerdict::Success
        } else {
            let message = if outcome.message.trim().is_empty() {
                GENERIC_FAILURE.to_string()
            } else {
                outcome.message.clone()
            };
            OutputVerdict::SoftError { message }
        };
    }

    let mut last_failure = None;
    let mut last_success = None;
    for (i, line) in output.stdout.lines().enumerate() {
        if is_failure_line(line) {
            last_failure = Some(i);
        } else if is_success_line(line) {
            last_success = Some(i);
        }
    }
    match (last_failure, last_success) {
        (Some(f), s) if s.map_or(true, |s| f > s) => OutputVerdict::SoftError {
            message: failure_lines(&output.stdout).join("\n"),
        },
        _ => OutputVerdict::Success,
    }
}

/// Last line of a traceback that is not indented: the exception line.
fn exception_headline(exception: &str) -> Option<&str> {
    exception
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty() && !l.starts_with([' ', '\t']))
        .map(str::trim)
}

/// Pick the most useful failure description.
///
/// Priority: failure-marker lines in printed output (or the reported
/// outcome message), then `ERROR` lines from the host message log and
/// interpreter diagnostics, then the exception headline.
pub fn summarize_failure(output: &RuntimeOutput, host_log: &[String]) -> String {
    if let Some(outcome) = output.outcome.as_ref().filter(|o| !o.success) {
        if !outcome.message.trim().is_empty() {
            return outcome.message.trim().to_string();
        }
    }

    let marked = failure_lines(&output.stdout);
    if !marked.is_empty() {
        return marked.join("\n");
    }

    let driver_errors: Vec<&str> = host_log
        .iter()
        .chain(output.log_lines.iter())
        .map(|l| l.trim())
        .filter(|l| l.contains("ERROR"))
        .collect();
    if !driver_errors.is_empty() {
        return driver_errors.join("\n");
    }

    output
        .exception
        .as_deref()
        .and_then(exception_headline)
        .map(str::to_string)
        .unwrap_or_else(|| GENERIC_FAILURE.to_string())
}

/// `350ms`, `1.2s`, `2m 3.0s`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs < 1.0 {
        format!("{}ms", elapsed.as_millis())
    } else if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        let minutes = (secs / 60.0).floor() as u64;
        format!("{}m {:.1}s", minutes, secs - (minutes as f64) * 60.0)
    }
}
