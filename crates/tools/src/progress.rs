//! Execution Progress
//!
//! Throttling for status text produced while a script runs.
//!
//! - `StatusThrottle` - minimum interval between two updates
//! - `RunProgress` - aggregates processing-run signals into
//!   "N of M steps done" text, at most one update per 250 ms
//! - `ThrottledProgress` - `ProgressSink` wrapper limiting plain status
//!   updates to one per 120 ms

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Deserialize;

use query_gis_core::{ProgressEvent, ProgressSink};

/// Interval between processing-run updates.
pub const RUN_PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Interval between general status updates.
pub const STATUS_INTERVAL: Duration = Duration::from_millis(120);

/// Allows one update per interval.
#[derive(Debug, Clone)]
pub struct StatusThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl StatusThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Record an update at `now` if the interval has passed.
    pub fn allow_at(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// One signal emitted by the wrapped processing runner.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressSignal {
    Started { step: u32 },
    Done { done: u32, seen: u32 },
    Failed,
    Percent { value: f64 },
    Info { text: String },
}

impl ProgressSignal {
    /// Parse the JSON payload of a progress line.
    pub fn parse(payload: &str) -> Option<Self> {
        serde_json::from_str(payload).ok()
    }
}

/// Turns processing signals into throttled status text.
#[derive(Debug, Clone)]
pub struct RunProgress {
    throttle: StatusThrottle,
    seen: u32,
    done: u32,
}

impl Default for RunProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl RunProgress {
    pub fn new() -> Self {
        Self {
            throttle: StatusThrottle::new(RUN_PROGRESS_INTERVAL),
            seen: 0,
            done: 0,
        }
    }

    pub fn steps(&self) -> (u32, u32) {
        (self.done, self.seen)
    }

    pub fn apply(&mut self, signal: &ProgressSignal) -> Option<String> {
        self.apply_at(signal, Instant::now())
    }

    /// Text to show for `signal`, or `None` when throttled. Completion and
    /// failure are never throttled.
    pub fn apply_at(&mut self, signal: &ProgressSignal, now: Instant) -> Option<String> {
        let (text, force) = match signal {
            ProgressSignal::Started { step } => {
                self.seen = self.seen.max(*step);
                (format!("Processing started… (step {})", step), false)
            }
            ProgressSignal::Done { done, seen } => {
                self.done = *done;
                self.seen = self.seen.max(*seen);
                if self.done >= self.seen {
                    ("Processing complete".to_string(), true)
                } else {
                    (
                        format!(
                            "Processing in progress… {} of {} steps done",
                            self.done, self.seen
                        ),
                        false,
                    )
                }
            }
            ProgressSignal::Failed => ("Processing failed".to_string(), true),
            ProgressSignal::Percent { value } => (format!("Processing... {:.0}%", value), false),
            ProgressSignal::Info { text } => (text.clone(), false),
        };

        if force {
            self.throttle.allow_at(now);
            return Some(text);
        }
        self.throttle.allow_at(now).then_some(text)
    }
}

/// Wraps a sink so `status` text is rate limited. Other events pass through.
pub struct ThrottledProgress {
    inner: Arc<dyn ProgressSink>,
    throttle: Mutex<StatusThrottle>,
}

impl ThrottledProgress {
    pub fn new(inner: Arc<dyn ProgressSink>) -> Self {
        Self::with_interval(inner, STATUS_INTERVAL)
    }

    pub fn with_interval(inner: Arc<dyn ProgressSink>, interval: Duration) -> Self {
        Self {
            inner,
            throttle: Mutex::new(StatusThrottle::new(interval)),
        }
    }
}

impl ProgressSink for ThrottledProgress {
    fn emit(&self, event: ProgressEvent) {
        if let ProgressEvent::Status { .. } = event {
            let allowed = self
                .throttle
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .allow();
            if !allowed {
                return;
            }
        }
        self.inner.emit(event);
    }
}
