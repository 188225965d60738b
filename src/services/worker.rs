//! Backend Worker
//!
//! Runs one chat request on its own Tokio task so the orchestrator never
//! blocks on the network. A worker can be cancelled cooperatively through
//! its token; if it does not finish within the wait bound it is aborted.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use query_gis_core::ProgressSink;
use query_gis_llm::{BackendTransport, ChatPayload, LlmError, LlmResult};

pub struct BackendWorker;

impl BackendWorker {
    /// Start sending `payload`. Must be called inside a Tokio runtime.
    pub fn spawn(
        transport: Arc<dyn BackendTransport>,
        payload: ChatPayload,
        cancel: CancellationToken,
        progress: Arc<dyn ProgressSink>,
    ) -> WorkerHandle {
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            if token.is_cancelled() {
                return Err(LlmError::Cancelled);
            }
            transport
                .send_chat(&payload, &token, progress.as_ref())
                .await
        });
        WorkerHandle {
            cancel,
            handle,
            finished: false,
        }
    }
}

/// Handle to a running worker.
pub struct WorkerHandle {
    cancel: CancellationToken,
    handle: JoinHandle<LlmResult<String>>,
    finished: bool,
}

impl WorkerHandle {
    pub fn is_finished(&self) -> bool {
        self.finished || self.handle.is_finished()
    }

    /// Wait for the reply. Safe to call again after completion: later calls
    /// return `Cancelled`.
    pub async fn wait(&mut self) -> LlmResult<String> {
        if self.finished {
            return Err(LlmError::Cancelled);
        }
        let result = (&mut self.handle).await;
        self.finished = true;
        match result {
            Ok(reply) => reply,
            Err(e) if e.is_cancelled() => Err(LlmError::Cancelled),
            Err(e) => Err(LlmError::Other {
                message: format!("Worker error: {}", e),
            }),
        }
    }

    /// Signal cancellation and wait up to `wait` for the task to stop,
    /// aborting it afterwards.
    pub async fn cancel_and_wait(mut self, wait: Duration) {
        self.cancel.cancel();
        if self.finished {
            return;
        }
        match tokio::time::timeout(wait, &mut self.handle).await {
            Ok(_) => tracing::debug!("[Worker] previous request stopped"),
            Err(_) => {
                tracing::warn!(
                    "[Worker] request did not stop within {:?}, aborting",
                    wait
                );
                self.handle.abort();
            }
        }
    }
}
