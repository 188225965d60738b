//! Shared fixtures for the integration suite.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Map};
use tokio_util::sync::CancellationToken;

use query_gis_core::{CollectingProgress, InMemoryProject, LayerInfo, ProgressSink};
use query_gis_desktop::{AppConfig, QueryOrchestrator};
use query_gis_llm::{
    BackendTransport, ChatPayload, FixPayload, FixReply, LlmError, LlmResult, TelemetryReporter,
};
use query_gis_tools::{
    has_top_level_return, ExecutionScope, RuntimeOutput, Sandbox, SandboxResult, ScriptRuntime,
};

// ============================================================================
// Transport
// ============================================================================

/// Backend that answers from queues and records every payload.
#[derive(Default)]
pub struct ScriptedTransport {
    chat_replies: Mutex<VecDeque<LlmResult<String>>>,
    fix_replies: Mutex<VecDeque<LlmResult<FixReply>>>,
    chats: Mutex<Vec<ChatPayload>>,
    fixes: Mutex<Vec<FixPayload>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chat(self, reply: impl Into<String>) -> Self {
        self.chat_replies.lock().unwrap().push_back(Ok(reply.into()));
        self
    }

    pub fn chat_error(self, error: LlmError) -> Self {
        self.chat_replies.lock().unwrap().push_back(Err(error));
        self
    }

    /// Queue a fix reply carrying `code` in a fenced block.
    pub fn fix(self, code: &str) -> Self {
        self.fix_replies.lock().unwrap().push_back(Ok(FixReply {
            text: fenced(code),
            token_count: Some(128),
        }));
        self
    }

    pub fn fix_error(self, error: LlmError) -> Self {
        self.fix_replies.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn chat_payloads(&self) -> Vec<ChatPayload> {
        self.chats.lock().unwrap().clone()
    }

    pub fn fix_payloads(&self) -> Vec<FixPayload> {
        self.fixes.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackendTransport for ScriptedTransport {
    async fn send_chat(
        &self,
        payload: &ChatPayload,
        _cancel: &CancellationToken,
        _progress: &dyn ProgressSink,
    ) -> LlmResult<String> {
        self.chats.lock().unwrap().push(payload.clone());
        self.chat_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Other {
                message: "no scripted chat reply".into(),
            }))
    }

    async fn request_fix(&self, payload: &FixPayload) -> LlmResult<FixReply> {
        self.fixes.lock().unwrap().push(payload.clone());
        self.fix_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Other {
                message: "no scripted fix reply".into(),
            }))
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// One scripted execution: what the script prints or raises, and a layer
/// it adds to the project while running.
pub struct Step {
    pub output: RuntimeOutput,
    pub adds_layer: Option<LayerInfo>,
}

impl Step {
    pub fn ok() -> Self {
        Self::prints("")
    }

    pub fn prints(stdout: &str) -> Self {
        Self {
            output: RuntimeOutput::printed(stdout),
            adds_layer: None,
        }
    }

    pub fn raises(exception: &str) -> Self {
        Self {
            output: RuntimeOutput::raised(exception),
            adds_layer: None,
        }
    }

    pub fn adding(mut self, layer: LayerInfo) -> Self {
        self.adds_layer = Some(layer);
        self
    }
}

pub struct ScriptedRuntime {
    project: Arc<InMemoryProject>,
    steps: Mutex<VecDeque<Step>>,
    executed: Mutex<Vec<String>>,
}

impl ScriptedRuntime {
    pub fn new(project: Arc<InMemoryProject>, steps: Vec<Step>) -> Self {
        Self {
            project,
            steps: Mutex::new(steps.into()),
            executed: Mutex::new(Vec::new()),
        }
    }

    /// Code as the runtime received it, after rewriting.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScriptRuntime for ScriptedRuntime {
    async fn run(
        &self,
        code: &str,
        _scope: &ExecutionScope,
        _progress: &dyn ProgressSink,
    ) -> SandboxResult<RuntimeOutput> {
        self.executed.lock().unwrap().push(code.to_string());
        let step = self.steps.lock().unwrap().pop_front().unwrap_or_else(Step::ok);
        if let Some(layer) = step.adds_layer {
            self.project.add_layer(layer);
        }
        Ok(step.output)
    }

    async fn check_syntax(&self, code: &str) -> SandboxResult<Option<String>> {
        // Same rule as the interpreter's compile step.
        if has_top_level_return(code) {
            return Ok(Some("SyntaxError: 'return' outside function".into()));
        }
        Ok(None)
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn fenced(code: &str) -> String {
    format!("```python\n{}\n```", code)
}

/// A city project with a roads layer (active) and a buildings layer.
pub fn city_project() -> Arc<InMemoryProject> {
    let project = Arc::new(InMemoryProject::new("city"));
    project.set_crs("EPSG:5186");
    project.add_layer(
        LayerInfo::vector("roads_1", "roads")
            .with_crs("EPSG:5186")
            .with_geometry("LineString")
            .with_feature_count(2)
            .with_field("name", "String")
            .with_field("lanes", "Integer"),
    );
    project.add_layer(
        LayerInfo::vector("buildings_1", "buildings")
            .with_crs("EPSG:5186")
            .with_geometry("Polygon")
            .with_feature_count(1)
            .with_field("height", "Real"),
    );
    let mut row = Map::new();
    row.insert("name".into(), json!("Main St"));
    row.insert("lanes".into(), json!(4));
    project.add_features("roads_1", vec![row]);
    project
}

pub struct Harness {
    pub orchestrator: QueryOrchestrator,
    pub transport: Arc<ScriptedTransport>,
    pub runtime: Arc<ScriptedRuntime>,
    pub project: Arc<InMemoryProject>,
    pub progress: Arc<CollectingProgress>,
}

pub fn harness(transport: ScriptedTransport, steps: Vec<Step>) -> Harness {
    harness_with(AppConfig::default(), transport, steps)
}

pub fn harness_with(config: AppConfig, transport: ScriptedTransport, steps: Vec<Step>) -> Harness {
    let project = city_project();
    let transport = Arc::new(transport);
    let runtime = Arc::new(ScriptedRuntime::new(project.clone(), steps));
    let progress = Arc::new(CollectingProgress::new());
    let orchestrator = QueryOrchestrator::new(
        &config,
        transport.clone(),
        Sandbox::new(project.clone(), runtime.clone()),
        TelemetryReporter::disabled().unwrap(),
        progress.clone(),
    );
    Harness {
        orchestrator,
        transport,
        runtime,
        project,
        progress,
    }
}
