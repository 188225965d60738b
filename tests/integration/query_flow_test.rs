//! Query Flow Integration Tests
//!
//! Drives `QueryOrchestrator::submit` against scripted backends:
//! - self-correction after a failing execution
//! - the single escalation to the full-context attempt
//! - transport failures reported without escalation
//! - tool follow-ups, auto-run off, manual re-runs

use query_gis_core::{ChatRole, ExecutionMode, HostProject, LayerInfo, ProgressEvent};
use query_gis_desktop::{AppConfig, AppError, QueryStatus, SettingsStore};
use query_gis_llm::{LlmError, ThinkingLevel};
use query_gis_tools::RUNTIME_IMPORT_HEADER;

use crate::support::{fenced, harness, harness_with, ScriptedTransport, Step};

const BUFFER_CODE: &str = "roads = QgsProject.instance().mapLayersByName('road')[0]\n\
result = processing.run('native:buffer', {'INPUT': roads, 'DISTANCE': 100, 'OUTPUT': 'memory:'})\n\
QgsProject.instance().addMapLayer(result['OUTPUT'])";

const FIXED_CODE: &str = "roads = get_layer_safe('roads')\n\
result = processing.run('native:buffer', {'INPUT': roads, 'DISTANCE': 100, 'OUTPUT': 'memory:'})\n\
QgsProject.instance().addMapLayer(result['OUTPUT'])";

const ATTRIBUTE_ERROR: &str = "Traceback (most recent call last):\n  File \"<querygis>\", line 1, in <module>\nAttributeError: 'NoneType' object has no attribute 'crs'";

fn roles(h: &crate::support::Harness) -> Vec<ChatRole> {
    h.orchestrator
        .transcript()
        .entries()
        .iter()
        .map(|e| e.role)
        .collect()
}

// ============================================================================
// Self-correction
// ============================================================================

#[tokio::test]
async fn test_buffer_roads_fixed_in_first_round() {
    let transport = ScriptedTransport::new()
        .chat(format!("Buffering the roads layer:\n{}", fenced(BUFFER_CODE)))
        .fix(FIXED_CODE);
    let mut h = harness(transport, vec![Step::raises(ATTRIBUTE_ERROR), Step::ok()]);

    let outcome = h
        .orchestrator
        .submit("buffer the roads layer by 100m", "key-1")
        .await
        .unwrap();

    assert_eq!(outcome.attempt, 1);
    match &outcome.status {
        QueryStatus::Completed {
            code, fix_rounds, ..
        } => {
            assert_eq!(code, FIXED_CODE);
            assert_eq!(*fix_rounds, 1);
        }
        other => panic!("unexpected status {:?}", other),
    }

    let entries = h.orchestrator.transcript().entries();
    let n = entries.len();
    assert_eq!(entries[0].role, ChatRole::User);
    assert_eq!(entries[1].role, ChatRole::Assistant);
    assert_eq!(entries[1].text, BUFFER_CODE);
    assert_eq!(entries[n - 2].role, ChatRole::Assistant);
    assert_eq!(entries[n - 2].text, FIXED_CODE);
    assert_eq!(entries[n - 1].role, ChatRole::AssistantPrint);
    assert!(entries[n - 1].text.starts_with("Execution complete · "));

    let fixes = h.transport.fix_payloads();
    assert_eq!(fixes.len(), 1);
    assert_eq!(fixes[0].thinking_level, ThinkingLevel::Low);
    assert_eq!(fixes[0].broken_code, BUFFER_CODE);
    assert!(fixes[0].error_message.contains("AttributeError"));
    assert!(fixes[0].context.contains("buildings"));

    // Both runs received the import header and the feedback keyword.
    let executed = h.runtime.executed();
    assert_eq!(executed.len(), 2);
    for code in &executed {
        assert!(code.starts_with(RUNTIME_IMPORT_HEADER));
        assert!(code.contains("feedback=processing_feedback"));
    }
    assert_eq!(h.transport.chat_payloads().len(), 1);
    assert!(h.orchestrator.session().is_none());
}

#[tokio::test]
async fn test_fix_rounds_are_bounded_per_attempt() {
    let transport = ScriptedTransport::new()
        .chat(fenced("a()"))
        .fix("b()")
        .fix("c()")
        .chat(fenced("d()"))
        .fix("e()")
        .fix("f()");
    let steps = (0..6).map(|i| Step::raises(&format!("ValueError: run {}", i))).collect();
    let mut h = harness(transport, steps);

    let outcome = h.orchestrator.submit("count features", "key").await.unwrap();

    assert_eq!(outcome.attempt, 2);
    match &outcome.status {
        QueryStatus::Failed { message } => assert_eq!(message, "ValueError: run 5"),
        other => panic!("unexpected status {:?}", other),
    }

    let fixes = h.transport.fix_payloads();
    assert_eq!(fixes.len(), 4);
    let levels: Vec<ThinkingLevel> = fixes.iter().map(|f| f.thinking_level).collect();
    assert_eq!(
        levels,
        vec![
            ThinkingLevel::Low,
            ThinkingLevel::High,
            ThinkingLevel::Low,
            ThinkingLevel::High
        ]
    );
    assert_eq!(h.runtime.executed().len(), 6);

    let last = h.orchestrator.transcript().last().unwrap();
    assert_eq!(last.role, ChatRole::AssistantPrint);
    assert_eq!(last.text, "Error:\nValueError: run 5");
}

#[tokio::test]
async fn test_soft_error_rolls_back_and_takes_the_fix_path() {
    let transport = ScriptedTransport::new()
        .chat(fenced("buffer_roads()"))
        .fix("buffer_roads(fixed=True)");
    let steps = vec![
        Step::prints("Buffering...\n❌ Buffer failed: invalid geometry")
            .adding(LayerInfo::vector("tmp_1", "roads_buffer_tmp")),
        Step::prints("✅ Buffer created"),
    ];
    let mut h = harness(transport, steps);

    let outcome = h.orchestrator.submit("buffer roads", "key").await.unwrap();

    assert!(outcome.is_success());
    assert!(!h.project.layer_ids().contains(&"tmp_1".to_string()));

    let fixes = h.transport.fix_payloads();
    assert_eq!(fixes.len(), 1);
    assert!(fixes[0].error_message.contains("invalid geometry"));

    let texts: Vec<String> = h
        .orchestrator
        .transcript()
        .entries()
        .iter()
        .map(|e| e.text.clone())
        .collect();
    assert!(texts.iter().any(|t| t.starts_with("Execution failed · ")));
    assert!(texts.contains(&"Print output:\n✅ Buffer created".to_string()));
    assert!(texts.last().unwrap().starts_with("Execution complete · "));
}

#[tokio::test]
async fn test_fix_service_failure_escalates_then_succeeds() {
    let transport = ScriptedTransport::new()
        .chat(fenced("first()"))
        .fix_error(LlmError::Timeout {
            message: "Request timeout - server did not respond in time".into(),
        })
        .chat(fenced("second()"));
    let steps = vec![Step::raises("NameError: name 'first' is not defined"), Step::ok()];
    let mut h = harness(transport, steps);

    let outcome = h.orchestrator.submit("do it", "key").await.unwrap();

    assert_eq!(outcome.attempt, 2);
    assert!(matches!(
        outcome.status,
        QueryStatus::Completed { fix_rounds: 0, .. }
    ));
    let chats = h.transport.chat_payloads();
    assert_eq!(chats.len(), 2);
    let carried = chats[1].error_message.as_deref().unwrap();
    assert!(carried.contains("NameError"));
    assert!(carried.contains("Fix request failed"));
}

// ============================================================================
// Escalation
// ============================================================================

#[tokio::test]
async fn test_escalation_stops_at_attempt_two() {
    let transport = ScriptedTransport::new()
        .chat("")
        .chat(r#"{"response": ""}"#)
        .chat(fenced("never_requested()"));
    let mut h = harness(transport, Vec::new());

    let outcome = h.orchestrator.submit("what is here?", "key").await.unwrap();

    assert_eq!(outcome.attempt, 2);
    match &outcome.status {
        QueryStatus::Failed { message } => assert_eq!(message, "Empty response from backend"),
        other => panic!("unexpected status {:?}", other),
    }

    let chats = h.transport.chat_payloads();
    assert_eq!(chats.len(), 2, "no request beyond the escalated attempt");
    assert_eq!(chats[0].mode, ExecutionMode::InstructionOnly);
    assert_eq!(chats[0].error_message, None);
    assert_eq!(chats[1].mode, ExecutionMode::RagFull);
    assert_eq!(
        chats[1].error_message.as_deref(),
        Some("Empty response from backend")
    );
    assert!(h.runtime.executed().is_empty());
}

#[tokio::test]
async fn test_rag_full_context_is_richer() {
    let transport = ScriptedTransport::new().chat("").chat(fenced("print('ok')"));
    let mut h = harness(transport, vec![Step::prints("ok")]);

    h.orchestrator.submit("summarize layers", "key").await.unwrap();

    let chats = h.transport.chat_payloads();
    assert_eq!(chats.len(), 2);
    let light = &chats[0].context;
    let full = &chats[1].context;
    assert!(!light.is_empty());
    assert!(!full.is_empty());
    assert!(full.len() > light.len());
    assert!(full.starts_with(light.as_str()));
    assert!(!light.contains("buildings"));
    assert!(full.contains("buildings"));
    assert!(full.contains("Main St"));
}

#[tokio::test]
async fn test_transport_failure_is_not_escalated() {
    let transport = ScriptedTransport::new()
        .chat_error(LlmError::ServerError {
            message: "model overloaded".into(),
            status: Some(500),
        })
        .chat(fenced("never_requested()"));
    let mut h = harness(transport, Vec::new());

    let outcome = h.orchestrator.submit("buffer roads", "key").await.unwrap();

    assert_eq!(outcome.attempt, 1);
    match &outcome.status {
        QueryStatus::TransportFailed { message } => {
            assert_eq!(message, "Server error 500: model overloaded")
        }
        other => panic!("unexpected status {:?}", other),
    }
    assert_eq!(h.transport.chat_payloads().len(), 1);
    let last = h.orchestrator.transcript().last().unwrap();
    assert_eq!(last.text, "Error:\nServer error 500: model overloaded");
    assert!(h
        .progress
        .events()
        .contains(&ProgressEvent::finished("Request failed", false)));
}

#[tokio::test]
async fn test_cancelled_request_ends_quietly() {
    let transport = ScriptedTransport::new().chat_error(LlmError::Cancelled);
    let mut h = harness(transport, Vec::new());

    let outcome = h.orchestrator.submit("q", "key").await.unwrap();
    assert!(matches!(outcome.status, QueryStatus::Cancelled));
    assert_eq!(roles(&h), vec![ChatRole::User]);
}

// ============================================================================
// Tool follow-ups
// ============================================================================

#[tokio::test]
async fn test_tool_request_is_answered_once() {
    let transport = ScriptedTransport::new()
        .chat(r#"{"tool_request": {"facets": ["fields", "samples"]}}"#)
        .chat(fenced("print(len(fields))"));
    let mut h = harness(transport, vec![Step::prints("3")]);

    let outcome = h.orchestrator.submit("list road fields", "key").await.unwrap();
    assert_eq!(outcome.attempt, 1);
    assert!(outcome.is_success());

    let chats = h.transport.chat_payloads();
    assert_eq!(chats.len(), 2);
    assert_eq!(chats[1].mode, ExecutionMode::ToolFollowup);
    assert_eq!(
        chats[1].tool_request.as_ref().unwrap()["facets"][0],
        "fields"
    );
    let data = chats[1].tool_data.as_ref().unwrap();
    assert_eq!(data["fields"]["roads"][1]["name"], "lanes");
    assert_eq!(data["samples"]["roads"][0]["name"], "Main St");
    assert!(chats[0].tool_info.as_deref().unwrap().contains("samples"));
}

#[tokio::test]
async fn test_second_tool_request_in_attempt_escalates() {
    let tool = r#"{"tool_request": ["layers"]}"#;
    let transport = ScriptedTransport::new()
        .chat(tool)
        .chat(tool)
        .chat(fenced("print('done')"));
    let mut h = harness(transport, vec![Step::prints("done")]);

    let outcome = h.orchestrator.submit("q", "key").await.unwrap();

    assert_eq!(outcome.attempt, 2);
    assert!(outcome.is_success());
    let chats = h.transport.chat_payloads();
    assert_eq!(chats.len(), 3);
    assert_eq!(chats[2].mode, ExecutionMode::RagFull);
    assert!(chats[2]
        .error_message
        .as_deref()
        .unwrap()
        .contains("more than once"));
}

// ============================================================================
// Responses without execution
// ============================================================================

#[tokio::test]
async fn test_prose_only_reply_is_answer() {
    let transport = ScriptedTransport::new()
        .chat(r#"{"output": {"text": "The roads layer has 2 features."}}"#);
    let mut h = harness(transport, Vec::new());

    let outcome = h.orchestrator.submit("how many roads?", "key").await.unwrap();
    match outcome.status {
        QueryStatus::Answered { text } => assert_eq!(text, "The roads layer has 2 features."),
        other => panic!("unexpected status {:?}", other),
    }
    assert_eq!(roles(&h), vec![ChatRole::User, ChatRole::AssistantPrint]);
}

#[tokio::test]
async fn test_auto_run_off_returns_code_without_running() {
    let config = AppConfig {
        auto_run: false,
        ..Default::default()
    };
    let transport = ScriptedTransport::new().chat(fenced("print('hi')"));
    let mut h = harness_with(config, transport, vec![Step::prints("hi")]);

    let outcome = h.orchestrator.submit("say hi", "key").await.unwrap();
    assert!(matches!(outcome.status, QueryStatus::CodeReady { ref code } if code == "print('hi')"));
    assert!(h.runtime.executed().is_empty());

    // Re-run from the transcript.
    let execution = h.orchestrator.run_code("print('hi')").await.unwrap();
    assert!(execution.success());
    let entries = h.orchestrator.transcript().entries();
    assert_eq!(entries[entries.len() - 2].text, "Print output:\nhi");
    assert!(entries[entries.len() - 1].text.starts_with("Execution complete"));
    assert!(h.runtime.executed()[0].starts_with(RUNTIME_IMPORT_HEADER));
}

#[tokio::test]
async fn test_manual_run_failure_is_reported_not_corrected() {
    let mut h = harness(
        ScriptedTransport::new(),
        vec![Step::raises("Traceback\nKeyError: 'OUTPUT'")],
    );

    let execution = h.orchestrator.run_code("run()").await.unwrap();
    assert!(!execution.success());
    assert!(h.transport.fix_payloads().is_empty());

    let entries = h.orchestrator.transcript().entries();
    assert_eq!(entries[0].text, "Execution Error:\nKeyError: 'OUTPUT'");
    assert!(entries[1].text.starts_with("Execution failed · "));
}

#[tokio::test]
async fn test_unbalanced_code_gets_one_syntax_fix() {
    let transport = ScriptedTransport::new()
        .chat(fenced("print('x'"))
        .fix("print('x')");
    let mut h = harness(transport, vec![Step::prints("x")]);

    let outcome = h.orchestrator.submit("print x", "key").await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(h.runtime.executed().len(), 1);
    let code_entries: Vec<String> = h
        .orchestrator
        .transcript()
        .entries()
        .iter()
        .filter(|e| e.role == ChatRole::Assistant)
        .map(|e| e.text.clone())
        .collect();
    assert_eq!(code_entries, vec!["print('x'", "print('x')"]);
}

#[tokio::test]
async fn test_bare_return_script_runs_without_syntax_fix() {
    let code = "layer = iface.activeLayer()\nreturn layer.featureCount()";
    let transport = ScriptedTransport::new().chat(fenced(code));
    let mut h = harness(transport, vec![Step::prints("2")]);

    let outcome = h.orchestrator.submit("count roads", "key").await.unwrap();

    match &outcome.status {
        QueryStatus::Completed { fix_rounds, .. } => assert_eq!(*fix_rounds, 0),
        other => panic!("unexpected status {:?}", other),
    }
    assert_eq!(outcome.attempt, 1);
    assert!(h.transport.fix_payloads().is_empty());
    let executed = h.runtime.executed();
    assert_eq!(executed.len(), 1);
    assert!(executed[0].contains("def __querygis_main():\n"));
}

// ============================================================================
// Input validation
// ============================================================================

#[tokio::test]
async fn test_empty_query_and_missing_key_are_rejected() {
    let mut h = harness(ScriptedTransport::new(), Vec::new());

    let err = h.orchestrator.submit("   ", "key").await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    let err = h.orchestrator.submit("buffer roads", "  ").await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    assert!(h.transport.chat_payloads().is_empty());
    assert!(h.orchestrator.transcript().is_empty());
}

#[tokio::test]
async fn test_changed_api_key_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let store = std::sync::Arc::new(SettingsStore::open(dir.path().join("settings.json")).unwrap());
    let transport = ScriptedTransport::new().chat("plain answer");
    let h = harness(transport, Vec::new());
    let mut orchestrator = h.orchestrator.with_settings_store(store.clone());

    orchestrator.submit("hello", " new-key ").await.unwrap();
    assert_eq!(store.get_api_key().unwrap().as_deref(), Some("new-key"));
}
