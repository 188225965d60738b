//! Code Handling Integration Tests
//!
//! Reply parsing and pre-execution rewrites as the orchestrator combines
//! them: backend reply -> actionable block -> import header -> rewrites.

use query_gis_llm::parse_backend_response;
use query_gis_tools::{
    check_balance, has_top_level_return, prepare_for_execution, prepend_runtime_imports,
    RUNTIME_IMPORT_HEADER,
};

#[test]
fn test_last_of_many_blocks_is_chosen() {
    for n in 1..=4 {
        let reply: String = (1..=n)
            .map(|i| format!("Step {}:\n```python\nprint({})\n```\n", i, i))
            .collect();
        let parsed = parse_backend_response(&reply);
        assert_eq!(parsed.code_blocks.len(), n);
        assert_eq!(parsed.actionable_code(), Some(format!("print({})", n).as_str()));
    }
}

#[test]
fn test_chat_completion_shape_with_unfenced_code() {
    let body = serde_json::json!({
        "choices": [{"message": {"content": "  layer = iface.activeLayer()\nprint(layer.name())  "}}]
    })
    .to_string();
    let parsed = parse_backend_response(&body);
    assert_eq!(parsed.code_blocks.len(), 1);
    assert_eq!(
        parsed.actionable_code(),
        Some("layer = iface.activeLayer()\nprint(layer.name())")
    );
}

#[test]
fn test_single_line_prose_is_not_code() {
    let parsed = parse_backend_response(r#"{"text": "Use the Buffer tool with 100 m."}"#);
    assert!(parsed.code_blocks.is_empty());
    assert!(!parsed.is_empty());
}

#[test]
fn test_empty_reply_is_distinguishable() {
    assert!(parse_backend_response("").is_empty());
    assert!(parse_backend_response(r#"{"output": {"text": ""}}"#).is_empty());
}

#[test]
fn test_header_then_rewrites_keep_imports_at_module_level() {
    let chosen = "layer = get_layer_safe('roads')\n\
out = processing.run('native:buffer', {'INPUT': layer, 'OUTPUT': 'memory:'})\n\
label = \"processing.run('x', y)\"\n\
return out['OUTPUT']";

    let prepared = prepare_for_execution(&prepend_runtime_imports(chosen));

    assert!(prepared.starts_with(RUNTIME_IMPORT_HEADER));
    assert!(prepared.contains(
        "    out = processing.run('native:buffer', {'INPUT': layer, 'OUTPUT': 'memory:'}, feedback=processing_feedback)\n"
    ));
    // The call inside the string literal is untouched.
    assert!(prepared.contains("    label = \"processing.run('x', y)\"\n"));
    assert!(prepared.contains("def __querygis_main():\n"));
    assert!(prepared.ends_with("if __querygis_result is not None:\n    print(__querygis_result)\n"));
    assert!(!has_top_level_return(&prepared));
    assert!(check_balance(&prepared).is_ok());
}

#[test]
fn test_code_without_return_is_only_injected() {
    let chosen = "processing.run('native:centroids', params)";
    let prepared = prepare_for_execution(&prepend_runtime_imports(chosen));
    assert_eq!(
        prepared,
        format!(
            "{}processing.run('native:centroids', params, feedback=processing_feedback)",
            RUNTIME_IMPORT_HEADER
        )
    );
}
