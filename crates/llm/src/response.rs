//! Backend Response Parsing
//!
//! Turns a raw reply body into display text, fenced code blocks and an
//! optional tool request.
//!
//! Resolution order for JSON mappings:
//! 1. `tool_request` - short-circuits code extraction
//! 2. `output.text`
//! 3. `response`
//! 4. `text`
//! 5. `choices[0].message.content`, then `choices[0].text`
//! 6. the whole document, pretty-printed
//!
//! Bodies that are not JSON are used verbatim.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Code fence delimiter.
const FENCE: &str = "```";

/// Optional language tag accepted directly after an opening fence.
const PYTHON_TAG: &str = "python";

/// Fragments that mark unfenced text as code.
const CODE_MARKERS: &[&str] = &["Qgs", "processing.run", "iface"];

/// Statement openers that mark unfenced text as code.
const CODE_OPENERS: &[&str] = &[
    "import ", "from ", "try:", "for ", "if ", "with ", "def ", "while ",
];

/// The backend asking for more local context before it writes code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    /// Names of the requested context facets, in request order.
    pub facets: Vec<String>,
    /// The request exactly as received, echoed back in the follow-up.
    pub raw: Value,
}

/// Result of parsing one backend reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedResponse {
    pub display_text: String,
    pub code_blocks: Vec<String>,
    pub tool_request: Option<ToolRequest>,
}

impl ParsedResponse {
    /// The actionable block: the last one. Earlier blocks are treated as
    /// explanatory snippets.
    pub fn actionable_code(&self) -> Option<&str> {
        self.code_blocks
            .iter()
            .rev()
            .map(|b| b.trim())
            .find(|b| !b.is_empty())
    }

    /// No code, no text, no tool request.
    pub fn is_empty(&self) -> bool {
        self.tool_request.is_none()
            && self.actionable_code().is_none()
            && self.display_text.trim().is_empty()
    }

    /// Display text with every fenced block removed.
    pub fn prose(&self) -> String {
        extract_non_code_text(&self.display_text)
    }
}

/// Parse a raw backend reply.
pub fn parse_backend_response(raw: &str) -> ParsedResponse {
    let display_text = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => {
            let data = Value::Object(map);
            if let Some(request) = data.get("tool_request").and_then(parse_tool_request) {
                let display_text = extract_payload_text(&data).unwrap_or_default();
                return ParsedResponse {
                    display_text,
                    code_blocks: Vec::new(),
                    tool_request: Some(request),
                };
            }
            extract_payload_text(&data).unwrap_or_else(|| pretty(&data))
        }
        Ok(other) => pretty(&other),
        Err(_) => raw.to_string(),
    };

    let code_blocks = extract_code_blocks(&display_text);
    ParsedResponse {
        display_text,
        code_blocks,
        tool_request: None,
    }
}

/// Pull the human/code-bearing text out of a reply document.
pub fn extract_payload_text(data: &Value) -> Option<String> {
    if let Some(text) = data.get("output").and_then(|o| o.get("text")) {
        return Some(value_to_text(text));
    }
    if let Some(text) = data.get("response") {
        return Some(value_to_text(text));
    }
    if let Some(text) = data.get("text") {
        return Some(value_to_text(text));
    }
    let choice = data.get("choices")?.as_array()?.first()?;
    choice
        .get("message")
        .and_then(|m| m.get("content"))
        .or_else(|| choice.get("text"))
        .map(value_to_text)
}

/// Extract every fenced block; fall back to the whole text when it looks
/// like unfenced code.
pub fn extract_code_blocks(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }

    let mut blocks = Vec::new();
    for_each_fence(text, |segment| {
        if let Segment::Code(code) = segment {
            let code = code.trim();
            if !code.is_empty() {
                blocks.push(code.to_string());
            }
        }
    });

    if blocks.is_empty() && looks_like_code(text) {
        blocks.push(text.trim().to_string());
    }
    blocks
}

/// Text outside of fenced blocks, trimmed.
pub fn extract_non_code_text(text: &str) -> String {
    let mut out = String::new();
    for_each_fence(text, |segment| {
        if let Segment::Prose(prose) = segment {
            out.push_str(prose);
        }
    });
    out.trim().to_string()
}

fn looks_like_code(text: &str) -> bool {
    if !text.contains('\n') {
        return false;
    }
    let start = text.trim_start();
    CODE_MARKERS.iter().any(|m| text.contains(m))
        || CODE_OPENERS.iter().any(|o| start.starts_with(o))
}

enum Segment<'a> {
    Prose(&'a str),
    Code(&'a str),
}

/// Walk `text`, handing complete fenced blocks and the prose between them
/// to `visit`. An unterminated fence is treated as prose.
fn for_each_fence<'a>(text: &'a str, mut visit: impl FnMut(Segment<'a>)) {
    let mut remaining = text;
    while let Some(start) = remaining.find(FENCE) {
        let after_marker = &remaining[start + FENCE.len()..];
        let body = strip_python_tag(after_marker);
        match body.find(FENCE) {
            Some(end) => {
                visit(Segment::Prose(&remaining[..start]));
                visit(Segment::Code(&body[..end]));
                remaining = &body[end + FENCE.len()..];
            }
            None => break,
        }
    }
    visit(Segment::Prose(remaining));
}

/// Drop a leading `python` info string. Longer tags (`pythonic`) are not
/// the python tag and are kept.
fn strip_python_tag(s: &str) -> &str {
    match s.get(..PYTHON_TAG.len()) {
        Some(tag) if tag.eq_ignore_ascii_case(PYTHON_TAG) => {
            let rest = &s[PYTHON_TAG.len()..];
            match rest.chars().next() {
                Some(c) if !c.is_whitespace() => s,
                _ => rest,
            }
        }
        _ => s,
    }
}

fn parse_tool_request(value: &Value) -> Option<ToolRequest> {
    let facets = match value {
        Value::Null | Value::Bool(false) => return None,
        Value::String(s) if s.trim().is_empty() => return None,
        Value::String(s) => split_names(s),
        Value::Array(items) => names_from_array(items),
        Value::Object(map) => ["facets", "tools", "names", "needed"]
            .iter()
            .find_map(|key| map.get(*key))
            .map(|v| match v {
                Value::Array(items) => names_from_array(items),
                Value::String(s) => split_names(s),
                _ => Vec::new(),
            })
            .or_else(|| {
                map.get("name")
                    .and_then(Value::as_str)
                    .map(|s| vec![s.trim().to_string()])
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    };
    Some(ToolRequest {
        facets,
        raw: value.clone(),
    })
}

fn names_from_array(items: &[Value]) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Object(obj) => obj.get("name").and_then(Value::as_str).map(|s| s.trim().to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .collect()
}

fn split_names(s: &str) -> Vec<String> {
    s.split(',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
