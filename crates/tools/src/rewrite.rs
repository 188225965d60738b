//! Source Rewrites
//!
//! Transformations applied to generated code before it runs:
//!
//! - `prepend_runtime_imports` - fixed host import header
//! - `inject_processing_feedback` - pass the progress feedback object to
//!   every `processing.run(...)` call that does not already name one
//! - `wrap_bare_return` - turn a script with a top-level `return` into a
//!   function that is called and whose non-`None` result is printed
//!
//! All of them work on the tokenizer's view of the source, so string
//! literals and comments are never rewritten.

use crate::lexer::{is_ident_byte, lex};

/// Imports every executed script can rely on.
pub const RUNTIME_IMPORT_HEADER: &str = "from qgis.core import *\n\
from qgis.gui import *\n\
from qgis.analysis import *\n\
import processing\n\
from qgis.utils import iface\n\
import tempfile, os, random\n";

const RUN_CALL: &str = "processing.run";
const FEEDBACK_KEYWORD: &str = "feedback";
const FEEDBACK_ARG: &str = "feedback=processing_feedback";

const MAIN_FN: &str = "__querygis_main";
const RESULT_VAR: &str = "__querygis_result";

/// Prefix `code` with [`RUNTIME_IMPORT_HEADER`] unless it already starts
/// with it.
pub fn prepend_runtime_imports(code: &str) -> String {
    if code.starts_with(RUNTIME_IMPORT_HEADER) {
        return code.to_string();
    }
    format!("{}{}", RUNTIME_IMPORT_HEADER, code)
}

/// Add `feedback=processing_feedback` to `processing.run(...)` calls.
///
/// Calls inside strings or comments, and calls that already pass a
/// `feedback` keyword, are left alone. Source that does not tokenize is
/// returned unchanged.
pub fn inject_processing_feedback(code: &str) -> String {
    if !code.contains(RUN_CALL) {
        return code.to_string();
    }
    let lexed = match lex(code) {
        Ok(lexed) => lexed,
        Err(e) => {
            tracing::debug!("[Rewrite] skipping feedback injection: {}", e);
            return code.to_string();
        }
    };
    let bytes = code.as_bytes();

    let mut inserts: Vec<(usize, String)> = Vec::new();
    for (pos, _) in code.match_indices(RUN_CALL) {
        if !lexed.is_code(pos) || (pos > 0 && is_ident_byte(bytes[pos - 1])) {
            continue;
        }
        let mut open = pos + RUN_CALL.len();
        while open < bytes.len() && (bytes[open] == b' ' || bytes[open] == b'\t') {
            open += 1;
        }
        if open >= bytes.len() || bytes[open] != b'(' || !lexed.is_code(open) {
            continue;
        }
        let Some(close) = lexed.matching_close(open) else {
            continue;
        };
        if lexed.has_keyword_arg(open, close, FEEDBACK_KEYWORD) {
            continue;
        }

        let insert = match lexed.last_code_byte(open + 1..close) {
            None => (open + 1, FEEDBACK_ARG.to_string()),
            Some(last) if bytes[last] == b',' => (last + 1, format!(" {}", FEEDBACK_ARG)),
            Some(last) => (last + 1, format!(", {}", FEEDBACK_ARG)),
        };
        inserts.push(insert);
    }

    let mut out = code.to_string();
    inserts.sort_by(|a, b| b.0.cmp(&a.0));
    for (at, text) in inserts {
        out.insert_str(at, &text);
    }
    out
}

fn starts_with_keyword(line: &str, keyword: &str) -> bool {
    line.starts_with(keyword)
        && line
            .as_bytes()
            .get(keyword.len())
            .map_or(true, |b| !is_ident_byte(*b))
}

fn opens_scope(line: &str) -> bool {
    let line = line.strip_prefix("async ").map(str::trim_start).unwrap_or(line);
    starts_with_keyword(line, "def") || starts_with_keyword(line, "class")
}

/// Whether a `return` statement appears outside every `def`/`class` body.
pub fn has_top_level_return(code: &str) -> bool {
    let Ok(lexed) = lex(code) else {
        return false;
    };

    let mut scopes: Vec<usize> = Vec::new();
    for range in lexed.logical_lines() {
        let line = &code[range];
        let body = line.trim();
        if body.is_empty() || body.starts_with('#') {
            continue;
        }
        let indent = line.len() - line.trim_start().len();
        while scopes.last().is_some_and(|&top| indent <= top) {
            scopes.pop();
        }
        if opens_scope(body) {
            scopes.push(indent);
        } else if scopes.is_empty() && starts_with_keyword(body, "return") {
            return true;
        }
    }
    false
}

fn is_import_statement(line: &str) -> bool {
    starts_with_keyword(line, "import")
        || (starts_with_keyword(line, "from") && line.contains(" import"))
}

/// Split leading import statements (with blank and comment lines between
/// them) from the rest of the script.
///
/// Parenthesized and backslash-continued imports stay whole.
pub fn split_imports(code: &str) -> (String, String) {
    let Ok(lexed) = lex(code) else {
        return (String::new(), code.to_string());
    };

    let mut split_at = 0;
    for range in lexed.logical_lines() {
        let line = &code[range.clone()];
        let trimmed = line.trim();
        let unindented = !line.starts_with([' ', '\t']);
        let is_header = trimmed.is_empty()
            || trimmed.starts_with('#')
            || (unindented && is_import_statement(trimmed));
        if !is_header {
            break;
        }
        split_at = range.end;
    }

    (code[..split_at].to_string(), code[split_at..].to_string())
}

/// Wrap a script containing a top-level `return` into a called function.
///
/// Imports stay at module level. Lines continuing a multi-line string are
/// not re-indented so literal contents are preserved.
pub fn wrap_bare_return(code: &str) -> String {
    if !has_top_level_return(code) {
        return code.to_string();
    }
    let (imports, body) = split_imports(code);
    let Ok(lexed) = lex(&body) else {
        return code.to_string();
    };

    let mut out = String::with_capacity(code.len() + 160);
    out.push_str(&imports);
    if !imports.is_empty() && !imports.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&format!("def {}():\n", MAIN_FN));

    let mut offset = 0;
    for line in body.split_inclusive('\n') {
        if lexed.starts_inside_string(offset) || line.trim().is_empty() {
            out.push_str(line);
        } else {
            out.push_str("    ");
            out.push_str(line);
        }
        offset += line.len();
    }
    if !out.ends_with('\n') {
        out.push('\n');
    }

    out.push_str(&format!(
        "{result} = {main}()\nif {result} is not None:\n    print({result})\n",
        result = RESULT_VAR,
        main = MAIN_FN
    ));
    out
}

/// Every rewrite needed before handing code to a runtime.
pub fn prepare_for_execution(code: &str) -> String {
    wrap_bare_return(&inject_processing_feedback(code))
}
