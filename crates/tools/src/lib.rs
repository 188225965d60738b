//! QueryGIS Tools
//!
//! Everything between "here is some code" and "here is what happened":
//!
//! - `lexer` - quote/comment/bracket-aware tokenizer for Python source
//! - `rewrite` - import header, feedback injection, bare-return wrapping
//! - `scope` - name-to-capability table and layer lookup helpers
//! - `progress` - throttled status text for long-running operations
//! - `runtime` - `ScriptRuntime` trait and the child-process interpreter
//! - `outcome` - success / soft error / hard error classification
//! - `sandbox` - execution with rollback of layers added by failed runs

pub mod error;
pub mod lexer;
pub mod outcome;
pub mod progress;
pub mod rewrite;
pub mod runtime;
pub mod sandbox;
pub mod scope;

pub use error::{SandboxError, SandboxResult};
pub use lexer::{check_balance, lex, LexError, Lexed, Region};
pub use outcome::{
    classify_output, format_elapsed, summarize_failure, ExecutionOutcome, OutputVerdict,
};
pub use progress::{ProgressSignal, RunProgress, StatusThrottle, ThrottledProgress};
pub use rewrite::{
    has_top_level_return, inject_processing_feedback, prepare_for_execution,
    prepend_runtime_imports, split_imports, wrap_bare_return, RUNTIME_IMPORT_HEADER,
};
pub use runtime::{ProcessRuntime, RuntimeOutput, ScriptRuntime, StructuredOutcome};
pub use sandbox::Sandbox;
pub use scope::{
    find_layer_by_keyword, get_layer_safe, shorten_layer_name, Capability, ExecutionScope,
    LayerHelper, MAX_LAYER_NAME_LEN,
};
