//! Services Layer
//!
//! Business logic behind the console shell and the host integration:
//!
//! - `context` - bounded project descriptions and tool-request facets
//! - `worker` - background task per backend request
//! - `escalation` - the single light-to-full attempt escalation
//! - `correction` - fix-and-rerun loop for failed executions
//! - `orchestrator` - the query state machine tying them together

pub mod context;
pub mod correction;
pub mod escalation;
pub mod orchestrator;
pub mod worker;

pub use context::{ContextCollector, SUPPORTED_FACETS};
pub use correction::{CorrectionOutcome, FixRequestContext, SelfCorrection, MAX_FIX_ROUNDS};
pub use escalation::EscalationController;
pub use orchestrator::{QueryOrchestrator, QueryOutcome, QueryStatus};
pub use worker::{BackendWorker, WorkerHandle};
