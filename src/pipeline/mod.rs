//! Proposal pipeline.
//!
//! Classified records flow through:
//! 1. `ContextBuilder::build()`: one context per record, one `now` per batch
//! 2. `ProposalEngine::decide()`: first matching policy above the floor wins
//! 3. `ProposalProcessor::ingest()`: persist pending proposals (live path)
//!    or `simulate()`: previews only (dry runs)
//!
//! **No auto-execute path exists.** Every action waits for human approval.

pub mod context;
pub mod engine;
pub mod processor;
pub mod rationale;
pub mod simulate;
pub mod types;

pub use context::{Context, ContextBuilder};
pub use engine::{Decision, ProposalDraft, ProposalEngine};
pub use processor::{BatchReport, ProposalProcessor};
pub use simulate::{DryRunReport, DryRunRequest, ProposalPreview, Simulator, simulate};
pub use types::{InboundRecord, RecordSnapshot};
