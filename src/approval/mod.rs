//! Approval state machine for proposed actions.
//!
//! Nothing executes without a human `approve`. Transitions are compare-and-set
//! on the stored status; terminal transitions write their audit record in the
//! same transaction.

pub mod model;
pub mod service;

pub use model::{ActionStatus, ProposalEvent, ProposedAction};
pub use service::ApprovalService;
