//! Action executors: the side-effecting handlers behind approved proposals.

pub mod builtin;
pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pipeline::types::RecordSnapshot;

pub use builtin::{UnconfiguredExecutor, WebhookExecutor};
pub use registry::ExecutorRegistry;

/// Error reported when no handler is registered for an action type.
pub const UNSUPPORTED_ACTION_TYPE: &str = "unsupported action type";

/// Result of running an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub error: Option<String>,
    /// Machine-readable handler response, stored verbatim in the audit payload.
    pub response: Option<Value>,
}

impl ExecutionOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            error: None,
            response: None,
        }
    }

    pub fn success_with(response: Value) -> Self {
        Self {
            success: true,
            error: None,
            response: Some(response),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            response: None,
        }
    }

    pub fn with_response(mut self, response: Value) -> Self {
        self.response = Some(response);
        self
    }
}

/// A handler for one action type.
///
/// Implementations report failures through [`ExecutionOutcome`]; they are
/// never expected to panic, but a panic is contained by the registry.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// The action type this handler serves, e.g. `"archive"`.
    fn action_type(&self) -> &str;

    async fn execute(&self, params: &Value, record: &RecordSnapshot) -> ExecutionOutcome;
}
