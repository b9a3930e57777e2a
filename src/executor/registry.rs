//! Executor registry: lookup table from action type to handler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::executor::{ActionExecutor, ExecutionOutcome, UNSUPPORTED_ACTION_TYPE};
use crate::pipeline::types::RecordSnapshot;

/// Default per-dispatch timeout.
pub const DEFAULT_EXECUTOR_TIMEOUT: Duration = Duration::from_secs(30);

/// Registry of action executors.
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<String, Arc<dyn ActionExecutor>>>,
    timeout: Duration,
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_EXECUTOR_TIMEOUT)
    }
}

impl ExecutorRegistry {
    /// Create an empty registry with the given dispatch timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            executors: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Register an executor, replacing any previous handler for its type.
    pub async fn register(&self, executor: Arc<dyn ActionExecutor>) {
        let action_type = executor.action_type().to_string();
        if self
            .executors
            .write()
            .await
            .insert(action_type.clone(), executor)
            .is_some()
        {
            warn!(action_type = %action_type, "Replaced existing executor");
        }
        debug!(action_type = %action_type, "Registered executor");
    }

    /// Register an executor (sync version for startup).
    pub fn register_sync(&self, executor: Arc<dyn ActionExecutor>) {
        let action_type = executor.action_type().to_string();
        if let Ok(mut executors) = self.executors.try_write() {
            executors.insert(action_type.clone(), executor);
            debug!(action_type = %action_type, "Registered executor");
        }
    }

    pub async fn get(&self, action_type: &str) -> Option<Arc<dyn ActionExecutor>> {
        self.executors.read().await.get(action_type).cloned()
    }

    pub fn count(&self) -> usize {
        self.executors.try_read().map(|e| e.len()).unwrap_or(0)
    }

    /// Dispatch an action to its handler, bounded by the registry timeout.
    ///
    /// Never errors: an unknown type, a timeout or a panicking handler all
    /// come back as a failed outcome.
    pub async fn execute(
        &self,
        action_type: &str,
        params: &Value,
        record: &RecordSnapshot,
    ) -> ExecutionOutcome {
        let Some(executor) = self.get(action_type).await else {
            warn!(action_type, "No executor registered");
            return ExecutionOutcome::failure(UNSUPPORTED_ACTION_TYPE);
        };

        let params = params.clone();
        let record = record.clone();
        let handle = tokio::spawn(async move { executor.execute(&params, &record).await });
        let abort = handle.abort_handle();

        match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_error)) => {
                warn!(action_type, error = %join_error, "Executor panicked");
                ExecutionOutcome::failure(format!("executor panicked: {join_error}"))
            }
            Err(_) => {
                abort.abort();
                warn!(action_type, timeout = ?self.timeout, "Executor timed out");
                ExecutionOutcome::failure(format!("execution timed out after {:?}", self.timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl ActionExecutor for Echo {
        fn action_type(&self) -> &str {
            "echo"
        }

        async fn execute(&self, params: &Value, record: &RecordSnapshot) -> ExecutionOutcome {
            ExecutionOutcome::success_with(json!({"params": params, "record": record.record_id}))
        }
    }

    struct Slow;

    #[async_trait]
    impl ActionExecutor for Slow {
        fn action_type(&self) -> &str {
            "slow"
        }

        async fn execute(&self, _params: &Value, _record: &RecordSnapshot) -> ExecutionOutcome {
            tokio::time::sleep(Duration::from_secs(5)).await;
            ExecutionOutcome::success()
        }
    }

    struct Panics;

    #[async_trait]
    impl ActionExecutor for Panics {
        fn action_type(&self) -> &str {
            "panics"
        }

        async fn execute(&self, _params: &Value, _record: &RecordSnapshot) -> ExecutionOutcome {
            panic!("handler bug");
        }
    }

    fn record() -> RecordSnapshot {
        RecordSnapshot {
            record_id: "m-1".into(),
            summary: Default::default(),
        }
    }

    #[tokio::test]
    async fn dispatches_by_action_type() {
        let registry = ExecutorRegistry::default();
        registry.register(Arc::new(Echo)).await;
        assert!(registry.get("echo").await.is_some());
        assert_eq!(registry.count(), 1);

        let outcome = registry.execute("echo", &json!({"x": 1}), &record()).await;
        assert!(outcome.success);
        assert_eq!(outcome.response.unwrap(), json!({"params": {"x": 1}, "record": "m-1"}));
    }

    #[tokio::test]
    async fn unknown_type_is_unsupported() {
        let registry = ExecutorRegistry::default();
        let outcome = registry.execute("archive", &json!({}), &record()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some(UNSUPPORTED_ACTION_TYPE));
    }

    #[tokio::test]
    async fn timeout_fails_the_action() {
        let registry = ExecutorRegistry::new(Duration::from_millis(50));
        registry.register_sync(Arc::new(Slow));
        let outcome = registry.execute("slow", &json!({}), &record()).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let registry = ExecutorRegistry::default();
        registry.register_sync(Arc::new(Panics));
        let outcome = registry.execute("panics", &json!({}), &record()).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn later_registration_replaces_handler() {
        let registry = ExecutorRegistry::default();
        registry.register_sync(Arc::new(Echo));
        registry.register(Arc::new(Echo)).await;
        assert_eq!(registry.count(), 1);
    }
}
