//! Built-in executors.
//!
//! `WebhookExecutor` forwards approved actions to an HTTP endpoint that owns
//! the real mailbox or task-system credentials. `UnconfiguredExecutor` stands
//! in for action types with no such endpoint.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::executor::{ActionExecutor, ExecutionOutcome};
use crate::pipeline::types::RecordSnapshot;

/// POSTs `{action_type, params, record}` to a configured URL.
///
/// A 2xx response is a success and its JSON body becomes the outcome's
/// response, unless the body says `"success": false`. Any other status is a
/// failure carrying the body's `error` field or the HTTP status.
pub struct WebhookExecutor {
    action_type: String,
    url: String,
    client: reqwest::Client,
}

impl WebhookExecutor {
    pub fn new(action_type: impl Into<String>, url: impl Into<String>) -> Self {
        Self::with_client(action_type, url, reqwest::Client::new())
    }

    pub fn with_client(
        action_type: impl Into<String>,
        url: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            action_type: action_type.into(),
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl ActionExecutor for WebhookExecutor {
    fn action_type(&self) -> &str {
        &self.action_type
    }

    async fn execute(&self, params: &Value, record: &RecordSnapshot) -> ExecutionOutcome {
        let body = json!({
            "action_type": self.action_type,
            "params": params,
            "record": record,
        });

        let resp = match self.client.post(&self.url).json(&body).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(action_type = %self.action_type, error = %e, "Webhook request failed");
                return ExecutionOutcome::failure(format!("webhook request failed: {e}"));
            }
        };

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        let parsed: Option<Value> = serde_json::from_str(&text).ok();
        let reported_error = parsed
            .as_ref()
            .and_then(|v| v.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string);

        if !status.is_success() {
            warn!(action_type = %self.action_type, status = %status, "Webhook returned an error status");
            let outcome = ExecutionOutcome::failure(
                reported_error.unwrap_or_else(|| format!("HTTP {status}")),
            );
            return match parsed {
                Some(body) => outcome.with_response(body),
                None => outcome,
            };
        }

        let declined = parsed
            .as_ref()
            .and_then(|v| v.get("success"))
            .and_then(Value::as_bool)
            == Some(false);
        if declined {
            let outcome = ExecutionOutcome::failure(
                reported_error.unwrap_or_else(|| "handler reported failure".to_string()),
            );
            return match parsed {
                Some(body) => outcome.with_response(body),
                None => outcome,
            };
        }

        debug!(action_type = %self.action_type, status = %status, "Webhook accepted action");
        match parsed {
            Some(body) => ExecutionOutcome::success_with(body),
            None => ExecutionOutcome::success(),
        }
    }
}

/// Always fails: no handler credentials are configured for this action type.
pub struct UnconfiguredExecutor {
    action_type: String,
}

impl UnconfiguredExecutor {
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
        }
    }
}

#[async_trait]
impl ActionExecutor for UnconfiguredExecutor {
    fn action_type(&self) -> &str {
        &self.action_type
    }

    async fn execute(&self, _params: &Value, _record: &RecordSnapshot) -> ExecutionOutcome {
        ExecutionOutcome::failure(format!(
            "no handler credentials configured for '{}'",
            self.action_type
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};

    /// Serve `router` on a random local port and return the hook URL.
    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/hook")
    }

    fn record() -> RecordSnapshot {
        RecordSnapshot {
            record_id: "m-1".into(),
            summary: json!({"subject": "hi"}).as_object().cloned().unwrap(),
        }
    }

    #[tokio::test]
    async fn success_returns_body_as_response() {
        let url = serve(Router::new().route(
            "/hook",
            post(|Json(body): Json<Value>| async move {
                Json(json!({"ok": true, "echo": body["params"], "record": body["record"]["record_id"]}))
            }),
        ))
        .await;

        let outcome = WebhookExecutor::new("archive", url)
            .execute(&json!({"folder": "Promos"}), &record())
            .await;
        assert!(outcome.success);
        let response = outcome.response.unwrap();
        assert_eq!(response["echo"]["folder"], "Promos");
        assert_eq!(response["record"], "m-1");
    }

    #[tokio::test]
    async fn error_status_uses_error_field() {
        let url = serve(Router::new().route(
            "/hook",
            post(|| async { (StatusCode::BAD_GATEWAY, Json(json!({"error": "mailbox offline"}))) }),
        ))
        .await;

        let outcome = WebhookExecutor::new("archive", url).execute(&json!({}), &record()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("mailbox offline"));
    }

    #[tokio::test]
    async fn error_status_without_body_reports_status() {
        let url = serve(Router::new().route("/hook", post(|| async { StatusCode::INTERNAL_SERVER_ERROR })))
            .await;

        let outcome = WebhookExecutor::new("archive", url).execute(&json!({}), &record()).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().starts_with("HTTP 500"));
    }

    #[tokio::test]
    async fn declined_2xx_is_a_failure() {
        let url = serve(Router::new().route(
            "/hook",
            post(|| async { Json(json!({"success": false, "error": "label not found"})) }),
        ))
        .await;

        let outcome = WebhookExecutor::new("label", url).execute(&json!({}), &record()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("label not found"));
        assert!(outcome.response.is_some());
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails() {
        let outcome = WebhookExecutor::new("archive", "http://127.0.0.1:1/hook")
            .execute(&json!({}), &record())
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("webhook request failed"));
    }

    #[tokio::test]
    async fn unconfigured_always_fails() {
        let outcome = UnconfiguredExecutor::new("create_task").execute(&json!({}), &record()).await;
        assert!(!outcome.success);
        assert_eq!(
            outcome.error.as_deref(),
            Some("no handler credentials configured for 'create_task'")
        );
    }
}
