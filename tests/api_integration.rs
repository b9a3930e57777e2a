//! Integration tests for the REST + WebSocket surface.
//!
//! Each test spins up an Axum server on a random port over an in-memory
//! store, then drives it with reqwest and tokio-tungstenite.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use inbox_policy::api::{AppState, router};
use inbox_policy::executor::{ActionExecutor, ExecutionOutcome, ExecutorRegistry};
use inbox_policy::pipeline::{ProposalEngine, RecordSnapshot};
use inbox_policy::store::{Database, LibSqlBackend};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Archives succeed; labels fail.
struct Fake {
    action_type: &'static str,
}

#[async_trait]
impl ActionExecutor for Fake {
    fn action_type(&self) -> &str {
        self.action_type
    }

    async fn execute(&self, _params: &Value, record: &RecordSnapshot) -> ExecutionOutcome {
        match self.action_type {
            "archive" => ExecutionOutcome::success_with(json!({"archived": record.record_id})),
            _ => ExecutionOutcome::failure("label service down"),
        }
    }
}

/// Start an Axum server on a random port, return its base URL.
async fn start_server() -> String {
    let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let executors = Arc::new(ExecutorRegistry::default());
    executors.register_sync(Arc::new(Fake { action_type: "archive" }));
    executors.register_sync(Arc::new(Fake { action_type: "label" }));
    let app = router(AppState::build(store, executors, ProposalEngine::default()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    format!("127.0.0.1:{port}")
}

fn promo_policy(action: &str, priority: i64) -> Value {
    json!({
        "name": format!("promos → {action}"),
        "priority": priority,
        "enabled": true,
        "condition": {"all": [
            {"field": "category", "op": "eq", "value": "promotions"},
            {"field": "expires_at", "op": "lt", "value": "now"}
        ]},
        "action": action,
        "confidence": 0.8
    })
}

fn records() -> Value {
    json!({"records": [
        {"id": "m-1", "attributes": {"category": "promotions", "expires_at": "2020-01-01T00:00:00Z"}},
        {"id": "m-2", "attributes": {"category": "updates", "expires_at": "2020-01-01T00:00:00Z"}}
    ]})
}

async fn post(client: &reqwest::Client, url: String, body: Value) -> (StatusCode, Value) {
    let resp = client.post(url).json(&body).send().await.unwrap();
    let status = resp.status();
    let body = resp.json().await.unwrap_or(Value::Null);
    (status, body)
}

async fn get(client: &reqwest::Client, url: String) -> (StatusCode, Value) {
    let resp = client.get(url).send().await.unwrap();
    let status = resp.status();
    let body = resp.json().await.unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn health_endpoint() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let (status, body) = get(&reqwest::Client::new(), format!("http://{addr}/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn policy_crud() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let client = reqwest::Client::new();

        let (status, created) =
            post(&client, format!("http://{addr}/api/policies"), promo_policy("archive", 10)).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["id"].as_i64().unwrap();
        assert_eq!(created["action_type"], "archive");

        let (status, fetched) = get(&client, format!("http://{addr}/api/policies/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["priority"], 10);

        let mut changed = promo_policy("label", 3);
        changed["name"] = json!("relabel");
        let resp = client
            .put(format!("http://{addr}/api/policies/{id}"))
            .json(&changed)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let updated: Value = resp.json().await.unwrap();
        assert_eq!(updated["name"], "relabel");
        assert_eq!(updated["priority"], 3);

        let (status, disabled) =
            post(&client, format!("http://{addr}/api/policies/{id}/disable"), json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(disabled["enabled"], false);

        let (_, enabled_only) =
            get(&client, format!("http://{addr}/api/policies?enabled_only=true")).await;
        assert_eq!(enabled_only.as_array().unwrap().len(), 0);
        let (_, all) = get(&client, format!("http://{addr}/api/policies")).await;
        assert_eq!(all.as_array().unwrap().len(), 1);

        let resp = client
            .delete(format!("http://{addr}/api/policies/{id}"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let (status, body) = get(&client, format!("http://{addr}/api/policies/{id}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn invalid_policy_is_unprocessable() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let client = reqwest::Client::new();

        let mut bad_op = promo_policy("archive", 1);
        bad_op["condition"] = json!({"field": "category", "op": "resembles", "value": "x"});
        let (status, body) = post(&client, format!("http://{addr}/api/policies"), bad_op).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("resembles"));

        let mut bad_confidence = promo_policy("archive", 1);
        bad_confidence["confidence"] = json!(1.5);
        let (status, _) = post(&client, format!("http://{addr}/api/policies"), bad_confidence).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (_, all) = get(&client, format!("http://{addr}/api/policies")).await;
        assert!(all.as_array().unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ingest_then_approve() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let client = reqwest::Client::new();
        post(&client, format!("http://{addr}/api/policies"), promo_policy("archive", 10)).await;

        let (status, report) = post(&client, format!("http://{addr}/api/records"), records()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["created"].as_array().unwrap().len(), 1);
        assert_eq!(report["unmatched"], 1);
        let id = report["created"][0]["id"].as_str().unwrap().to_string();

        let (_, pending) = get(&client, format!("http://{addr}/api/proposals?status=pending")).await;
        assert_eq!(pending.as_array().unwrap().len(), 1);

        let (status, done) = post(
            &client,
            format!("http://{addr}/api/proposals/{id}/approve"),
            json!({"decided_by": "sam"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(done["status"], "executed");
        assert_eq!(done["decided_by"], "sam");

        let (status, _) = post(
            &client,
            format!("http://{addr}/api/proposals/{id}/approve"),
            json!({}),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, audit) = get(&client, format!("http://{addr}/api/audit?status=executed")).await;
        assert_eq!(status, StatusCode::OK);
        let audit = audit.as_array().unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0]["proposed_action_id"], id.as_str());
        assert_eq!(audit[0]["payload"]["response"]["archived"], "m-1");
        assert_eq!(audit[0]["actor"]["kind"], "user");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn approve_without_body_is_accepted() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let client = reqwest::Client::new();
        post(&client, format!("http://{addr}/api/policies"), promo_policy("archive", 10)).await;
        let (_, report) = post(&client, format!("http://{addr}/api/records"), records()).await;
        let id = report["created"][0]["id"].as_str().unwrap().to_string();

        let resp = client
            .post(format!("http://{addr}/api/proposals/{id}/approve"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let done: Value = resp.json().await.unwrap();
        assert_eq!(done["status"], "executed");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn failed_execution_can_be_retried() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let client = reqwest::Client::new();
        post(&client, format!("http://{addr}/api/policies"), promo_policy("label", 10)).await;
        let (_, report) = post(&client, format!("http://{addr}/api/records"), records()).await;
        let id = report["created"][0]["id"].as_str().unwrap().to_string();

        let (status, done) =
            post(&client, format!("http://{addr}/api/proposals/{id}/approve"), json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(done["status"], "failed");
        assert_eq!(done["error"], "label service down");

        let (status, retry) =
            post(&client, format!("http://{addr}/api/proposals/{id}/retry"), json!({})).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(retry["status"], "pending");
        assert_eq!(retry["retry_of"], id.as_str());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn reject_records_reason() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let client = reqwest::Client::new();
        post(&client, format!("http://{addr}/api/policies"), promo_policy("archive", 10)).await;
        let (_, report) = post(&client, format!("http://{addr}/api/records"), records()).await;
        let id = report["created"][0]["id"].as_str().unwrap().to_string();

        let (status, rejected) = post(
            &client,
            format!("http://{addr}/api/proposals/{id}/reject"),
            json!({"decided_by": "sam", "reason": "still want it"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(rejected["status"], "rejected");

        let (_, audit) = get(&client, format!("http://{addr}/api/audit?action_type=archive")).await;
        assert_eq!(audit[0]["outcome"], "rejected");
        assert_eq!(audit[0]["payload"]["reason"], "still want it");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unknown_and_malformed_proposal_ids() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let client = reqwest::Client::new();

        let (status, body) = get(&client, format!("http://{addr}/api/proposals/not-a-uuid")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid proposal ID");

        let missing = uuid::Uuid::new_v4();
        let (status, _) = get(&client, format!("http://{addr}/api/proposals/{missing}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) =
            post(&client, format!("http://{addr}/api/proposals/{missing}/approve"), json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn simulate_previews_without_writing() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let client = reqwest::Client::new();

        let mut request = records();
        request["candidate"] = promo_policy("archive", 1);
        let (status, report) = post(&client, format!("http://{addr}/api/simulate"), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["matched"], 1);
        assert_eq!(report["previews"][0]["record_id"], "m-1");
        assert_eq!(report["previews"][0]["action_type"], "archive");
        assert_eq!(report["previews"][1]["matched"], false);

        let (_, proposals) = get(&client, format!("http://{addr}/api/proposals")).await;
        assert!(proposals.as_array().unwrap().is_empty());
        let (_, policies) = get(&client, format!("http://{addr}/api/policies")).await;
        assert!(policies.as_array().unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_syncs_pending_then_streams_events() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let client = reqwest::Client::new();
        post(&client, format!("http://{addr}/api/policies"), promo_policy("archive", 10)).await;
        post(&client, format!("http://{addr}/api/records"), records()).await;

        let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();

        let msg = ws.next().await.unwrap().unwrap();
        let sync: Value = match msg {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text, got {other:?}"),
        };
        assert_eq!(sync["type"], "pending_sync");
        let proposals = sync["proposals"].as_array().unwrap();
        assert_eq!(proposals.len(), 1);
        let id = proposals[0]["id"].as_str().unwrap().to_string();

        post(&client, format!("http://{addr}/api/proposals/{id}/approve"), json!({})).await;

        let mut statuses = Vec::new();
        while statuses.len() < 2 {
            if let Message::Text(text) = ws.next().await.unwrap().unwrap() {
                let event: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(event["type"], "status_changed");
                assert_eq!(event["id"], id.as_str());
                statuses.push(event["status"].as_str().unwrap().to_string());
            }
        }
        assert_eq!(statuses, vec!["approved", "executed"]);
    })
    .await
    .expect("test timed out");
}

/// Next JSON text frame matching `want`, skipping everything else.
async fn frame_where<S>(ws: &mut S, want: impl Fn(&Value) -> bool) -> Value
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        if let Message::Text(text) = ws.next().await.unwrap().unwrap() {
            let frame: Value = serde_json::from_str(&text).unwrap();
            if want(&frame) {
                return frame;
            }
        }
    }
}

#[tokio::test]
async fn ws_decisions_report_refusals_to_the_sender() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let client = reqwest::Client::new();
        post(&client, format!("http://{addr}/api/policies"), promo_policy("archive", 10)).await;
        post(&client, format!("http://{addr}/api/records"), records()).await;

        let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        let sync = frame_where(&mut ws, |f| f["type"] == "pending_sync").await;
        let id = sync["proposals"][0]["id"].as_str().unwrap().to_string();

        let approve = json!({"action": "approve", "proposal_id": id, "decided_by": "sam"}).to_string();
        ws.send(Message::Text(approve.clone().into())).await.unwrap();
        let done = frame_where(&mut ws, |f| f["status"] == "executed").await;
        assert_eq!(done["id"], id.as_str());

        // The losing second approval is reported back on this socket.
        ws.send(Message::Text(approve.into())).await.unwrap();
        let refusal = frame_where(&mut ws, |f| f["type"] == "error").await;
        assert_eq!(refusal["proposal_id"], id.as_str());
        assert!(refusal["error"].as_str().unwrap().contains("executed"));

        let unknown = uuid::Uuid::new_v4();
        let reject = json!({"action": "reject", "proposal_id": unknown}).to_string();
        ws.send(Message::Text(reject.into())).await.unwrap();
        let refusal = frame_where(&mut ws, |f| f["type"] == "error").await;
        assert_eq!(refusal["proposal_id"], unknown.to_string());
        assert!(refusal["error"].as_str().unwrap().contains("not found"));

        ws.send(Message::Text(r#"{"action":"explode"}"#.to_string().into())).await.unwrap();
        let refusal = frame_where(&mut ws, |f| f["type"] == "error").await;
        assert!(refusal.get("proposal_id").is_none());

        let (status, stored) = get(&client, format!("http://{addr}/api/proposals/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stored["status"], "executed");
    })
    .await
    .expect("test timed out");
}
