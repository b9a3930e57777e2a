//! REST endpoints for policies, records, proposals, audit, and dry runs.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::api::ws::ws_handler;
use crate::approval::{ActionStatus, ApprovalService};
use crate::audit::{AuditFilter, AuditLog};
use crate::error::{ApprovalError, DatabaseError, PolicyError};
use crate::executor::ExecutorRegistry;
use crate::pipeline::{DryRunRequest, InboundRecord, ProposalEngine, ProposalProcessor, Simulator};
use crate::policy::{PolicyDraft, PolicyService};
use crate::store::Database;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub policies: Arc<PolicyService>,
    pub processor: Arc<ProposalProcessor>,
    pub approvals: Arc<ApprovalService>,
    pub audit: Arc<AuditLog>,
    pub simulator: Arc<Simulator>,
}

impl AppState {
    /// Wire every service over one store and executor registry.
    pub fn build(
        store: Arc<dyn Database>,
        executors: Arc<ExecutorRegistry>,
        engine: ProposalEngine,
    ) -> Self {
        let approvals = Arc::new(ApprovalService::new(Arc::clone(&store), executors));
        Self {
            policies: Arc::new(PolicyService::new(Arc::clone(&store))),
            processor: Arc::new(ProposalProcessor::new(
                engine,
                Arc::clone(&store),
                Arc::clone(&approvals),
            )),
            approvals,
            audit: Arc::new(AuditLog::new(Arc::clone(&store))),
            simulator: Arc::new(Simulator::new(engine, store)),
        }
    }
}

/// Build the Axum router with REST and WebSocket routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .route("/api/policies", get(list_policies).post(create_policy))
        .route(
            "/api/policies/{id}",
            get(get_policy).put(update_policy).delete(delete_policy),
        )
        .route("/api/policies/{id}/enable", post(enable_policy))
        .route("/api/policies/{id}/disable", post(disable_policy))
        .route("/api/records", post(ingest_records))
        .route("/api/proposals", get(list_proposals))
        .route("/api/proposals/{id}", get(get_proposal))
        .route("/api/proposals/{id}/approve", post(approve_proposal))
        .route("/api/proposals/{id}/reject", post(reject_proposal))
        .route("/api/proposals/{id}/retry", post(retry_proposal))
        .route("/api/audit", get(query_audit))
        .route("/api/simulate", post(simulate))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

/// JSON error response: `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        error!(error = %e, "Database error");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl From<PolicyError> for ApiError {
    fn from(e: PolicyError) -> Self {
        match e {
            PolicyError::Condition(_) | PolicyError::InvalidField { .. } => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
            }
            PolicyError::NotFound { .. } => Self::new(StatusCode::NOT_FOUND, e.to_string()),
            PolicyError::Database(db) => db.into(),
        }
    }
}

impl From<ApprovalError> for ApiError {
    fn from(e: ApprovalError) -> Self {
        match e {
            ApprovalError::NotFound { .. } => Self::new(StatusCode::NOT_FOUND, e.to_string()),
            ApprovalError::Conflict { .. } | ApprovalError::DuplicatePending { .. } => {
                Self::new(StatusCode::CONFLICT, e.to_string())
            }
            ApprovalError::Database(db) => db.into(),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_proposal_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ApiError::bad_request("Invalid proposal ID"))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "inbox-policy"
    }))
}

// ── Policies ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PolicyListQuery {
    #[serde(default)]
    enabled_only: bool,
}

async fn list_policies(
    State(state): State<AppState>,
    Query(query): Query<PolicyListQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.policies.list(query.enabled_only).await?))
}

async fn create_policy(
    State(state): State<AppState>,
    Json(draft): Json<PolicyDraft>,
) -> ApiResult<impl IntoResponse> {
    let policy = state.policies.create(&draft).await?;
    Ok((StatusCode::CREATED, Json(policy)))
}

async fn get_policy(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.policies.get(id).await?))
}

async fn update_policy(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(draft): Json<PolicyDraft>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.policies.update(id, &draft).await?))
}

async fn delete_policy(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<impl IntoResponse> {
    state.policies.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn enable_policy(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.policies.set_enabled(id, true).await?))
}

async fn disable_policy(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.policies.set_enabled(id, false).await?))
}

// ── Records ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct IngestRequest {
    records: Vec<InboundRecord>,
}

async fn ingest_records(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> ApiResult<impl IntoResponse> {
    let report = state.processor.ingest(request.records).await?;
    Ok(Json(report))
}

// ── Proposals ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ProposalListQuery {
    status: Option<ActionStatus>,
    limit: Option<usize>,
}

async fn list_proposals(
    State(state): State<AppState>,
    Query(query): Query<ProposalListQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.approvals.list(query.status, query.limit).await?))
}

async fn get_proposal(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    let id = parse_proposal_id(&id)?;
    Ok(Json(state.approvals.get(id).await?))
}

/// Optional body for approve/reject.
#[derive(Debug, Default, Deserialize)]
struct DecisionBody {
    decided_by: Option<String>,
    reason: Option<String>,
}

fn decision_body(body: &Bytes) -> ApiResult<DecisionBody> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(DecisionBody::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("Invalid body: {e}")))
}

async fn approve_proposal(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let id = parse_proposal_id(&id)?;
    let body = decision_body(&body)?;
    let action = state.approvals.approve(id, body.decided_by.as_deref()).await?;
    info!(proposal_id = %id, status = %action.status, "Proposal decided via API");
    Ok(Json(action))
}

async fn reject_proposal(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let id = parse_proposal_id(&id)?;
    let body = decision_body(&body)?;
    let action = state
        .approvals
        .reject(id, body.decided_by.as_deref(), body.reason.as_deref())
        .await?;
    Ok(Json(action))
}

async fn retry_proposal(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    let id = parse_proposal_id(&id)?;
    let retry = state.approvals.retry(id).await?;
    Ok((StatusCode::CREATED, Json(retry)))
}

// ── Audit ───────────────────────────────────────────────────────────────

async fn query_audit(
    State(state): State<AppState>,
    Query(filter): Query<AuditFilter>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.audit.query(&filter).await?))
}

// ── Simulation ──────────────────────────────────────────────────────────

async fn simulate(
    State(state): State<AppState>,
    Json(request): Json<DryRunRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.simulator.dry_run(request).await?))
}
