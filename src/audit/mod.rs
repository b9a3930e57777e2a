//! Audit trail: one append-only record per terminal proposal transition.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::approval::model::{ActionStatus, ProposedAction};
use crate::error::DatabaseError;
use crate::executor::ExecutionOutcome;
use crate::store::Database;

/// Default and maximum page size for audit queries.
pub const DEFAULT_AUDIT_LIMIT: usize = 100;
pub const MAX_AUDIT_LIMIT: usize = 1000;

/// Who caused a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Actor {
    System,
    User { id: String },
}

/// Reviewer id recorded when a human decision carries no `decided_by`.
pub const ANONYMOUS_REVIEWER: &str = "anonymous";

impl Actor {
    /// Actor for a human approve or reject. A missing or blank reviewer id is
    /// still a user decision, recorded as [`ANONYMOUS_REVIEWER`].
    pub fn from_decided_by(decided_by: Option<&str>) -> Self {
        let id = decided_by
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(ANONYMOUS_REVIEWER);
        Self::User { id: id.to_string() }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => f.write_str("system"),
            Self::User { id } => write!(f, "user:{id}"),
        }
    }
}

/// An immutable audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub proposed_action_id: Option<Uuid>,
    pub action_type: String,
    pub actor: Actor,
    pub policy_id: Option<i64>,
    pub confidence: f64,
    pub rationale: String,
    /// Terminal status the proposal reached.
    pub outcome: ActionStatus,
    pub payload: Value,
    /// External id of the record the decision concerned.
    pub evidence_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    fn base(action: &ProposedAction, actor: Actor, outcome: ActionStatus, payload: Value, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            proposed_action_id: Some(action.id),
            action_type: action.action_type.clone(),
            actor,
            policy_id: action.policy_id,
            confidence: action.confidence,
            rationale: action.rationale.clone(),
            outcome,
            payload,
            evidence_ref: Some(action.record_id.clone()),
            created_at: now,
        }
    }

    /// Entry for an approved action that ran.
    pub fn for_execution(
        action: &ProposedAction,
        actor: Actor,
        outcome: &ExecutionOutcome,
        now: DateTime<Utc>,
    ) -> Self {
        let status = if outcome.success {
            ActionStatus::Executed
        } else {
            ActionStatus::Failed
        };
        let payload = json!({
            "success": outcome.success,
            "error": outcome.error,
            "response": outcome.response,
            "params": action.params,
        });
        Self::base(action, actor, status, payload, now)
    }

    /// Entry for a rejected proposal.
    pub fn for_rejection(
        action: &ProposedAction,
        actor: Actor,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::base(action, actor, ActionStatus::Rejected, json!({ "reason": reason }), now)
    }
}

/// Audit query filter. Date bounds are inclusive.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditFilter {
    pub action_type: Option<String>,
    pub status: Option<ActionStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_AUDIT_LIMIT)
            .clamp(1, MAX_AUDIT_LIMIT)
    }
}

/// Read side of the audit trail. Writes happen inside status transitions.
pub struct AuditLog {
    store: Arc<dyn Database>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    /// Newest first.
    pub async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, DatabaseError> {
        self.store.list_audit_records(filter).await
    }

    pub async fn for_proposal(&self, id: Uuid) -> Result<Vec<AuditRecord>, DatabaseError> {
        self.store.audit_records_for_proposal(id).await
    }
}
