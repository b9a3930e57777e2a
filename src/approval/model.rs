//! Proposed action data model and the events broadcast to reviewers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::pipeline::engine::ProposalDraft;
use crate::pipeline::types::RecordSnapshot;

/// Lifecycle status of a proposed action.
///
/// ```text
/// pending ──approve──▶ approved ──▶ executed
///    │                    └───────▶ failed ──retry──▶ (new pending)
///    └──reject──▶ rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Waiting for a human decision.
    Pending,
    /// Approved; execution in progress.
    Approved,
    /// Executor reported success.
    Executed,
    /// Executor reported failure.
    Failed,
    /// Human rejected the proposal.
    Rejected,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Executed => "executed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: ActionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Approved)
                | (Self::Pending, Self::Rejected)
                | (Self::Approved, Self::Executed)
                | (Self::Approved, Self::Failed)
        )
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "executed" => Ok(Self::Executed),
            "failed" => Ok(Self::Failed),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown action status '{other}'")),
        }
    }
}

/// A proposed action awaiting (or past) human review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedAction {
    pub id: Uuid,
    /// External id of the record this proposal acts on.
    pub record_id: String,
    /// Summary attributes shown to the reviewer.
    pub record_summary: Map<String, Value>,
    pub action_type: String,
    pub params: Value,
    /// Originating policy. Kept after the policy is deleted.
    pub policy_id: Option<i64>,
    pub confidence: f64,
    pub rationale: String,
    pub status: ActionStatus,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decided_by: Option<String>,
    /// Executor error for failed actions.
    pub error: Option<String>,
    /// The failed proposal this one retries.
    pub retry_of: Option<Uuid>,
}

impl ProposedAction {
    /// A fresh pending proposal from an engine match.
    pub fn pending(draft: ProposalDraft, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            record_id: draft.record.record_id,
            record_summary: draft.record.summary,
            action_type: draft.action_type,
            params: draft.params,
            policy_id: Some(draft.policy_id),
            confidence: draft.confidence,
            rationale: draft.rationale,
            status: ActionStatus::Pending,
            created_at: now,
            decided_at: None,
            decided_by: None,
            error: None,
            retry_of: None,
        }
    }

    /// A new pending proposal that re-attempts this one.
    pub fn retried(&self, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: ActionStatus::Pending,
            created_at: now,
            decided_at: None,
            decided_by: None,
            error: None,
            retry_of: Some(self.id),
            ..self.clone()
        }
    }

    /// The record view handed to executors.
    pub fn record(&self) -> RecordSnapshot {
        RecordSnapshot {
            record_id: self.record_id.clone(),
            summary: self.record_summary.clone(),
        }
    }
}

/// Events broadcast to review clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProposalEvent {
    /// All pending proposals (sent on connect).
    PendingSync { proposals: Vec<ProposedAction> },
    /// A new proposal was created.
    Proposed { proposal: ProposedAction },
    /// A proposal changed status.
    StatusChanged {
        id: Uuid,
        status: ActionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}
