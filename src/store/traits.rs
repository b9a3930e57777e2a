//! `Database` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::approval::model::{ActionStatus, ProposedAction};
use crate::audit::{AuditFilter, AuditRecord};
use crate::error::DatabaseError;
use crate::policy::{Policy, PolicySpec};

/// A compare-and-set status change on a proposed action.
///
/// Applied only when the stored status still equals `from`. `decided_by` and
/// `decided_at` are left untouched when `None`.
#[derive(Debug, Clone)]
pub struct Transition<'a> {
    pub id: Uuid,
    pub from: ActionStatus,
    pub to: ActionStatus,
    pub decided_by: Option<&'a str>,
    pub decided_at: Option<DateTime<Utc>>,
    pub error: Option<&'a str>,
}

/// Backend-agnostic database trait covering policies, proposals, and audit.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Policies ────────────────────────────────────────────────────

    /// Insert a validated policy; the store assigns the id.
    async fn insert_policy(&self, spec: &PolicySpec) -> Result<Policy, DatabaseError>;

    /// Replace a policy's body. `None` when the id is unknown.
    async fn update_policy(&self, id: i64, spec: &PolicySpec) -> Result<Option<Policy>, DatabaseError>;

    async fn get_policy(&self, id: i64) -> Result<Option<Policy>, DatabaseError>;

    /// Permanently delete a policy. Returns whether a row was removed.
    async fn delete_policy(&self, id: i64) -> Result<bool, DatabaseError>;

    /// Policies in (priority, id) order.
    async fn list_policies(&self, enabled_only: bool) -> Result<Vec<Policy>, DatabaseError>;

    async fn set_policy_enabled(&self, id: i64, enabled: bool) -> Result<Option<Policy>, DatabaseError>;

    // ── Proposed actions ────────────────────────────────────────────

    /// Insert a proposal. Returns `false` when the record already has a
    /// pending proposal from the same policy.
    async fn insert_proposal(&self, action: &ProposedAction) -> Result<bool, DatabaseError>;

    async fn get_proposal(&self, id: Uuid) -> Result<Option<ProposedAction>, DatabaseError>;

    /// Newest first, optionally filtered by status.
    async fn list_proposals(
        &self,
        status: Option<ActionStatus>,
        limit: usize,
    ) -> Result<Vec<ProposedAction>, DatabaseError>;

    /// Apply a status change and return the updated row, or `None` when the
    /// CAS lost. Errors on a pair that is not an edge of the state machine.
    async fn transition_proposal(
        &self,
        transition: &Transition<'_>,
    ) -> Result<Option<ProposedAction>, DatabaseError>;

    /// Apply a status change and append its audit record atomically.
    async fn transition_with_audit(
        &self,
        transition: &Transition<'_>,
        audit: &AuditRecord,
    ) -> Result<bool, DatabaseError>;

    // ── Audit ───────────────────────────────────────────────────────

    /// Newest first.
    async fn list_audit_records(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, DatabaseError>;

    async fn audit_records_for_proposal(&self, id: Uuid) -> Result<Vec<AuditRecord>, DatabaseError>;
}
