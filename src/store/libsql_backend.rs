//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. A single connection is shared
//! by all callers; writes are serialized behind `write_lock` so a transaction
//! never absorbs another task's statements.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, TransactionBehavior, params};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::approval::model::{ActionStatus, ProposedAction};
use crate::audit::{Actor, AuditFilter, AuditRecord};
use crate::error::DatabaseError;
use crate::policy::condition::Condition;
use crate::policy::{Policy, PolicySpec};
use crate::store::migrations;
use crate::store::traits::{Database, Transition};

const POLICY_COLUMNS: &str = "id, name, priority, enabled, condition, action_type, action_params, \
     confidence_threshold, rationale_template, created_at, updated_at";

const PROPOSAL_COLUMNS: &str = "id, record_id, record_summary, action_type, params, policy_id, \
     confidence, rationale, status, created_at, decided_at, decided_by, error, retry_of";

const AUDIT_COLUMNS: &str = "id, proposed_action_id, action_type, actor, policy_id, confidence, \
     rationale, outcome, payload, evidence_ref, created_at";

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests and dry runs).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: fixed-width RFC 3339 so text order is time order.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Serialization(format!("bad timestamp '{s}': {e}")))
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid '{s}': {e}")))
}

fn parse_json(s: &str) -> Result<Value, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(format!("bad json: {e}")))
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_integer(n: Option<i64>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(n),
        None => libsql::Value::Null,
    }
}

fn query_err(op: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

fn row_to_policy(row: &libsql::Row) -> Result<Policy, DatabaseError> {
    let col = |e: libsql::Error| DatabaseError::Query(format!("policy row: {e}"));

    let id: i64 = row.get(0).map_err(col)?;
    let condition_json: String = row.get(4).map_err(col)?;
    let condition = Condition::from_value(&parse_json(&condition_json)?).map_err(|e| {
        DatabaseError::Serialization(format!("policy {id} has an invalid condition: {e}"))
    })?;
    let params_json: String = row.get(6).map_err(col)?;
    let created: String = row.get(9).map_err(col)?;
    let updated: String = row.get(10).map_err(col)?;

    Ok(Policy {
        id,
        name: row.get(1).map_err(col)?,
        priority: row.get(2).map_err(col)?,
        enabled: row.get::<i64>(3).map_err(col)? != 0,
        condition,
        action_type: row.get(5).map_err(col)?,
        action_params: parse_json(&params_json)?,
        confidence_threshold: row.get(7).map_err(col)?,
        rationale_template: row.get(8).map_err(col)?,
        created_at: parse_datetime(&created)?,
        updated_at: parse_datetime(&updated)?,
    })
}

fn row_to_proposal(row: &libsql::Row) -> Result<ProposedAction, DatabaseError> {
    let col = |e: libsql::Error| DatabaseError::Query(format!("proposal row: {e}"));

    let id: String = row.get(0).map_err(col)?;
    let summary_json: String = row.get(2).map_err(col)?;
    let record_summary = match parse_json(&summary_json)? {
        Value::Object(map) => map,
        _ => Default::default(),
    };
    let params_json: String = row.get(4).map_err(col)?;
    let status_str: String = row.get(8).map_err(col)?;
    let created: String = row.get(9).map_err(col)?;
    let decided_at = match row.get::<String>(10).ok() {
        Some(s) => Some(parse_datetime(&s)?),
        None => None,
    };
    let retry_of = match row.get::<String>(13).ok() {
        Some(s) => Some(parse_uuid(&s)?),
        None => None,
    };

    Ok(ProposedAction {
        id: parse_uuid(&id)?,
        record_id: row.get(1).map_err(col)?,
        record_summary,
        action_type: row.get(3).map_err(col)?,
        params: parse_json(&params_json)?,
        policy_id: row.get::<i64>(5).ok(),
        confidence: row.get(6).map_err(col)?,
        rationale: row.get(7).map_err(col)?,
        status: status_str.parse().map_err(DatabaseError::Serialization)?,
        created_at: parse_datetime(&created)?,
        decided_at,
        decided_by: row.get::<String>(11).ok(),
        error: row.get::<String>(12).ok(),
        retry_of,
    })
}

fn row_to_audit(row: &libsql::Row) -> Result<AuditRecord, DatabaseError> {
    let col = |e: libsql::Error| DatabaseError::Query(format!("audit row: {e}"));

    let id: String = row.get(0).map_err(col)?;
    let proposed_action_id = match row.get::<String>(1).ok() {
        Some(s) => Some(parse_uuid(&s)?),
        None => None,
    };
    let actor_json: String = row.get(3).map_err(col)?;
    let actor: Actor = serde_json::from_str(&actor_json)
        .map_err(|e| DatabaseError::Serialization(format!("bad actor: {e}")))?;
    let outcome: String = row.get(7).map_err(col)?;
    let payload_json: String = row.get(8).map_err(col)?;
    let created: String = row.get(10).map_err(col)?;

    Ok(AuditRecord {
        id: parse_uuid(&id)?,
        proposed_action_id,
        action_type: row.get(2).map_err(col)?,
        actor,
        policy_id: row.get::<i64>(4).ok(),
        confidence: row.get(5).map_err(col)?,
        rationale: row.get(6).map_err(col)?,
        outcome: outcome.parse().map_err(DatabaseError::Serialization)?,
        payload: parse_json(&payload_json)?,
        evidence_ref: row.get::<String>(9).ok(),
        created_at: parse_datetime(&created)?,
    })
}

/// CAS update shared by the plain and audited transitions. Returns the row as
/// written, or `None` when it was not in `t.from`.
async fn apply_transition(
    conn: &Connection,
    t: &Transition<'_>,
) -> Result<Option<ProposedAction>, DatabaseError> {
    if !t.from.can_transition_to(t.to) {
        return Err(DatabaseError::Query(format!(
            "transition_proposal: {} -> {} is not a valid transition",
            t.from, t.to
        )));
    }

    let mut rows = conn
        .query(
            &format!(
                "UPDATE proposed_actions
                 SET status = ?1,
                     decided_at = COALESCE(?2, decided_at),
                     decided_by = COALESCE(?3, decided_by),
                     error = ?4
                 WHERE id = ?5 AND status = ?6
                 RETURNING {PROPOSAL_COLUMNS}"
            ),
            params![
                t.to.as_str(),
                opt_text(t.decided_at.as_ref().map(format_datetime).as_deref()),
                opt_text(t.decided_by),
                opt_text(t.error),
                t.id.to_string(),
                t.from.as_str(),
            ],
        )
        .await
        .map_err(query_err("transition_proposal"))?;

    let updated = match rows.next().await.map_err(query_err("transition_proposal"))? {
        Some(row) => Some(row_to_proposal(&row)?),
        None => None,
    };
    while rows.next().await.map_err(query_err("transition_proposal"))?.is_some() {}
    Ok(updated)
}

async fn insert_audit(conn: &Connection, record: &AuditRecord) -> Result<(), DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO audit_records ({AUDIT_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ),
        params![
            record.id.to_string(),
            opt_text(record.proposed_action_id.map(|id| id.to_string()).as_deref()),
            record.action_type.as_str(),
            to_json(&record.actor)?,
            opt_integer(record.policy_id),
            record.confidence,
            record.rationale.as_str(),
            record.outcome.as_str(),
            to_json(&record.payload)?,
            opt_text(record.evidence_ref.as_deref()),
            format_datetime(&record.created_at),
        ],
    )
    .await
    .map_err(query_err("insert_audit"))?;
    Ok(())
}

async fn collect_audit(mut rows: libsql::Rows) -> Result<Vec<AuditRecord>, DatabaseError> {
    let mut records = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err("audit rows"))? {
        records.push(row_to_audit(&row)?);
    }
    Ok(records)
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Policies ────────────────────────────────────────────────────

    async fn insert_policy(&self, spec: &PolicySpec) -> Result<Policy, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let conn = self.conn();
        let now = Utc::now();
        let stamp = format_datetime(&now);

        conn.execute(
            "INSERT INTO policies (name, priority, enabled, condition, action_type, action_params, \
             confidence_threshold, rationale_template, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                spec.name.as_str(),
                spec.priority,
                spec.enabled as i64,
                to_json(&spec.condition)?,
                spec.action_type.as_str(),
                to_json(&spec.action_params)?,
                spec.confidence_threshold,
                spec.rationale_template.as_str(),
                stamp.as_str(),
                stamp.as_str(),
            ],
        )
        .await
        .map_err(query_err("insert_policy"))?;

        let id = conn.last_insert_rowid();
        debug!(policy_id = id, name = %spec.name, "Policy inserted");
        Ok(spec.clone().into_policy(id, parse_datetime(&stamp)?, parse_datetime(&stamp)?))
    }

    async fn update_policy(&self, id: i64, spec: &PolicySpec) -> Result<Option<Policy>, DatabaseError> {
        {
            let _guard = self.write_lock.lock().await;
            let changed = self
                .conn()
                .execute(
                    "UPDATE policies SET name = ?1, priority = ?2, enabled = ?3, condition = ?4, \
                     action_type = ?5, action_params = ?6, confidence_threshold = ?7, \
                     rationale_template = ?8, updated_at = ?9 WHERE id = ?10",
                    params![
                        spec.name.as_str(),
                        spec.priority,
                        spec.enabled as i64,
                        to_json(&spec.condition)?,
                        spec.action_type.as_str(),
                        to_json(&spec.action_params)?,
                        spec.confidence_threshold,
                        spec.rationale_template.as_str(),
                        format_datetime(&Utc::now()),
                        id,
                    ],
                )
                .await
                .map_err(query_err("update_policy"))?;
            if changed == 0 {
                return Ok(None);
            }
        }
        self.get_policy(id).await
    }

    async fn get_policy(&self, id: i64) -> Result<Option<Policy>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {POLICY_COLUMNS} FROM policies WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(query_err("get_policy"))?;

        match rows.next().await.map_err(query_err("get_policy"))? {
            Some(row) => Ok(Some(row_to_policy(&row)?)),
            None => Ok(None),
        }
    }

    async fn delete_policy(&self, id: i64) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn()
            .execute("DELETE FROM policies WHERE id = ?1", params![id])
            .await
            .map_err(query_err("delete_policy"))?;
        Ok(changed > 0)
    }

    async fn list_policies(&self, enabled_only: bool) -> Result<Vec<Policy>, DatabaseError> {
        let filter = if enabled_only { "WHERE enabled = 1" } else { "" };
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {POLICY_COLUMNS} FROM policies {filter} ORDER BY priority ASC, id ASC"),
                (),
            )
            .await
            .map_err(query_err("list_policies"))?;

        let mut policies = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_policies"))? {
            match row_to_policy(&row) {
                Ok(policy) => policies.push(policy),
                Err(e) => warn!(error = %e, "Skipping unreadable policy row"),
            }
        }
        Ok(policies)
    }

    async fn set_policy_enabled(&self, id: i64, enabled: bool) -> Result<Option<Policy>, DatabaseError> {
        {
            let _guard = self.write_lock.lock().await;
            let changed = self
                .conn()
                .execute(
                    "UPDATE policies SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
                    params![enabled as i64, format_datetime(&Utc::now()), id],
                )
                .await
                .map_err(query_err("set_policy_enabled"))?;
            if changed == 0 {
                return Ok(None);
            }
        }
        self.get_policy(id).await
    }

    // ── Proposed actions ────────────────────────────────────────────

    async fn insert_proposal(&self, action: &ProposedAction) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO proposed_actions ({PROPOSAL_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    action.id.to_string(),
                    action.record_id.as_str(),
                    to_json(&action.record_summary)?,
                    action.action_type.as_str(),
                    to_json(&action.params)?,
                    opt_integer(action.policy_id),
                    action.confidence,
                    action.rationale.as_str(),
                    action.status.as_str(),
                    format_datetime(&action.created_at),
                    opt_text(action.decided_at.as_ref().map(format_datetime).as_deref()),
                    opt_text(action.decided_by.as_deref()),
                    opt_text(action.error.as_deref()),
                    opt_text(action.retry_of.map(|id| id.to_string()).as_deref()),
                ],
            )
            .await
            .map_err(query_err("insert_proposal"))?;

        if changed == 0 {
            debug!(record_id = %action.record_id, policy_id = ?action.policy_id, "Pending proposal already exists");
        }
        Ok(changed == 1)
    }

    async fn get_proposal(&self, id: Uuid) -> Result<Option<ProposedAction>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {PROPOSAL_COLUMNS} FROM proposed_actions WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_proposal"))?;

        match rows.next().await.map_err(query_err("get_proposal"))? {
            Some(row) => Ok(Some(row_to_proposal(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_proposals(
        &self,
        status: Option<ActionStatus>,
        limit: usize,
    ) -> Result<Vec<ProposedAction>, DatabaseError> {
        let limit = limit as i64;
        let mut rows = match status {
            Some(status) => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {PROPOSAL_COLUMNS} FROM proposed_actions WHERE status = ?1 \
                             ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                        ),
                        params![status.as_str(), limit],
                    )
                    .await
            }
            None => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {PROPOSAL_COLUMNS} FROM proposed_actions \
                             ORDER BY created_at DESC, rowid DESC LIMIT ?1"
                        ),
                        params![limit],
                    )
                    .await
            }
        }
        .map_err(query_err("list_proposals"))?;

        let mut proposals = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_proposals"))? {
            proposals.push(row_to_proposal(&row)?);
        }
        Ok(proposals)
    }

    async fn transition_proposal(
        &self,
        transition: &Transition<'_>,
    ) -> Result<Option<ProposedAction>, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let updated = apply_transition(self.conn(), transition).await?;
        debug!(
            proposal_id = %transition.id,
            from = %transition.from,
            to = %transition.to,
            applied = updated.is_some(),
            "Proposal transition"
        );
        Ok(updated)
    }

    async fn transition_with_audit(
        &self,
        transition: &Transition<'_>,
        audit: &AuditRecord,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(query_err("begin transaction"))?;

        if apply_transition(&tx, transition).await?.is_none() {
            tx.rollback().await.map_err(query_err("rollback"))?;
            return Ok(false);
        }
        insert_audit(&tx, audit).await?;
        tx.commit().await.map_err(query_err("commit"))?;

        debug!(
            proposal_id = %transition.id,
            to = %transition.to,
            audit_id = %audit.id,
            "Proposal transition audited"
        );
        Ok(true)
    }

    // ── Audit ───────────────────────────────────────────────────────

    async fn list_audit_records(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, DatabaseError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<libsql::Value> = Vec::new();

        if let Some(action_type) = &filter.action_type {
            args.push(libsql::Value::Text(action_type.clone()));
            clauses.push(format!("action_type = ?{}", args.len()));
        }
        if let Some(status) = filter.status {
            args.push(libsql::Value::Text(status.as_str().to_string()));
            clauses.push(format!("outcome = ?{}", args.len()));
        }
        if let Some(from) = &filter.from {
            args.push(libsql::Value::Text(format_datetime(from)));
            clauses.push(format!("created_at >= ?{}", args.len()));
        }
        if let Some(to) = &filter.to {
            args.push(libsql::Value::Text(format_datetime(to)));
            clauses.push(format!("created_at <= ?{}", args.len()));
        }
        args.push(libsql::Value::Integer(filter.effective_limit() as i64));
        let limit_param = args.len();

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_records {where_clause} \
             ORDER BY created_at DESC, rowid DESC LIMIT ?{limit_param}"
        );

        let rows = self
            .conn()
            .query(&sql, args)
            .await
            .map_err(query_err("list_audit_records"))?;
        collect_audit(rows).await
    }

    async fn audit_records_for_proposal(&self, id: Uuid) -> Result<Vec<AuditRecord>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {AUDIT_COLUMNS} FROM audit_records WHERE proposed_action_id = ?1 \
                     ORDER BY created_at ASC, rowid ASC"
                ),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("audit_records_for_proposal"))?;
        collect_audit(rows).await
    }
}
