//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;
use tracing::info;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS policies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                condition TEXT NOT NULL,
                action_type TEXT NOT NULL,
                action_params TEXT NOT NULL DEFAULT '{}',
                confidence_threshold REAL NOT NULL,
                rationale_template TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_policies_order ON policies(priority, id);

            CREATE TABLE IF NOT EXISTS proposed_actions (
                id TEXT PRIMARY KEY,
                record_id TEXT NOT NULL,
                record_summary TEXT NOT NULL DEFAULT '{}',
                action_type TEXT NOT NULL,
                params TEXT NOT NULL DEFAULT '{}',
                policy_id INTEGER,
                confidence REAL NOT NULL,
                rationale TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                decided_at TEXT,
                decided_by TEXT,
                error TEXT,
                retry_of TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_proposed_actions_status ON proposed_actions(status, created_at);
            CREATE INDEX IF NOT EXISTS idx_proposed_actions_record ON proposed_actions(record_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_proposed_actions_pending_unique
                ON proposed_actions(record_id, policy_id) WHERE status = 'pending';

            CREATE TABLE IF NOT EXISTS audit_records (
                id TEXT PRIMARY KEY,
                proposed_action_id TEXT,
                action_type TEXT NOT NULL,
                actor TEXT NOT NULL,
                policy_id INTEGER,
                confidence REAL NOT NULL,
                rationale TEXT NOT NULL,
                outcome TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{}',
                evidence_ref TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_records_action_type ON audit_records(action_type);
            CREATE INDEX IF NOT EXISTS idx_audit_records_outcome ON audit_records(outcome);
            CREATE INDEX IF NOT EXISTS idx_audit_records_created ON audit_records(created_at);
            CREATE INDEX IF NOT EXISTS idx_audit_records_proposal ON audit_records(proposed_action_id);
        "#,
    },
    Migration {
        version: 2,
        name: "audit_append_only",
        sql: r#"
            CREATE TRIGGER IF NOT EXISTS audit_records_no_update
            BEFORE UPDATE ON audit_records
            BEGIN
                SELECT RAISE(ABORT, 'audit records are append-only');
            END;

            CREATE TRIGGER IF NOT EXISTS audit_records_no_delete
            BEFORE DELETE ON audit_records
            BEGIN
                SELECT RAISE(ABORT, 'audit records are append-only');
            END;
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    info!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
