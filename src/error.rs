//! Error types for the policy engine.

use uuid::Uuid;

use crate::approval::model::ActionStatus;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Static validation failures for a condition tree.
///
/// `path` locates the offending node, e.g. `all[1].op`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionError {
    #[error("{path}: unknown operator '{op}'")]
    UnknownOperator { path: String, op: String },

    #[error("{path}: operator '{op}' requires a value")]
    MissingValue { path: String, op: String },

    #[error("{path}: {reason}")]
    Malformed { path: String, reason: String },

    #[error("{path}: invalid regex: {reason}")]
    InvalidRegex { path: String, reason: String },

    #[error("{path}: condition nested deeper than {max} levels")]
    TooDeep { path: String, max: usize },
}

/// Policy authoring errors.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Invalid condition: {0}")]
    Condition(#[from] ConditionError),

    #[error("Invalid policy field {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Policy {id} not found")]
    NotFound { id: i64 },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Approval state machine errors.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("Proposed action {id} not found")]
    NotFound { id: Uuid },

    #[error("Proposed action {id} is {status}, cannot transition to {target}")]
    Conflict {
        id: Uuid,
        status: ActionStatus,
        target: ActionStatus,
    },

    #[error("Record {record_id} already has a pending proposal from this policy")]
    DuplicatePending { record_id: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}
