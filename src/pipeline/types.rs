//! Shared types for the proposal pipeline.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::pipeline::context::Context;

/// Attributes copied onto a proposal for human review.
///
/// Bodies and feature maps stay behind; reviewers see enough to decide.
pub const SUMMARY_FIELDS: &[&str] = &[
    "sender",
    "sender_domain",
    "subject",
    "category",
    "risk_score",
    "received_at",
];

// ── Inbound record ──────────────────────────────────────────────────

/// A classified record supplied by the upstream collaborator.
///
/// `attributes` holds the derived fields (category, risk score, timestamps,
/// sender, nested feature maps) that conditions are evaluated against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundRecord {
    /// Stable external identifier.
    pub id: String,
    /// Derived attributes.
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl InboundRecord {
    /// Build a record from an id and a JSON object of attributes.
    ///
    /// Non-object `attributes` produce an empty mapping.
    pub fn new(id: impl Into<String>, attributes: Value) -> Self {
        let attributes = match attributes {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            id: id.into(),
            attributes,
        }
    }
}

// ── Record snapshot ─────────────────────────────────────────────────

/// The bounded view of a record that travels with a proposal.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordSnapshot {
    pub record_id: String,
    #[serde(default)]
    pub summary: Map<String, Value>,
}

impl RecordSnapshot {
    /// Take the summary fields out of an evaluation context.
    pub fn from_context(record_id: impl Into<String>, ctx: &Context) -> Self {
        let summary = SUMMARY_FIELDS
            .iter()
            .filter_map(|key| ctx.lookup(key).map(|v| ((*key).to_string(), v.clone())))
            .collect();
        Self {
            record_id: record_id.into(),
            summary,
        }
    }
}
