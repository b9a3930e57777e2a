//! Evaluation context: the attribute mapping conditions are evaluated against.
//!
//! One [`ContextBuilder`] is created per evaluation batch and stamps the same
//! instant into every context it builds. The evaluator resolves the literal
//! `"now"` against that instant and never reads a clock itself.

use std::borrow::Cow;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::debug;

use crate::pipeline::types::InboundRecord;
use crate::policy::condition::FieldPath;

/// Reserved key holding the batch instant.
pub const NOW_KEY: &str = "now";

/// Reserved key holding the record's external id.
pub const RECORD_ID_KEY: &str = "record_id";

/// Attribute mapping for one record within one evaluation run.
#[derive(Debug, Clone)]
pub struct Context {
    values: Map<String, Value>,
    now: DateTime<Utc>,
}

impl Context {
    /// Build a context directly from a mapping. Reserved keys are overwritten.
    pub fn new(mut values: Map<String, Value>, now: DateTime<Utc>) -> Self {
        values.insert(NOW_KEY.to_string(), stamp(now));
        Self { values, now }
    }

    /// Resolve a parsed field path. `None` when any segment is missing.
    pub fn resolve(&self, path: &FieldPath) -> Option<&Value> {
        let mut segments = path.segments().iter();
        let first = segments.next()?;
        let mut current = self.values.get(first)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Resolve a dotted path given as a string.
    pub fn lookup(&self, dotted: &str) -> Option<&Value> {
        FieldPath::parse(dotted).and_then(|path| self.resolve(&path))
    }

    /// Substitute the `"now"` literal in a right-hand operand.
    pub(crate) fn operand<'a>(&self, value: &'a Value) -> Cow<'a, Value> {
        match value {
            Value::String(s) if s == NOW_KEY => Cow::Owned(stamp(self.now)),
            _ => Cow::Borrowed(value),
        }
    }
}

/// Builds contexts for a batch, all sharing one instant.
#[derive(Debug, Clone, Copy)]
pub struct ContextBuilder {
    now: DateTime<Utc>,
}

impl ContextBuilder {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now }
    }

    /// Assemble the context for one record.
    ///
    /// Adds `record_id`, derives `sender_domain` from `sender` when the
    /// upstream classifier did not supply it, and stamps `now`.
    pub fn build(&self, record: &InboundRecord) -> Context {
        let mut values = record.attributes.clone();

        for reserved in [NOW_KEY, RECORD_ID_KEY] {
            if values.contains_key(reserved) {
                debug!(record_id = %record.id, key = reserved, "Record attribute shadows reserved key");
            }
        }
        values.insert(RECORD_ID_KEY.to_string(), Value::String(record.id.clone()));

        if !values.contains_key("sender_domain")
            && let Some(domain) = values
                .get("sender")
                .and_then(Value::as_str)
                .and_then(sender_domain)
        {
            values.insert("sender_domain".to_string(), Value::String(domain));
        }

        Context::new(values, self.now)
    }
}

/// Full-precision RFC 3339 rendering of the batch instant. Fractional
/// seconds are kept so same-second comparisons against `"now"` stay ordered.
fn stamp(now: DateTime<Utc>) -> Value {
    Value::String(now.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

/// Extract the lowercase domain from `alice@example.com` or `Alice <alice@example.com>`.
fn sender_domain(sender: &str) -> Option<String> {
    let address = match (sender.rfind('<'), sender.rfind('>')) {
        (Some(start), Some(end)) if start < end => &sender[start + 1..end],
        _ => sender,
    };
    let (_, domain) = address.trim().rsplit_once('@')?;
    let domain = domain.trim();
    if domain.is_empty() {
        None
    } else {
        Some(domain.to_lowercase())
    }
}
