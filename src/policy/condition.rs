//! Condition trees: the boolean expressions policies match records with.
//!
//! Authors write conditions as JSON:
//!
//! ```json
//! {"all": [
//!     {"field": "category", "op": "eq", "value": "promotions"},
//!     {"not": {"field": "sender_domain", "op": "in", "value": ["bank.com"]}}
//! ]}
//! ```
//!
//! Inside the engine that JSON becomes a closed [`Condition`] tree with one
//! typed [`Predicate`] per operator. Parsing doubles as static validation, so
//! a `Condition` value is always well-formed.

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::ConditionError;

/// Maximum nesting depth accepted by the parser.
pub const MAX_DEPTH: usize = 32;

const ROOT_PATH: &str = "$";

/// A parsed, well-formed condition tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Every child must hold. Empty ⇒ `true`.
    All(Vec<Condition>),
    /// At least one child must hold. Empty ⇒ `false`.
    Any(Vec<Condition>),
    /// Negation of one nested condition.
    Not(Box<Condition>),
    /// A comparison against one context attribute.
    Leaf(Leaf),
}

/// A comparison leaf: `{field, op, value}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Leaf {
    pub field: FieldPath,
    pub predicate: Predicate,
}

/// The closed set of leaf operators, each carrying its right-hand operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(Value),
    Neq(Value),
    Lt(Value),
    Lte(Value),
    Gt(Value),
    Gte(Value),
    In(Vec<Value>),
    Contains(Value),
    Regex(Pattern),
    /// `true` tests presence, `false` tests absence.
    Exists(bool),
}

/// Operator names as they appear in the authoring format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    Contains,
    Regex,
    Exists,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::In => "in",
            Self::Contains => "contains",
            Self::Regex => "regex",
            Self::Exists => "exists",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" => Ok(Self::Eq),
            "neq" => Ok(Self::Neq),
            "lt" => Ok(Self::Lt),
            "lte" => Ok(Self::Lte),
            "gt" => Ok(Self::Gt),
            "gte" => Ok(Self::Gte),
            "in" => Ok(Self::In),
            "contains" => Ok(Self::Contains),
            "regex" => Ok(Self::Regex),
            "exists" => Ok(Self::Exists),
            _ => Err(format!("Unknown operator: {}", s)),
        }
    }
}

impl Predicate {
    pub fn operator(&self) -> Operator {
        match self {
            Self::Eq(_) => Operator::Eq,
            Self::Neq(_) => Operator::Neq,
            Self::Lt(_) => Operator::Lt,
            Self::Lte(_) => Operator::Lte,
            Self::Gt(_) => Operator::Gt,
            Self::Gte(_) => Operator::Gte,
            Self::In(_) => Operator::In,
            Self::Contains(_) => Operator::Contains,
            Self::Regex(_) => Operator::Regex,
            Self::Exists(_) => Operator::Exists,
        }
    }

    /// The operand in authoring form.
    fn operand(&self) -> Value {
        match self {
            Self::Eq(v)
            | Self::Neq(v)
            | Self::Lt(v)
            | Self::Lte(v)
            | Self::Gt(v)
            | Self::Gte(v)
            | Self::Contains(v) => v.clone(),
            Self::In(items) => Value::Array(items.clone()),
            Self::Regex(p) => Value::String(p.as_str().to_string()),
            Self::Exists(expected) => Value::Bool(*expected),
        }
    }
}

/// A compiled regex, compared by its source pattern.
#[derive(Debug, Clone)]
pub struct Pattern(Regex);

impl Pattern {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Search semantics: matches anywhere in `haystack`.
    pub fn is_match(&self, haystack: &str) -> bool {
        self.0.is_match(haystack)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

/// A dot-separated attribute path such as `features.links.0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    raw: String,
    segments: Vec<String>,
}

impl FieldPath {
    pub fn parse(raw: &str) -> Option<Self> {
        let segments: Vec<String> = raw.split('.').map(str::to_string).collect();
        if raw.is_empty() || segments.iter().any(|s| s.is_empty()) {
            return None;
        }
        Some(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Condition {
    /// Parse and validate a condition from its authoring form.
    pub fn from_value(value: &Value) -> Result<Self, ConditionError> {
        parse_node(value, ROOT_PATH, 0)
    }

    /// Convert back to the authoring form.
    pub fn to_value(&self) -> Value {
        match self {
            Self::All(items) => {
                serde_json::json!({ "all": items.iter().map(Condition::to_value).collect::<Vec<_>>() })
            }
            Self::Any(items) => {
                serde_json::json!({ "any": items.iter().map(Condition::to_value).collect::<Vec<_>>() })
            }
            Self::Not(inner) => serde_json::json!({ "not": inner.to_value() }),
            Self::Leaf(leaf) => serde_json::json!({
                "field": leaf.field.as_str(),
                "op": leaf.predicate.operator().as_str(),
                "value": leaf.predicate.operand(),
            }),
        }
    }
}

/// Static validation of an authoring-form condition.
///
/// Rejects unknown operators, missing values (except for `exists`),
/// malformed tree shapes, unusable operands, and over-deep nesting.
pub fn validate(value: &Value) -> Result<(), ConditionError> {
    Condition::from_value(value).map(|_| ())
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Condition::from_value(&value).map_err(serde::de::Error::custom)
    }
}

// ── Parser ──────────────────────────────────────────────────────────

fn malformed(path: &str, reason: impl Into<String>) -> ConditionError {
    ConditionError::Malformed {
        path: path.to_string(),
        reason: reason.into(),
    }
}

fn parse_node(value: &Value, path: &str, depth: usize) -> Result<Condition, ConditionError> {
    if depth > MAX_DEPTH {
        return Err(ConditionError::TooDeep {
            path: path.to_string(),
            max: MAX_DEPTH,
        });
    }

    let obj = value
        .as_object()
        .ok_or_else(|| malformed(path, "expected a condition object"))?;

    if obj.contains_key("field") || obj.contains_key("op") {
        return parse_leaf(obj, path).map(Condition::Leaf);
    }

    let mut entries = obj.iter();
    let (key, inner) = match (entries.next(), entries.next()) {
        (Some(entry), None) => entry,
        (None, _) => return Err(malformed(path, "empty condition object")),
        (Some(_), Some(_)) => {
            return Err(malformed(
                path,
                "a group must have exactly one of 'all', 'any' or 'not'",
            ));
        }
    };

    let child_path = format!("{path}.{key}");
    match key.as_str() {
        "all" => parse_list(inner, &child_path, depth).map(Condition::All),
        "any" => parse_list(inner, &child_path, depth).map(Condition::Any),
        "not" => {
            if inner.is_array() {
                return Err(malformed(&child_path, "'not' takes a single condition"));
            }
            parse_node(inner, &child_path, depth + 1).map(|c| Condition::Not(Box::new(c)))
        }
        other => Err(malformed(path, format!("unknown key '{other}'"))),
    }
}

fn parse_list(value: &Value, path: &str, depth: usize) -> Result<Vec<Condition>, ConditionError> {
    let items = value
        .as_array()
        .ok_or_else(|| malformed(path, "expected a list of conditions"))?;
    items
        .iter()
        .enumerate()
        .map(|(i, item)| parse_node(item, &format!("{path}[{i}]"), depth + 1))
        .collect()
}

fn parse_leaf(obj: &Map<String, Value>, path: &str) -> Result<Leaf, ConditionError> {
    if let Some(key) = obj
        .keys()
        .find(|k| !matches!(k.as_str(), "field" | "op" | "value"))
    {
        return Err(malformed(path, format!("unknown key '{key}' in leaf")));
    }

    let field_path = format!("{path}.field");
    let field = obj
        .get("field")
        .ok_or_else(|| malformed(&field_path, "missing 'field'"))?
        .as_str()
        .ok_or_else(|| malformed(&field_path, "'field' must be a string"))?;
    let field = FieldPath::parse(field)
        .ok_or_else(|| malformed(&field_path, format!("invalid field path '{field}'")))?;

    let op_path = format!("{path}.op");
    let op_str = obj
        .get("op")
        .ok_or_else(|| malformed(&op_path, "missing 'op'"))?
        .as_str()
        .ok_or_else(|| malformed(&op_path, "'op' must be a string"))?;
    let op: Operator = op_str
        .parse()
        .map_err(|_| ConditionError::UnknownOperator {
            path: op_path.clone(),
            op: op_str.to_string(),
        })?;

    let value_path = format!("{path}.value");
    let value = obj.get("value");

    let predicate = match op {
        Operator::Exists => match value {
            None => Predicate::Exists(true),
            Some(Value::Bool(expected)) => Predicate::Exists(*expected),
            Some(_) => return Err(malformed(&value_path, "'exists' takes a boolean value")),
        },
        _ => {
            let value = value.ok_or_else(|| ConditionError::MissingValue {
                path: value_path.clone(),
                op: op.as_str().to_string(),
            })?;
            operand_predicate(op, value, &value_path)?
        }
    };

    Ok(Leaf { field, predicate })
}

fn operand_predicate(op: Operator, value: &Value, path: &str) -> Result<Predicate, ConditionError> {
    let ordered = |value: &Value| -> Result<Value, ConditionError> {
        match value {
            Value::String(_) | Value::Number(_) => Ok(value.clone()),
            _ => Err(malformed(
                path,
                format!("'{op}' compares against a string or number"),
            )),
        }
    };

    Ok(match op {
        Operator::Eq => Predicate::Eq(value.clone()),
        Operator::Neq => Predicate::Neq(value.clone()),
        Operator::Lt => Predicate::Lt(ordered(value)?),
        Operator::Lte => Predicate::Lte(ordered(value)?),
        Operator::Gt => Predicate::Gt(ordered(value)?),
        Operator::Gte => Predicate::Gte(ordered(value)?),
        Operator::Contains => Predicate::Contains(value.clone()),
        Operator::In => match value {
            Value::Array(items) => Predicate::In(items.clone()),
            _ => return Err(malformed(path, "'in' takes a list")),
        },
        Operator::Regex => {
            let pattern = value
                .as_str()
                .ok_or_else(|| malformed(path, "'regex' takes a string pattern"))?;
            let regex = Regex::new(pattern).map_err(|e| ConditionError::InvalidRegex {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
            Predicate::Regex(Pattern(regex))
        }
        Operator::Exists => Predicate::Exists(true),
    })
}
