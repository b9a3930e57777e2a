//! Fail-closed condition evaluator.
//!
//! `evaluate` never errors: a missing field, an incomparable pair of values or
//! anything else unexpected makes the leaf `false`. Anomalies are counted in an
//! [`EvalTrace`] so batches can report them in aggregate.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

use crate::pipeline::context::Context;
use crate::policy::condition::{Condition, Leaf, Predicate};

/// Counts of runtime anomalies seen while evaluating.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvalTrace {
    /// Leaves whose field did not resolve.
    pub missing_fields: u64,
    /// Leaves whose operands could not be compared.
    pub type_mismatches: u64,
}

impl EvalTrace {
    pub fn anomalies(&self) -> u64 {
        self.missing_fields + self.type_mismatches
    }

    pub fn merge(&mut self, other: EvalTrace) {
        self.missing_fields += other.missing_fields;
        self.type_mismatches += other.type_mismatches;
    }
}

/// Evaluate a condition against a context.
pub fn evaluate(condition: &Condition, ctx: &Context) -> bool {
    let mut trace = EvalTrace::default();
    evaluate_traced(condition, ctx, &mut trace)
}

/// Evaluate a condition, recording anomalies into `trace`.
pub fn evaluate_traced(condition: &Condition, ctx: &Context, trace: &mut EvalTrace) -> bool {
    match condition {
        Condition::All(items) => items.iter().all(|c| evaluate_traced(c, ctx, trace)),
        Condition::Any(items) => items.iter().any(|c| evaluate_traced(c, ctx, trace)),
        Condition::Not(inner) => !evaluate_traced(inner, ctx, trace),
        Condition::Leaf(leaf) => evaluate_leaf(leaf, ctx, trace),
    }
}

fn evaluate_leaf(leaf: &Leaf, ctx: &Context, trace: &mut EvalTrace) -> bool {
    let actual = ctx.resolve(&leaf.field);

    let actual = match (&leaf.predicate, actual) {
        (Predicate::Exists(expected), found) => return found.is_some() == *expected,
        (_, None) => {
            trace.missing_fields += 1;
            return false;
        }
        (_, Some(actual)) => actual,
    };

    match &leaf.predicate {
        Predicate::Eq(expected) => loose_eq(actual, &ctx.operand(expected)),
        Predicate::Neq(expected) => !loose_eq(actual, &ctx.operand(expected)),
        Predicate::Lt(bound) => ordered(actual, &ctx.operand(bound), trace, Ordering::is_lt),
        Predicate::Lte(bound) => ordered(actual, &ctx.operand(bound), trace, Ordering::is_le),
        Predicate::Gt(bound) => ordered(actual, &ctx.operand(bound), trace, Ordering::is_gt),
        Predicate::Gte(bound) => ordered(actual, &ctx.operand(bound), trace, Ordering::is_ge),
        Predicate::In(items) => items.iter().any(|item| loose_eq(actual, &ctx.operand(item))),
        Predicate::Contains(needle) => contains(actual, &ctx.operand(needle), trace),
        Predicate::Regex(pattern) => match actual {
            Value::String(s) => pattern.is_match(s),
            Value::Number(n) => pattern.is_match(&n.to_string()),
            _ => {
                trace.type_mismatches += 1;
                false
            }
        },
        Predicate::Exists(_) => true,
    }
}

fn ordered(
    actual: &Value,
    bound: &Value,
    trace: &mut EvalTrace,
    accept: fn(Ordering) -> bool,
) -> bool {
    match compare(actual, bound) {
        Some(ordering) => accept(ordering),
        None => {
            trace.type_mismatches += 1;
            false
        }
    }
}

/// Datetime comparison when both sides parse as ISO-8601, else numeric.
pub(crate) fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (as_datetime(a), as_datetime(b)) {
        return Some(x.cmp(&y));
    }
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y);
    }
    None
}

/// Structural equality with scalar coercion. Mismatched types are unequal.
pub(crate) fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            parse_number(s).is_some_and(|parsed| Some(parsed) == n.as_f64())
        }
        (Value::Bool(flag), Value::String(s)) | (Value::String(s), Value::Bool(flag)) => {
            parse_bool(s) == Some(*flag)
        }
        (Value::String(x), Value::String(y)) => {
            x == y
                || matches!(
                    (parse_timestamp(x), parse_timestamp(y)),
                    (Some(p), Some(q)) if p == q
                )
        }
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| loose_eq(x, y))
        }
        (Value::Object(xm), Value::Object(ym)) => {
            xm.len() == ym.len()
                && xm
                    .iter()
                    .all(|(k, xv)| ym.get(k).is_some_and(|yv| loose_eq(xv, yv)))
        }
        _ => false,
    }
}

fn contains(haystack: &Value, needle: &Value, trace: &mut EvalTrace) -> bool {
    match (haystack, needle) {
        (Value::String(s), Value::String(n)) => s.contains(n.as_str()),
        (Value::Array(items), needle) => items.iter().any(|item| loose_eq(item, needle)),
        (Value::Object(map), Value::String(key)) => map.contains_key(key),
        _ => {
            trace.type_mismatches += 1;
            false
        }
    }
}

fn as_datetime(value: &Value) -> Option<DateTime<Utc>> {
    value.as_str().and_then(parse_timestamp)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_number(s),
        _ => None,
    }
}

fn parse_number(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

fn parse_bool(s: &str) -> Option<bool> {
    if s.eq_ignore_ascii_case("true") {
        Some(true)
    } else if s.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// Parse an ISO-8601 timestamp. Offset-less forms are taken as UTC.
pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(ndt.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ndt| ndt.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::pipeline::context::ContextBuilder;
    use crate::pipeline::types::InboundRecord;

    fn at(ts: &str) -> DateTime<Utc> {
        parse_timestamp(ts).unwrap()
    }

    fn ctx(attributes: Value) -> Context {
        ContextBuilder::new(at("2026-03-01T12:00:00Z")).build(&InboundRecord::new("r", attributes))
    }

    fn cond(raw: Value) -> Condition {
        Condition::from_value(&raw).unwrap()
    }

    fn eval(raw: Value, attributes: Value) -> bool {
        evaluate(&cond(raw), &ctx(attributes))
    }

    #[test]
    fn empty_groups() {
        assert!(eval(json!({"all": []}), json!({})));
        assert!(!eval(json!({"any": []}), json!({})));
    }

    #[test]
    fn not_is_negation() {
        let samples = [
            json!({"field": "category", "op": "eq", "value": "promotions"}),
            json!({"field": "missing", "op": "gt", "value": 3}),
            json!({"field": "category", "op": "exists"}),
            json!({"any": []}),
            json!({"all": []}),
            json!({"field": "category", "op": "lt", "value": 5}),
        ];
        let contexts = [json!({"category": "promotions"}), json!({}), json!({"category": 7})];
        for c in &samples {
            for attrs in &contexts {
                let plain = eval(c.clone(), attrs.clone());
                let negated = eval(json!({ "not": c }), attrs.clone());
                assert_eq!(negated, !plain, "not({c}) on {attrs}");
            }
        }
    }

    #[test]
    fn eq_coerces_scalars() {
        assert!(eval(json!({"field": "n", "op": "eq", "value": 1}), json!({"n": 1.0})));
        assert!(eval(json!({"field": "n", "op": "eq", "value": "3"}), json!({"n": 3})));
        assert!(eval(json!({"field": "b", "op": "eq", "value": true}), json!({"b": "TRUE"})));
        assert!(eval(
            json!({"field": "t", "op": "eq", "value": "2020-01-01T00:00:00Z"}),
            json!({"t": "2020-01-01T01:00:00+01:00"})
        ));
        assert!(!eval(json!({"field": "n", "op": "eq", "value": "one"}), json!({"n": 1})));
        assert!(!eval(json!({"field": "n", "op": "eq", "value": [1]}), json!({"n": 1})));
    }

    #[test]
    fn neq_on_missing_field_is_false() {
        assert!(!eval(json!({"field": "x", "op": "neq", "value": 1}), json!({})));
        assert!(eval(json!({"field": "x", "op": "neq", "value": 1}), json!({"x": 2})));
    }

    #[test]
    fn ordering_prefers_datetimes_then_numbers() {
        assert!(eval(
            json!({"field": "expires_at", "op": "lt", "value": "now"}),
            json!({"expires_at": "2020-01-01T00:00:00Z"})
        ));
        assert!(!eval(
            json!({"field": "expires_at", "op": "lt", "value": "now"}),
            json!({"expires_at": "2030-01-01"})
        ));
        assert!(eval(json!({"field": "risk", "op": "gte", "value": 0.7}), json!({"risk": "0.7"})));
        assert!(eval(json!({"field": "risk", "op": "lte", "value": 10}), json!({"risk": 2})));
        assert!(!eval(json!({"field": "risk", "op": "gt", "value": 10}), json!({"risk": 2})));
    }

    #[test]
    fn now_comparisons_within_the_same_second() {
        let ctx = ContextBuilder::new(at("2026-03-01T12:00:00.700Z"))
            .build(&InboundRecord::new("r", json!({"expires_at": "2026-03-01T12:00:00.300Z"})));
        assert!(evaluate(&cond(json!({"field": "expires_at", "op": "lt", "value": "now"})), &ctx));
        assert!(!evaluate(&cond(json!({"field": "expires_at", "op": "gt", "value": "now"})), &ctx));
        assert!(!evaluate(&cond(json!({"field": "expires_at", "op": "eq", "value": "now"})), &ctx));
    }

    #[test]
    fn ordering_type_mismatch_is_false_and_traced() {
        let c = cond(json!({"field": "risk", "op": "gt", "value": 1}));
        let mut trace = EvalTrace::default();
        assert!(!evaluate_traced(&c, &ctx(json!({"risk": "high"})), &mut trace));
        assert!(!evaluate_traced(&c, &ctx(json!({"risk": {"v": 3}})), &mut trace));
        assert_eq!(trace.type_mismatches, 2);
    }

    #[test]
    fn missing_intermediate_key_is_false_and_traced() {
        let c = cond(json!({"field": "features.spam.score", "op": "gt", "value": 0.1}));
        let mut trace = EvalTrace::default();
        assert!(!evaluate_traced(&c, &ctx(json!({"features": {}})), &mut trace));
        assert_eq!(trace.missing_fields, 1);
        assert_eq!(trace.anomalies(), 1);
    }

    #[test]
    fn exists_is_independent_of_truthiness() {
        for value in [json!(null), json!(false), json!(0), json!("")] {
            assert!(eval(json!({"field": "x", "op": "exists"}), json!({ "x": value })));
        }
        assert!(!eval(json!({"field": "x", "op": "exists"}), json!({})));
        assert!(eval(json!({"field": "a.b", "op": "exists", "value": false}), json!({"a": 1})));
    }

    #[test]
    fn in_tests_membership() {
        let c = json!({"field": "sender_domain", "op": "in", "value": ["shop.example", "deals.io"]});
        assert!(eval(c.clone(), json!({"sender": "x@deals.io"})));
        assert!(!eval(c, json!({"sender": "x@bank.com"})));
        assert!(eval(json!({"field": "n", "op": "in", "value": [1, 2]}), json!({"n": "2"})));
    }

    #[test]
    fn contains_covers_strings_arrays_and_objects() {
        assert!(eval(
            json!({"field": "subject", "op": "contains", "value": "invoice"}),
            json!({"subject": "Your invoice #42"})
        ));
        assert!(eval(
            json!({"field": "labels", "op": "contains", "value": "vip"}),
            json!({"labels": ["work", "vip"]})
        ));
        assert!(eval(
            json!({"field": "features", "op": "contains", "value": "tracking_pixel"}),
            json!({"features": {"tracking_pixel": false}})
        ));
        assert!(!eval(
            json!({"field": "risk", "op": "contains", "value": "1"}),
            json!({"risk": 1})
        ));
    }

    #[test]
    fn regex_searches() {
        let c = json!({"field": "subject", "op": "regex", "value": "(?i)unsubscribe"});
        assert!(eval(c.clone(), json!({"subject": "Weekly deals - Unsubscribe anytime"})));
        assert!(!eval(c.clone(), json!({"subject": "Meeting"})));
        assert!(!eval(c, json!({"subject": ["Unsubscribe"]})));
        assert!(eval(json!({"field": "code", "op": "regex", "value": "^4\\d\\d$"}), json!({"code": 404})));
    }

    #[test]
    fn evaluation_is_reproducible_for_a_fixed_instant() {
        let c = cond(json!({"field": "expires_at", "op": "lt", "value": "now"}));
        let attrs = json!({"expires_at": "2026-03-01T11:59:59Z"});
        let first = evaluate(&c, &ctx(attrs.clone()));
        let second = evaluate(&c, &ctx(attrs));
        assert!(first);
        assert_eq!(first, second);
    }

    #[test]
    fn parses_common_timestamp_forms() {
        assert!(parse_timestamp("2020-01-01T00:00:00Z").is_some());
        assert!(parse_timestamp("2020-01-01T00:00:00.250").is_some());
        assert!(parse_timestamp("2020-01-01 08:30:00").is_some());
        assert!(parse_timestamp("2020-01-01").is_some());
        assert!(parse_timestamp("yesterday").is_none());
        assert!(parse_timestamp("12").is_none());
    }
}
