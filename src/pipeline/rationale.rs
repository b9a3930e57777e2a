//! Rationale rendering.
//!
//! Templates reference context fields with `{path}` placeholders, e.g.
//! `"Promo from {sender_domain} (risk {risk_score})"`. Placeholders that do not
//! resolve are left verbatim.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::pipeline::context::Context;
use crate::policy::Policy;

/// `{path}` placeholder, optionally padded with whitespace inside the braces.
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\s*([A-Za-z0-9_.]+)\s*\}").expect("placeholder pattern is a valid regex")
});

/// Render a policy's rationale for a matched record.
pub fn render(policy: &Policy, ctx: &Context) -> String {
    if policy.rationale_template.trim().is_empty() {
        return format!(
            "Matched policy '{}' (priority {})",
            policy.name, policy.priority
        );
    }
    render_template(&policy.rationale_template, ctx)
}

/// Substitute `{path}` placeholders from the context.
pub fn render_template(template: &str, ctx: &Context) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| match ctx.lookup(&caps[1]) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}
