//! Policies: author-written rules pairing a condition with a proposed action.
//!
//! Authors submit a [`PolicyDraft`] (condition in JSON authoring form).
//! Validation turns it into a [`PolicySpec`] with a typed [`Condition`]; the
//! store assigns an id and returns a [`Policy`].

pub mod condition;
pub mod evaluator;
pub mod service;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PolicyError;

pub use condition::{Condition, validate};
pub use evaluator::evaluate;
pub use service::PolicyService;

/// Id given to an unsaved candidate policy during a dry run.
pub const CANDIDATE_POLICY_ID: i64 = 0;

/// A stored policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: i64,
    pub name: String,
    /// Ascending: lower priorities are evaluated first.
    pub priority: i64,
    pub enabled: bool,
    pub condition: Condition,
    pub action_type: String,
    pub action_params: Value,
    /// Author-assigned confidence (0..1) carried onto proposals.
    pub confidence_threshold: f64,
    pub rationale_template: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A validated policy body, ready to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicySpec {
    pub name: String,
    pub priority: i64,
    pub enabled: bool,
    pub condition: Condition,
    pub action_type: String,
    pub action_params: Value,
    pub confidence_threshold: f64,
    pub rationale_template: String,
}

/// A policy as submitted by an author.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDraft {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub enabled: bool,
    pub condition: Value,
    #[serde(alias = "action")]
    pub action_type: String,
    #[serde(default, alias = "params")]
    pub action_params: Value,
    #[serde(alias = "confidence")]
    pub confidence_threshold: f64,
    #[serde(default, alias = "rationale")]
    pub rationale_template: String,
}

impl PolicyDraft {
    /// Statically validate the draft.
    pub fn validate(&self) -> Result<PolicySpec, PolicyError> {
        let condition = Condition::from_value(&self.condition)?;

        if self.action_type.trim().is_empty() {
            return Err(PolicyError::InvalidField {
                field: "action_type".into(),
                reason: "must not be empty".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(PolicyError::InvalidField {
                field: "confidence_threshold".into(),
                reason: format!("{} is outside 0..1", self.confidence_threshold),
            });
        }
        let action_params = match &self.action_params {
            Value::Null => Value::Object(Default::default()),
            Value::Object(_) => self.action_params.clone(),
            _ => {
                return Err(PolicyError::InvalidField {
                    field: "action_params".into(),
                    reason: "must be an object".into(),
                });
            }
        };
        let name = if self.name.trim().is_empty() {
            self.action_type.trim().to_string()
        } else {
            self.name.trim().to_string()
        };

        Ok(PolicySpec {
            name,
            priority: self.priority,
            enabled: self.enabled,
            condition,
            action_type: self.action_type.trim().to_string(),
            action_params,
            confidence_threshold: self.confidence_threshold,
            rationale_template: self.rationale_template.clone(),
        })
    }
}

impl From<&Policy> for PolicyDraft {
    fn from(policy: &Policy) -> Self {
        Self {
            name: policy.name.clone(),
            priority: policy.priority,
            enabled: policy.enabled,
            condition: policy.condition.to_value(),
            action_type: policy.action_type.clone(),
            action_params: policy.action_params.clone(),
            confidence_threshold: policy.confidence_threshold,
            rationale_template: policy.rationale_template.clone(),
        }
    }
}

impl PolicySpec {
    /// Materialize as a policy with the given id and timestamps.
    pub fn into_policy(self, id: i64, created_at: DateTime<Utc>, updated_at: DateTime<Utc>) -> Policy {
        Policy {
            id,
            name: self.name,
            priority: self.priority,
            enabled: self.enabled,
            condition: self.condition,
            action_type: self.action_type,
            action_params: self.action_params,
            confidence_threshold: self.confidence_threshold,
            rationale_template: self.rationale_template,
            created_at,
            updated_at,
        }
    }

    /// An unsaved, enabled policy used for dry runs.
    pub fn into_candidate(self, now: DateTime<Utc>) -> Policy {
        let mut policy = self.into_policy(CANDIDATE_POLICY_ID, now, now);
        policy.enabled = true;
        policy
    }
}

/// Enabled policies in evaluation order: (priority asc, id asc).
pub fn evaluation_order(policies: &[Policy]) -> Vec<&Policy> {
    let mut ordered: Vec<&Policy> = policies.iter().filter(|p| p.enabled).collect();
    ordered.sort_by_key(|p| (p.priority, p.id));
    ordered
}
