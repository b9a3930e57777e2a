//! Simulation: dry runs of the decision function with zero persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::PolicyError;
use crate::pipeline::engine::{Decision, ProposalEngine};
use crate::pipeline::types::InboundRecord;
use crate::policy::{Policy, PolicyDraft};
use crate::store::Database;

/// What the live path would do with one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalPreview {
    pub record_id: String,
    pub matched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl From<Decision> for ProposalPreview {
    fn from(decision: Decision) -> Self {
        match decision.matched {
            Some(draft) => Self {
                record_id: decision.record_id,
                matched: true,
                policy_id: Some(draft.policy_id),
                policy_name: Some(draft.policy_name),
                action_type: Some(draft.action_type),
                params: Some(draft.params),
                confidence: Some(draft.confidence),
                rationale: Some(draft.rationale),
            },
            None => Self {
                record_id: decision.record_id,
                matched: false,
                policy_id: None,
                policy_name: None,
                action_type: None,
                params: None,
                confidence: None,
                rationale: None,
            },
        }
    }
}

/// One preview per record, in input order.
pub fn simulate(
    engine: &ProposalEngine,
    records: &[InboundRecord],
    policies: &[Policy],
    now: DateTime<Utc>,
) -> Vec<ProposalPreview> {
    engine
        .evaluate_batch(records, policies, now)
        .into_iter()
        .map(ProposalPreview::from)
        .collect()
}

/// Dry-run request body.
#[derive(Debug, Clone, Deserialize)]
pub struct DryRunRequest {
    #[serde(default)]
    pub records: Vec<InboundRecord>,
    /// Unsaved policy to try out.
    #[serde(default)]
    pub candidate: Option<PolicyDraft>,
    /// Evaluate saved enabled policies alongside the candidate.
    #[serde(default)]
    pub include_saved: bool,
    /// Instant to evaluate against; defaults to the current time.
    #[serde(default)]
    pub now: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    pub evaluated_at: DateTime<Utc>,
    pub previews: Vec<ProposalPreview>,
    pub matched: usize,
    pub anomalies: u64,
}

/// Read-only front end for dry runs against saved and candidate policies.
pub struct Simulator {
    engine: ProposalEngine,
    store: Arc<dyn Database>,
}

impl Simulator {
    pub fn new(engine: ProposalEngine, store: Arc<dyn Database>) -> Self {
        Self { engine, store }
    }

    /// Run a dry run. Without a candidate the saved enabled policies are used.
    pub async fn dry_run(&self, request: DryRunRequest) -> Result<DryRunReport, PolicyError> {
        let now = request.now.unwrap_or_else(Utc::now);

        let mut policies = Vec::new();
        if request.candidate.is_none() || request.include_saved {
            policies = self.store.list_policies(true).await?;
        }
        if let Some(candidate) = &request.candidate {
            policies.push(candidate.validate()?.into_candidate(now));
        }

        let decisions = self.engine.evaluate_batch(&request.records, &policies, now);
        let anomalies = decisions.iter().map(|d| d.trace.anomalies()).sum();
        let previews: Vec<ProposalPreview> =
            decisions.into_iter().map(ProposalPreview::from).collect();
        let matched = previews.iter().filter(|p| p.matched).count();

        info!(
            records = previews.len(),
            policies = policies.len(),
            matched,
            anomalies,
            candidate = request.candidate.is_some(),
            "Dry run complete"
        );

        Ok(DryRunReport {
            evaluated_at: now,
            previews,
            matched,
            anomalies,
        })
    }
}
