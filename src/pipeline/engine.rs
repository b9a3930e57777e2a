//! Proposal engine: the decision function shared by live ingest and simulation.
//!
//! For each record the engine scans enabled policies in (priority, id) order
//! and stops at the first one that both matches and clears the confidence
//! floor. First match wins; a record yields at most one proposal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::approval::model::ProposedAction;
use crate::pipeline::context::{Context, ContextBuilder};
use crate::pipeline::rationale;
use crate::pipeline::types::{InboundRecord, RecordSnapshot};
use crate::policy::evaluator::{EvalTrace, evaluate_traced};
use crate::policy::{Policy, evaluation_order};

/// Default confidence floor.
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.5;

/// What the engine would propose for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalDraft {
    pub record: RecordSnapshot,
    pub policy_id: i64,
    pub policy_name: String,
    pub action_type: String,
    pub params: Value,
    pub confidence: f64,
    pub rationale: String,
}

/// Outcome of evaluating one record.
#[derive(Debug, Clone)]
pub struct Decision {
    pub record_id: String,
    pub matched: Option<ProposalDraft>,
    pub trace: EvalTrace,
}

/// Stateless decision function with a system-wide confidence floor.
#[derive(Debug, Clone, Copy)]
pub struct ProposalEngine {
    min_confidence: f64,
}

impl Default for ProposalEngine {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_CONFIDENCE)
    }
}

impl ProposalEngine {
    pub fn new(min_confidence: f64) -> Self {
        Self { min_confidence }
    }

    /// Decide for one record. `ordered` must already be in evaluation order.
    pub fn decide(&self, record_id: &str, ctx: &Context, ordered: &[&Policy]) -> Decision {
        let mut trace = EvalTrace::default();

        for policy in ordered {
            if policy.confidence_threshold < self.min_confidence {
                debug!(
                    record_id,
                    policy_id = policy.id,
                    confidence = policy.confidence_threshold,
                    floor = self.min_confidence,
                    "Policy below confidence floor, skipping"
                );
                continue;
            }
            if !evaluate_traced(&policy.condition, ctx, &mut trace) {
                continue;
            }

            debug!(record_id, policy_id = policy.id, action = %policy.action_type, "Policy matched");
            return Decision {
                record_id: record_id.to_string(),
                matched: Some(ProposalDraft {
                    record: RecordSnapshot::from_context(record_id, ctx),
                    policy_id: policy.id,
                    policy_name: policy.name.clone(),
                    action_type: policy.action_type.clone(),
                    params: policy.action_params.clone(),
                    confidence: policy.confidence_threshold,
                    rationale: rationale::render(policy, ctx),
                }),
                trace,
            };
        }

        Decision {
            record_id: record_id.to_string(),
            matched: None,
            trace,
        }
    }

    /// Decide for every record, all against the same instant.
    pub fn evaluate_batch(
        &self,
        records: &[InboundRecord],
        policies: &[Policy],
        now: DateTime<Utc>,
    ) -> Vec<Decision> {
        let ordered = evaluation_order(policies);
        let builder = ContextBuilder::new(now);
        records
            .iter()
            .map(|record| {
                let ctx = builder.build(record);
                self.decide(&record.id, &ctx, &ordered)
            })
            .collect()
    }

    /// Pending, unpersisted proposals for the matched records.
    pub fn propose(
        &self,
        records: &[InboundRecord],
        policies: &[Policy],
        now: DateTime<Utc>,
    ) -> Vec<ProposedAction> {
        self.evaluate_batch(records, policies, now)
            .into_iter()
            .filter_map(|decision| decision.matched)
            .map(|draft| ProposedAction::pending(draft, now))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    use crate::approval::model::ActionStatus;
    use crate::policy::PolicyDraft;

    pub(crate) fn policy(id: i64, priority: i64, condition: Value, action: &str, confidence: f64) -> Policy {
        let draft: PolicyDraft = serde_json::from_value(json!({
            "name": format!("policy-{id}"),
            "priority": priority,
            "enabled": true,
            "condition": condition,
            "action": action,
            "confidence": confidence,
        }))
        .unwrap();
        let now = Utc::now();
        draft.validate().unwrap().into_policy(id, now, now)
    }

    fn promo() -> InboundRecord {
        InboundRecord::new(
            "m-1",
            json!({"sender": "deals@shop.example", "category": "promotions", "risk_score": 0.1}),
        )
    }

    #[test]
    fn first_match_wins_by_priority_then_id() {
        let engine = ProposalEngine::new(0.5);
        let cond = json!({"field": "category", "op": "eq", "value": "promotions"});
        let policies = vec![
            policy(7, 10, cond.clone(), "label", 0.9),
            policy(3, 10, cond.clone(), "archive", 0.9),
            policy(1, 20, cond, "mark_read", 0.9),
        ];
        let proposals = engine.propose(&[promo()], &policies, Utc::now());
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].policy_id, Some(3));
        assert_eq!(proposals[0].action_type, "archive");
        assert_eq!(proposals[0].status, ActionStatus::Pending);
    }

    #[test]
    fn below_floor_is_skipped_and_scan_continues() {
        let engine = ProposalEngine::new(0.7);
        let cond = json!({"field": "category", "op": "eq", "value": "promotions"});
        let policies = vec![
            policy(1, 1, cond.clone(), "archive", 0.4),
            policy(2, 2, cond, "label", 0.7),
        ];
        let decisions = engine.evaluate_batch(&[promo()], &policies, Utc::now());
        let matched = decisions[0].matched.as_ref().unwrap();
        assert_eq!(matched.policy_id, 2);
        assert_eq!(matched.confidence, 0.7);
    }

    #[test]
    fn no_match_yields_no_proposal() {
        let engine = ProposalEngine::default();
        let policies = vec![policy(1, 1, json!({"field": "category", "op": "eq", "value": "work"}), "archive", 0.9)];
        assert!(engine.propose(&[promo()], &policies, Utc::now()).is_empty());
    }

    #[test]
    fn disabled_policies_are_ignored() {
        let engine = ProposalEngine::default();
        let mut p = policy(1, 1, json!({"field": "category", "op": "exists"}), "archive", 0.9);
        p.enabled = false;
        assert!(engine.propose(&[promo()], &[p], Utc::now()).is_empty());
    }

    #[test]
    fn anomalies_are_traced_not_fatal() {
        let engine = ProposalEngine::default();
        let policies = vec![
            policy(1, 1, json!({"field": "features.links", "op": "gt", "value": 3}), "archive", 0.9),
            policy(2, 2, json!({"field": "category", "op": "gt", "value": 3}), "label", 0.9),
            policy(3, 3, json!({"field": "risk_score", "op": "lt", "value": 0.5}), "mark_read", 0.9),
        ];
        let decisions = engine.evaluate_batch(&[promo()], &policies, Utc::now());
        assert_eq!(decisions[0].matched.as_ref().unwrap().policy_id, 3);
        assert_eq!(decisions[0].trace.missing_fields, 1);
        assert_eq!(decisions[0].trace.type_mismatches, 1);
    }

    #[test]
    fn proposal_carries_summary_and_rationale() {
        let engine = ProposalEngine::default();
        let mut p = policy(5, 1, json!({"field": "category", "op": "eq", "value": "promotions"}), "archive", 0.8);
        p.rationale_template = "Promo from {sender_domain}".into();
        p.action_params = json!({"folder": "Promos"});

        let proposal = engine.propose(&[promo()], &[p], Utc::now()).remove(0);
        assert_eq!(proposal.rationale, "Promo from shop.example");
        assert_eq!(proposal.params, json!({"folder": "Promos"}));
        assert_eq!(proposal.record_summary["category"], "promotions");
        assert_eq!(proposal.confidence, 0.8);
    }

    #[test]
    fn empty_template_names_the_policy() {
        let engine = ProposalEngine::default();
        let p = policy(5, 4, json!({"field": "category", "op": "exists"}), "archive", 0.8);
        let proposal = engine.propose(&[promo()], &[p], Utc::now()).remove(0);
        assert_eq!(proposal.rationale, "Matched policy 'policy-5' (priority 4)");
    }

    #[test]
    fn now_is_shared_across_the_batch() {
        let engine = ProposalEngine::default();
        let now = DateTime::parse_from_rfc3339("2026-05-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let p = policy(1, 1, json!({"field": "received_at", "op": "lt", "value": "now"}), "archive", 0.9);
        let records = vec![
            InboundRecord::new("old", json!({"received_at": "2026-04-30T23:59:59Z"})),
            InboundRecord::new("new", json!({"received_at": "2026-05-01T00:00:01Z"})),
        ];
        let proposals = engine.propose(&records, &[p], now);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].record_id, "old");
        assert_eq!(proposals[0].created_at, now);
    }
}
