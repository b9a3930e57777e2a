//! Proposal processor: live ingest of classified records.
//!
//! **Core invariant: nothing executes here.** Ingest only creates pending
//! proposals; every side effect waits for a human `approve`.
//!
//! Flow:
//! 1. Stamp one `now` for the batch and load enabled policies
//! 2. Run the proposal engine over every record
//! 3. Persist new pending proposals (store-level dedupe per record/policy)
//! 4. Broadcast each created proposal to reviewers

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::approval::ApprovalService;
use crate::approval::model::{ProposalEvent, ProposedAction};
use crate::error::DatabaseError;
use crate::pipeline::engine::ProposalEngine;
use crate::pipeline::types::InboundRecord;
use crate::store::Database;

/// Summary of one ingest batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    /// Proposals created in this batch.
    pub created: Vec<ProposedAction>,
    /// Matches skipped because an identical proposal is already pending.
    pub duplicates: usize,
    /// Records no policy matched.
    pub unmatched: usize,
    /// Evaluation anomalies (missing fields, type mismatches) across the batch.
    pub anomalies: u64,
}

pub struct ProposalProcessor {
    engine: ProposalEngine,
    store: Arc<dyn Database>,
    approvals: Arc<ApprovalService>,
}

impl ProposalProcessor {
    pub fn new(
        engine: ProposalEngine,
        store: Arc<dyn Database>,
        approvals: Arc<ApprovalService>,
    ) -> Self {
        Self {
            engine,
            store,
            approvals,
        }
    }

    /// Evaluate a batch against the enabled policies and persist the matches.
    pub async fn ingest(&self, records: Vec<InboundRecord>) -> Result<BatchReport, DatabaseError> {
        let now = Utc::now();
        let policies = self.store.list_policies(true).await?;
        info!(records = records.len(), policies = policies.len(), "Processing record batch");

        let decisions = self.engine.evaluate_batch(&records, &policies, now);
        let mut report = BatchReport::default();

        for decision in decisions {
            report.anomalies += decision.trace.anomalies();
            let Some(draft) = decision.matched else {
                report.unmatched += 1;
                continue;
            };

            let proposal = ProposedAction::pending(draft, now);
            if self.store.insert_proposal(&proposal).await? {
                debug!(
                    proposal_id = %proposal.id,
                    record_id = %proposal.record_id,
                    action = %proposal.action_type,
                    "Proposal created"
                );
                self.approvals.publish(ProposalEvent::Proposed {
                    proposal: proposal.clone(),
                });
                report.created.push(proposal);
            } else {
                report.duplicates += 1;
            }
        }

        if report.anomalies > 0 {
            warn!(anomalies = report.anomalies, "Evaluation anomalies in batch");
        }
        info!(
            created = report.created.len(),
            duplicates = report.duplicates,
            unmatched = report.unmatched,
            anomalies = report.anomalies,
            "Batch processing complete"
        );
        Ok(report)
    }
}
