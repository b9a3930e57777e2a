//! Approval service: the human decision on each proposed action.
//!
//! Status changes are compare-and-set in the store, so two reviewers racing on
//! the same proposal get exactly one success; the loser sees `Conflict`.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::approval::model::{ActionStatus, ProposalEvent, ProposedAction};
use crate::audit::{Actor, AuditRecord};
use crate::error::{ApprovalError, DatabaseError};
use crate::executor::ExecutorRegistry;
use crate::store::{Database, Transition};

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Default and maximum page size for proposal listings.
pub const DEFAULT_LIST_LIMIT: usize = 100;
pub const MAX_LIST_LIMIT: usize = 1000;

pub struct ApprovalService {
    store: Arc<dyn Database>,
    executors: Arc<ExecutorRegistry>,
    tx: broadcast::Sender<ProposalEvent>,
}

impl ApprovalService {
    pub fn new(store: Arc<dyn Database>, executors: Arc<ExecutorRegistry>) -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self { store, executors, tx }
    }

    /// Subscribe to proposal events. Each WS client calls this.
    pub fn subscribe(&self) -> broadcast::Receiver<ProposalEvent> {
        self.tx.subscribe()
    }

    /// Broadcast an event. Ok if nobody is listening.
    pub fn publish(&self, event: ProposalEvent) {
        let _ = self.tx.send(event);
    }

    /// Pending proposals, newest first.
    pub async fn pending(&self) -> Result<Vec<ProposedAction>, DatabaseError> {
        self.store
            .list_proposals(Some(ActionStatus::Pending), MAX_LIST_LIMIT)
            .await
    }

    pub async fn list(
        &self,
        status: Option<ActionStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<ProposedAction>, DatabaseError> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        self.store.list_proposals(status, limit).await
    }

    pub async fn get(&self, id: Uuid) -> Result<ProposedAction, ApprovalError> {
        self.store
            .get_proposal(id)
            .await?
            .ok_or(ApprovalError::NotFound { id })
    }

    /// Approve a pending proposal and run it.
    ///
    /// Execution failures are not errors: the proposal ends `failed` with its
    /// `error` set, and the returned action says so.
    pub async fn approve(
        &self,
        id: Uuid,
        decided_by: Option<&str>,
    ) -> Result<ProposedAction, ApprovalError> {
        let claimed = self
            .store
            .transition_proposal(&Transition {
                id,
                from: ActionStatus::Pending,
                to: ActionStatus::Approved,
                decided_by,
                decided_at: Some(Utc::now()),
                error: None,
            })
            .await?;
        let Some(action) = claimed else {
            return Err(self.refusal(id, ActionStatus::Approved).await?);
        };

        let actor = Actor::from_decided_by(decided_by);
        info!(
            proposal_id = %id,
            action = %action.action_type,
            actor = %actor,
            "Proposal approved"
        );
        self.publish(ProposalEvent::StatusChanged {
            id,
            status: ActionStatus::Approved,
            error: None,
        });

        let outcome = self
            .executors
            .execute(&action.action_type, &action.params, &action.record())
            .await;
        let target = if outcome.success {
            ActionStatus::Executed
        } else {
            ActionStatus::Failed
        };
        let audit = AuditRecord::for_execution(&action, actor, &outcome, Utc::now());

        let finished = self
            .store
            .transition_with_audit(
                &Transition {
                    id,
                    from: ActionStatus::Approved,
                    to: target,
                    decided_by: None,
                    decided_at: None,
                    error: outcome.error.as_deref(),
                },
                &audit,
            )
            .await?;
        if !finished {
            return Err(self.refusal(id, target).await?);
        }

        match &outcome.error {
            Some(error) => warn!(proposal_id = %id, action = %action.action_type, error = %error, "Execution failed"),
            None => info!(proposal_id = %id, action = %action.action_type, "Execution succeeded"),
        }
        self.publish(ProposalEvent::StatusChanged {
            id,
            status: target,
            error: outcome.error.clone(),
        });

        Ok(ProposedAction {
            status: target,
            error: outcome.error,
            ..action
        })
    }

    /// Reject a pending proposal. Nothing is executed.
    pub async fn reject(
        &self,
        id: Uuid,
        decided_by: Option<&str>,
        reason: Option<&str>,
    ) -> Result<ProposedAction, ApprovalError> {
        let action = self.get(id).await?;
        if !action.status.can_transition_to(ActionStatus::Rejected) {
            return Err(ApprovalError::Conflict {
                id,
                status: action.status,
                target: ActionStatus::Rejected,
            });
        }

        let now = Utc::now();
        let actor = Actor::from_decided_by(decided_by);
        info!(proposal_id = %id, actor = %actor, "Rejecting proposal");
        let audit = AuditRecord::for_rejection(&action, actor, reason, now);
        let applied = self
            .store
            .transition_with_audit(
                &Transition {
                    id,
                    from: ActionStatus::Pending,
                    to: ActionStatus::Rejected,
                    decided_by,
                    decided_at: Some(now),
                    error: None,
                },
                &audit,
            )
            .await?;
        if !applied {
            return Err(self.refusal(id, ActionStatus::Rejected).await?);
        }

        info!(proposal_id = %id, "Proposal rejected");
        self.publish(ProposalEvent::StatusChanged {
            id,
            status: ActionStatus::Rejected,
            error: None,
        });

        self.get(id).await
    }

    /// Start a new decision cycle for a failed proposal.
    ///
    /// The failed row is untouched; a fresh pending proposal links back to it
    /// through `retry_of`.
    pub async fn retry(&self, id: Uuid) -> Result<ProposedAction, ApprovalError> {
        let failed = self.get(id).await?;
        if failed.status != ActionStatus::Failed {
            return Err(ApprovalError::Conflict {
                id,
                status: failed.status,
                target: ActionStatus::Pending,
            });
        }

        let retry = failed.retried(Utc::now());
        if !self.store.insert_proposal(&retry).await? {
            return Err(ApprovalError::DuplicatePending {
                record_id: retry.record_id,
            });
        }

        info!(proposal_id = %retry.id, retry_of = %id, action = %retry.action_type, "Proposal retried");
        self.publish(ProposalEvent::Proposed {
            proposal: retry.clone(),
        });
        Ok(retry)
    }

    /// Why a CAS lost: the id is unknown, or the proposal moved on.
    async fn refusal(&self, id: Uuid, target: ActionStatus) -> Result<ApprovalError, DatabaseError> {
        Ok(match self.store.get_proposal(id).await? {
            Some(current) => {
                warn!(proposal_id = %id, status = %current.status, target = %target, "Transition refused");
                ApprovalError::Conflict {
                    id,
                    status: current.status,
                    target,
                }
            }
            None => ApprovalError::NotFound { id },
        })
    }
}
