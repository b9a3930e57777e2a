//! Policy authoring: validated CRUD over the store.

use std::sync::Arc;

use tracing::info;

use crate::error::{DatabaseError, PolicyError};
use crate::policy::{Policy, PolicyDraft};
use crate::store::Database;

/// Policy store front end. Every write is re-validated.
pub struct PolicyService {
    store: Arc<dyn Database>,
}

impl PolicyService {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    pub async fn create(&self, draft: &PolicyDraft) -> Result<Policy, PolicyError> {
        let spec = draft.validate()?;
        let policy = self.store.insert_policy(&spec).await?;
        info!(
            policy_id = policy.id,
            name = %policy.name,
            priority = policy.priority,
            action = %policy.action_type,
            enabled = policy.enabled,
            "Policy created"
        );
        Ok(policy)
    }

    pub async fn update(&self, id: i64, draft: &PolicyDraft) -> Result<Policy, PolicyError> {
        let spec = draft.validate()?;
        let policy = self
            .store
            .update_policy(id, &spec)
            .await?
            .ok_or(PolicyError::NotFound { id })?;
        info!(policy_id = id, name = %policy.name, enabled = policy.enabled, "Policy updated");
        Ok(policy)
    }

    pub async fn get(&self, id: i64) -> Result<Policy, PolicyError> {
        self.store
            .get_policy(id)
            .await?
            .ok_or(PolicyError::NotFound { id })
    }

    /// Permanently delete. Proposals and audit records keep the id.
    pub async fn delete(&self, id: i64) -> Result<(), PolicyError> {
        if !self.store.delete_policy(id).await? {
            return Err(PolicyError::NotFound { id });
        }
        info!(policy_id = id, "Policy deleted");
        Ok(())
    }

    /// Policies in (priority, id) order.
    pub async fn list(&self, enabled_only: bool) -> Result<Vec<Policy>, PolicyError> {
        Ok(self.store.list_policies(enabled_only).await?)
    }

    /// Enable or disable. Enabling re-validates the stored policy first.
    pub async fn set_enabled(&self, id: i64, enabled: bool) -> Result<Policy, PolicyError> {
        if enabled {
            let stored = match self.store.get_policy(id).await {
                Ok(Some(policy)) => policy,
                Ok(None) => return Err(PolicyError::NotFound { id }),
                // A stored condition that no longer parses cannot be enabled.
                Err(DatabaseError::Serialization(reason)) => {
                    return Err(PolicyError::InvalidField {
                        field: "condition".into(),
                        reason,
                    });
                }
                Err(e) => return Err(e.into()),
            };
            PolicyDraft::from(&stored).validate()?;
        }

        let policy = self
            .store
            .set_policy_enabled(id, enabled)
            .await?
            .ok_or(PolicyError::NotFound { id })?;
        info!(policy_id = id, enabled, "Policy enablement changed");
        Ok(policy)
    }
}
