//! In-memory implementation of WorkflowStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::workflow::{Approval, Decision, EntityRef, WorkflowDefinition, WorkflowInstance};

#[derive(Default)]
struct Inner {
    /// Definitions keyed by (workflow_id, version), append-only
    definitions: HashMap<(Uuid, i32), WorkflowDefinition>,
    instances: HashMap<Uuid, WorkflowInstance>,
    approvals: HashMap<Uuid, Approval>,
    /// Approval ids per instance, in creation order
    instance_approvals: HashMap<Uuid, Vec<Uuid>>,
}

/// In-memory implementation of WorkflowStore
///
/// This is primarily for testing. It stores all data in memory behind a
/// single RwLock and provides the same semantics as the PostgreSQL
/// implementation, including the `row_version` compare-and-swap and the
/// single-active-instance-per-entity constraint.
///
/// # Example
///
/// ```
/// use approval_engine::InMemoryWorkflowStore;
///
/// let store = InMemoryWorkflowStore::new();
/// ```
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    inner: RwLock<Inner>,
}

impl InMemoryWorkflowStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored instances
    pub fn instance_count(&self) -> usize {
        self.inner.read().instances.len()
    }

    /// Number of approval slots still pending
    pub fn pending_approval_count(&self) -> usize {
        self.inner
            .read()
            .approvals
            .values()
            .filter(|a| a.decision == Decision::Pending)
            .count()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.definitions.clear();
        inner.instances.clear();
        inner.approvals.clear();
        inner.instance_approvals.clear();
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn put_definition(&self, definition: WorkflowDefinition) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let key = (definition.id, definition.version);
        if inner.definitions.contains_key(&key) {
            return Err(StoreError::Database(format!(
                "definition version already published: {} v{}",
                definition.id, definition.version
            )));
        }
        inner.definitions.insert(key, definition);
        Ok(())
    }

    async fn get_definition(
        &self,
        workflow_id: Uuid,
        version: i32,
    ) -> Result<WorkflowDefinition, StoreError> {
        self.inner
            .read()
            .definitions
            .get(&(workflow_id, version))
            .cloned()
            .ok_or(StoreError::DefinitionNotFound {
                workflow_id,
                version: Some(version),
            })
    }

    async fn latest_definition(&self, workflow_id: Uuid) -> Result<WorkflowDefinition, StoreError> {
        self.inner
            .read()
            .definitions
            .values()
            .filter(|d| d.id == workflow_id)
            .max_by_key(|d| d.version)
            .cloned()
            .ok_or(StoreError::DefinitionNotFound {
                workflow_id,
                version: None,
            })
    }

    async fn insert_instance(
        &self,
        instance: &WorkflowInstance,
        approvals: &[Approval],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();

        if let Some(existing) = inner
            .instances
            .values()
            .find(|i| i.entity == instance.entity && !i.is_terminal())
        {
            return Err(StoreError::DuplicateActiveInstance {
                entity: instance.entity.clone(),
                existing: existing.id,
            });
        }

        inner.instances.insert(instance.id, instance.clone());
        let ids = inner.instance_approvals.entry(instance.id).or_default();
        for approval in approvals {
            ids.push(approval.id);
        }
        for approval in approvals {
            inner.approvals.insert(approval.id, approval.clone());
        }
        Ok(())
    }

    async fn get_instance(&self, instance_id: Uuid) -> Result<WorkflowInstance, StoreError> {
        self.inner
            .read()
            .instances
            .get(&instance_id)
            .cloned()
            .ok_or(StoreError::InstanceNotFound(instance_id))
    }

    async fn find_active_for_entity(
        &self,
        entity: &EntityRef,
    ) -> Result<Option<WorkflowInstance>, StoreError> {
        Ok(self
            .inner
            .read()
            .instances
            .values()
            .find(|i| &i.entity == entity && !i.is_terminal())
            .cloned())
    }

    async fn list_instances_for_entity(
        &self,
        entity: &EntityRef,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let mut instances: Vec<WorkflowInstance> = self
            .inner
            .read()
            .instances
            .values()
            .filter(|i| &i.entity == entity)
            .cloned()
            .collect();
        instances.sort_by_key(|i| i.started_at);
        Ok(instances)
    }

    async fn commit_transition(
        &self,
        transition: InstanceTransition,
    ) -> Result<WorkflowInstance, StoreError> {
        let mut inner = self.inner.write();

        let actual = inner
            .instances
            .get(&transition.instance_id)
            .ok_or(StoreError::InstanceNotFound(transition.instance_id))?
            .row_version;

        if actual != transition.expected_version {
            return Err(StoreError::ConcurrencyConflict {
                instance_id: transition.instance_id,
                expected: transition.expected_version,
                actual,
            });
        }

        // The transition is all-or-nothing: every touched approval id must
        // resolve before any slot or the instance row is mutated.
        let touched = transition
            .decide
            .iter()
            .map(|d| d.approval_id)
            .chain(transition.delegate.iter().map(|d| d.approval_id));
        for approval_id in touched {
            if !inner.approvals.contains_key(&approval_id) {
                return Err(StoreError::ApprovalNotFound(approval_id));
            }
        }

        if let Some(decide) = &transition.decide {
            let approval = inner
                .approvals
                .get_mut(&decide.approval_id)
                .ok_or(StoreError::ApprovalNotFound(decide.approval_id))?;
            approval.decision = decide.decision;
            approval.comments = decide.comments.clone();
            approval.decided_at = Some(decide.decided_at);
        }

        if let Some(delegate) = &transition.delegate {
            let approval = inner
                .approvals
                .get_mut(&delegate.approval_id)
                .ok_or(StoreError::ApprovalNotFound(delegate.approval_id))?;
            approval.delegated_to = Some(delegate.delegated_to.clone());
        }

        for approval in &transition.new_approvals {
            inner
                .instance_approvals
                .entry(transition.instance_id)
                .or_default()
                .push(approval.id);
            inner.approvals.insert(approval.id, approval.clone());
        }

        let instance = inner
            .instances
            .get_mut(&transition.instance_id)
            .expect("checked above");

        if let Some(status) = transition.status {
            instance.status = status;
        }
        if let Some(step) = transition.current_step {
            instance.current_step = step;
        }
        if let Some(diagnostic) = transition.diagnostic {
            instance.diagnostic = Some(diagnostic);
        }
        instance.history.push(transition.record);
        instance.row_version += 1;
        instance.updated_at = Utc::now();

        Ok(instance.clone())
    }

    async fn get_approval(&self, approval_id: Uuid) -> Result<Approval, StoreError> {
        self.inner
            .read()
            .approvals
            .get(&approval_id)
            .cloned()
            .ok_or(StoreError::ApprovalNotFound(approval_id))
    }

    async fn approvals_for_instance(&self, instance_id: Uuid) -> Result<Vec<Approval>, StoreError> {
        let inner = self.inner.read();
        if !inner.instances.contains_key(&instance_id) {
            return Err(StoreError::InstanceNotFound(instance_id));
        }

        let ids = inner
            .instance_approvals
            .get(&instance_id)
            .cloned()
            .unwrap_or_default();

        let mut approvals: Vec<Approval> = ids
            .iter()
            .filter_map(|id| inner.approvals.get(id).cloned())
            .collect();
        approvals.sort_by_key(|a| (a.step_number, a.created_at));
        Ok(approvals)
    }

    async fn pending_approvals_for_user(&self, user_id: &str) -> Result<Vec<Approval>, StoreError> {
        let inner = self.inner.read();

        let mut pending: Vec<Approval> = inner
            .approvals
            .values()
            .filter(|a| a.decision == Decision::Pending && a.can_be_decided_by(user_id))
            .filter(|a| {
                // only actionable slots: current step of a live instance
                inner
                    .instances
                    .get(&a.instance_id)
                    .map(|i| !i.is_terminal() && i.current_step == a.step_number)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        pending.sort_by_key(|a| a.created_at);
        Ok(pending)
    }
}
