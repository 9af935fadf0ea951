//! WorkflowStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::workflow::{
    Approval, Decision, EntityRef, InstanceStatus, TransitionRecord, WorkflowDefinition,
    WorkflowInstance,
};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Definition not found (by id, or by id + version)
    #[error("workflow definition not found: {workflow_id} v{version:?}")]
    DefinitionNotFound {
        workflow_id: Uuid,
        version: Option<i32>,
    },

    /// Instance not found
    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// Approval not found
    #[error("approval not found: {0}")]
    ApprovalNotFound(Uuid),

    /// A non-terminal instance already exists for the entity
    #[error("entity {entity} already has active instance {existing}")]
    DuplicateActiveInstance { entity: EntityRef, existing: Uuid },

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict on instance {instance_id}: expected version {expected}, got {actual}")]
    ConcurrencyConflict {
        instance_id: Uuid,
        expected: i32,
        actual: i32,
    },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Decide exactly one approval slot as part of a transition
#[derive(Debug, Clone)]
pub struct ApprovalDecision {
    pub approval_id: Uuid,
    pub decision: Decision,
    pub comments: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// Set (or overwrite) the delegate of one approval slot
#[derive(Debug, Clone)]
pub struct ApprovalDelegation {
    pub approval_id: Uuid,
    pub delegated_to: String,
}

/// The single atomic write applied per engine state transition
///
/// A transition compare-and-swaps on the instance `row_version`; on success
/// every part below is applied in one atomic write, the version is bumped
/// and `updated_at` refreshed. A losing writer gets
/// [`StoreError::ConcurrencyConflict`] and must re-read and re-apply.
#[derive(Debug, Clone)]
pub struct InstanceTransition {
    pub instance_id: Uuid,

    /// Version the caller read; the CAS guard
    pub expected_version: i32,

    /// New status, if the transition changes it
    pub status: Option<InstanceStatus>,

    /// New current step, if the transition advances it
    pub current_step: Option<i32>,

    /// Diagnostic to set (e.g. an unresolvable-approvers stall)
    pub diagnostic: Option<String>,

    /// Approval slot decided by this transition
    pub decide: Option<ApprovalDecision>,

    /// Approval slot delegated by this transition
    pub delegate: Option<ApprovalDelegation>,

    /// Pending slots created for a newly activated step
    pub new_approvals: Vec<Approval>,

    /// History entry appended by this transition
    pub record: TransitionRecord,
}

impl InstanceTransition {
    /// Start a transition against the version the caller read
    pub fn new(instance: &WorkflowInstance, record: TransitionRecord) -> Self {
        Self {
            instance_id: instance.id,
            expected_version: instance.row_version,
            status: None,
            current_step: None,
            diagnostic: None,
            decide: None,
            delegate: None,
            new_approvals: vec![],
            record,
        }
    }

    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_current_step(mut self, step: i32) -> Self {
        self.current_step = Some(step);
        self
    }

    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostic = Some(diagnostic.into());
        self
    }

    pub fn deciding(mut self, decision: ApprovalDecision) -> Self {
        self.decide = Some(decision);
        self
    }

    pub fn delegating(mut self, delegation: ApprovalDelegation) -> Self {
        self.delegate = Some(delegation);
        self
    }

    pub fn with_new_approvals(mut self, approvals: Vec<Approval>) -> Self {
        self.new_approvals = approvals;
        self
    }
}

/// Store for workflow definitions, instances and approvals
///
/// This trait defines the interface for persisting workflow state.
/// Implementations must be thread-safe and support concurrent access;
/// per-instance serialization is achieved through the `row_version`
/// compare-and-swap in [`commit_transition`](WorkflowStore::commit_transition),
/// never through external locks.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    // =========================================================================
    // Definition Operations (append-only, versioned)
    // =========================================================================

    /// Publish a definition version; versions are immutable once stored
    async fn put_definition(&self, definition: WorkflowDefinition) -> Result<(), StoreError>;

    /// Get a specific definition version
    async fn get_definition(
        &self,
        workflow_id: Uuid,
        version: i32,
    ) -> Result<WorkflowDefinition, StoreError>;

    /// Get the highest published version of a definition
    async fn latest_definition(&self, workflow_id: Uuid) -> Result<WorkflowDefinition, StoreError>;

    // =========================================================================
    // Instance Operations
    // =========================================================================

    /// Atomically create an instance together with its initial approval
    /// slots, enforcing at most one non-terminal instance per entity
    async fn insert_instance(
        &self,
        instance: &WorkflowInstance,
        approvals: &[Approval],
    ) -> Result<(), StoreError>;

    /// Load one instance
    async fn get_instance(&self, instance_id: Uuid) -> Result<WorkflowInstance, StoreError>;

    /// Find the non-terminal instance for an entity, if any
    async fn find_active_for_entity(
        &self,
        entity: &EntityRef,
    ) -> Result<Option<WorkflowInstance>, StoreError>;

    /// All instances ever started for an entity, oldest first
    ///
    /// Includes terminal runs; an entity with no history yields an empty
    /// list rather than an error.
    async fn list_instances_for_entity(
        &self,
        entity: &EntityRef,
    ) -> Result<Vec<WorkflowInstance>, StoreError>;

    /// Apply one state transition with optimistic concurrency
    ///
    /// Returns the updated instance on success.
    async fn commit_transition(
        &self,
        transition: InstanceTransition,
    ) -> Result<WorkflowInstance, StoreError>;

    // =========================================================================
    // Approval Operations
    // =========================================================================

    /// Load one approval slot
    async fn get_approval(&self, approval_id: Uuid) -> Result<Approval, StoreError>;

    /// All approval slots of an instance, ordered by step then creation
    async fn approvals_for_instance(&self, instance_id: Uuid) -> Result<Vec<Approval>, StoreError>;

    /// Pending slots a user is currently authorized to decide
    ///
    /// Includes slots delegated to the user and excludes slots the user
    /// delegated away; only slots at the owning instance's current step on
    /// non-terminal instances count as actionable.
    async fn pending_approvals_for_user(&self, user_id: &str) -> Result<Vec<Approval>, StoreError>;
}

/// Shorthand for building a history record
pub(crate) fn record(
    actor_id: &str,
    from: InstanceStatus,
    to: InstanceStatus,
    step: i32,
    note: impl Into<String>,
) -> TransitionRecord {
    TransitionRecord {
        at: Utc::now(),
        actor_id: actor_id.to_string(),
        from_status: from,
        to_status: to,
        step,
        note: note.into(),
    }
}
