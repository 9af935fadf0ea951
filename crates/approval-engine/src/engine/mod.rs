//! The approval workflow state machine
//!
//! [`ApprovalEngine`] owns all orchestration: it creates instances, accepts
//! decisions, advances or terminates steps, applies delegation, and emits
//! one audit/notification event per committed transition. All mutation goes
//! through the store's compare-and-swap `commit_transition`, so concurrent
//! writers to the same instance serialize; losers re-read and re-apply
//! under a bounded [`RetryPolicy`].

mod retry;

pub use retry::RetryPolicy;

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cache::WorkflowCache;
use crate::events::{ApprovalEvent, EventSink, EventType};
use crate::metrics::PerformanceMonitor;
use crate::persistence::{
    record, ApprovalDecision, ApprovalDelegation, InstanceTransition, StoreError, WorkflowStore,
};
use crate::routing::{ApprovalRouter, DirectoryError, RoleDirectory, RoutingError};
use crate::workflow::{
    Approval, Decision, DefinitionError, EntityContext, EntityRef, InstanceStatus,
    WorkflowDefinition, WorkflowInstance,
};

/// Errors surfaced by engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No definition published under this workflow id
    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(Uuid),

    /// No instance with this id
    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// No approval slot with this id
    #[error("approval not found: {0}")]
    ApprovalNotFound(Uuid),

    /// The instance is terminal; the current status is included so callers
    /// can treat benign re-submissions as such
    #[error("instance {instance_id} is terminal ({status})")]
    InstanceTerminal {
        instance_id: Uuid,
        status: InstanceStatus,
    },

    /// The approval slot was already decided
    #[error("approval {approval_id} already decided ({decision})")]
    ApprovalAlreadyDecided {
        approval_id: Uuid,
        decision: Decision,
    },

    /// A non-terminal instance already exists for the entity
    #[error("entity {entity} already has active instance {existing}")]
    DuplicateActiveInstance { entity: EntityRef, existing: Uuid },

    /// The caller has no standing to act on this approval/instance
    #[error("user {actor_id} is not authorized: {reason}")]
    NotAuthorized { actor_id: String, reason: String },

    /// Invalid definition submitted for publication
    #[error(transparent)]
    InvalidDefinition(#[from] DefinitionError),

    /// Lost the optimistic-concurrency race too many times
    #[error("concurrent modification of instance {0}, retries exhausted")]
    ConcurrentModification(Uuid),

    /// The role directory collaborator failed
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// Store infrastructure failure
    #[error("store unavailable: {0}")]
    Store(StoreError),
}

/// Map store errors onto the engine taxonomy
fn store_err(e: StoreError) -> EngineError {
    match e {
        StoreError::DefinitionNotFound { workflow_id, .. } => {
            EngineError::DefinitionNotFound(workflow_id)
        }
        StoreError::InstanceNotFound(id) => EngineError::InstanceNotFound(id),
        StoreError::ApprovalNotFound(id) => EngineError::ApprovalNotFound(id),
        StoreError::DuplicateActiveInstance { entity, existing } => {
            EngineError::DuplicateActiveInstance { entity, existing }
        }
        StoreError::ConcurrencyConflict { instance_id, .. } => {
            EngineError::ConcurrentModification(instance_id)
        }
        other => EngineError::Store(other),
    }
}

/// The decision a caller submits for a pending approval
///
/// A closed two-variant type: there is no way to "submit pending".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Approve,
    Reject,
}

impl Verdict {
    fn as_decision(self) -> Decision {
        match self {
            Self::Approve => Decision::Approved,
            Self::Reject => Decision::Rejected,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Users allowed to delegate on behalf of any approver
    pub administrators: Vec<String>,

    /// Retry policy for lost compare-and-swap races
    pub retry: RetryPolicy,
}

impl EngineConfig {
    pub fn with_administrators(
        mut self,
        admins: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.administrators = admins.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn is_administrator(&self, user_id: &str) -> bool {
        self.administrators.iter().any(|a| a == user_id)
    }
}

/// The approval workflow orchestrator
///
/// Owns no persisted state: the store is the single source of truth and
/// the cache is a disposable, invalidated-on-write view. All collaborators
/// are injected. There is no ambient session context; every operation
/// takes its acting user explicitly.
pub struct ApprovalEngine {
    store: Arc<dyn WorkflowStore>,
    router: ApprovalRouter,
    cache: Arc<WorkflowCache>,
    events: Arc<dyn EventSink>,
    monitor: Arc<PerformanceMonitor>,
    config: EngineConfig,
}

impl ApprovalEngine {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        directory: Arc<dyn RoleDirectory>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            router: ApprovalRouter::new(directory),
            cache: Arc::new(WorkflowCache::new(Default::default())),
            events,
            monitor: Arc::new(PerformanceMonitor::new()),
            config: EngineConfig::default(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<WorkflowCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cache(&self) -> &Arc<WorkflowCache> {
        &self.cache
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    // =========================================================================
    // Definitions
    // =========================================================================

    /// Validate and publish a definition version
    #[instrument(skip(self, definition), fields(workflow_id = %definition.id, version = definition.version))]
    pub async fn publish_definition(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<(), EngineError> {
        definition.validate()?;
        self.store
            .put_definition(definition)
            .await
            .map_err(store_err)
    }

    /// Definition lookup through the cache
    async fn definition(
        &self,
        workflow_id: Uuid,
        version: i32,
    ) -> Result<WorkflowDefinition, EngineError> {
        if let Some(cached) = self.cache.get_definition(workflow_id, version) {
            return Ok(cached);
        }
        let definition = self
            .store
            .get_definition(workflow_id, version)
            .await
            .map_err(store_err)?;
        self.cache.put_definition(definition.clone());
        Ok(definition)
    }

    // =========================================================================
    // Instance lifecycle
    // =========================================================================

    /// Create an instance of the latest definition version for an entity
    ///
    /// Fails with [`EngineError::DuplicateActiveInstance`] if the entity
    /// already has a non-terminal instance. If the first step's approvers
    /// cannot be resolved the instance is persisted `pending` with a
    /// diagnostic instead of failing, so an administrator can inspect it.
    #[instrument(skip(self, context), fields(%workflow_id, entity = %entity))]
    pub async fn create_instance(
        &self,
        workflow_id: Uuid,
        entity: EntityRef,
        context: EntityContext,
        initiator_id: &str,
    ) -> Result<WorkflowInstance, EngineError> {
        let timer = self.monitor.start("create_instance");
        let result = self
            .create_instance_inner(workflow_id, entity, context, initiator_id)
            .await;
        timer.finish(result.is_ok());
        result
    }

    async fn create_instance_inner(
        &self,
        workflow_id: Uuid,
        entity: EntityRef,
        context: EntityContext,
        initiator_id: &str,
    ) -> Result<WorkflowInstance, EngineError> {
        let definition = self
            .store
            .latest_definition(workflow_id)
            .await
            .map_err(store_err)?;
        self.cache.put_definition(definition.clone());

        let mut instance =
            WorkflowInstance::new(workflow_id, definition.version, entity, context, initiator_id);

        let step = definition
            .step_at(0)
            .ok_or(EngineError::InvalidDefinition(DefinitionError::NoSteps(
                definition.id,
            )))?;

        let approvals = match self.router.resolve_approvers(step, &instance.context).await {
            Ok(approvers) => {
                instance.status = InstanceStatus::UnderReview;
                instance.history.push(record(
                    initiator_id,
                    InstanceStatus::Pending,
                    InstanceStatus::UnderReview,
                    0,
                    format!("created, step '{}' activated", step.name),
                ));
                approvers
                    .iter()
                    .map(|user| Approval::pending(instance.id, 0, user))
                    .collect()
            }
            Err(RoutingError::UnresolvableApprovers { reason, .. }) => {
                warn!(instance_id = %instance.id, %reason, "instance stalled at creation");
                instance.diagnostic = Some(reason.clone());
                instance.history.push(record(
                    initiator_id,
                    InstanceStatus::Pending,
                    InstanceStatus::Pending,
                    0,
                    format!("created stalled: {reason}"),
                ));
                vec![]
            }
            Err(RoutingError::Directory(e)) => return Err(e.into()),
        };

        self.store
            .insert_instance(&instance, &approvals)
            .await
            .map_err(store_err)?;

        for approval in &approvals {
            self.cache.invalidate_pending_for_user(&approval.approver_id);
        }

        self.monitor.record_created();
        self.emit(ApprovalEvent::new(
            EventType::WorkflowCreated,
            instance.id,
            0,
            initiator_id,
            serde_json::json!({
                "workflow_id": instance.workflow_id,
                "version": instance.version,
                "entity_type": instance.entity.entity_type,
                "entity_id": instance.entity.entity_id,
                "status": instance.status,
                "diagnostic": instance.diagnostic,
            }),
        ))
        .await;

        info!(instance_id = %instance.id, status = %instance.status, "created instance");
        Ok(instance)
    }

    /// Submit an approve/reject decision for the caller's pending slot at
    /// the instance's current step
    ///
    /// Returns the updated instance snapshot. Decisions against terminal
    /// instances are rejected with [`EngineError::InstanceTerminal`], not
    /// silently ignored.
    #[instrument(skip(self, comments), fields(%instance_id, actor = %actor_id, ?verdict))]
    pub async fn submit_decision(
        &self,
        instance_id: Uuid,
        actor_id: &str,
        verdict: Verdict,
        comments: Option<String>,
    ) -> Result<WorkflowInstance, EngineError> {
        let timer = self.monitor.start("submit_decision");
        let result = self
            .retry_loop(instance_id, || {
                self.try_submit_decision(instance_id, actor_id, verdict, comments.clone())
            })
            .await;
        timer.finish(result.is_ok());
        result
    }

    async fn try_submit_decision(
        &self,
        instance_id: Uuid,
        actor_id: &str,
        verdict: Verdict,
        comments: Option<String>,
    ) -> Result<WorkflowInstance, EngineError> {
        // Always re-read from the store: authoritative decisions never
        // trust the cache.
        let instance = self
            .store
            .get_instance(instance_id)
            .await
            .map_err(store_err)?;

        if instance.is_terminal() {
            return Err(EngineError::InstanceTerminal {
                instance_id,
                status: instance.status,
            });
        }

        let approvals = self
            .store
            .approvals_for_instance(instance_id)
            .await
            .map_err(store_err)?;

        let step_approvals: Vec<&Approval> = approvals
            .iter()
            .filter(|a| a.step_number == instance.current_step)
            .collect();

        let slot = match step_approvals
            .iter()
            .find(|a| !a.is_decided() && a.can_be_decided_by(actor_id))
        {
            Some(slot) => *slot,
            None => {
                // Distinguish "already voted" from "no standing at all"
                if let Some(decided) = step_approvals
                    .iter()
                    .find(|a| a.is_decided() && a.authorized_decider() == actor_id)
                {
                    return Err(EngineError::ApprovalAlreadyDecided {
                        approval_id: decided.id,
                        decision: decided.decision,
                    });
                }
                return Err(EngineError::NotAuthorized {
                    actor_id: actor_id.to_string(),
                    reason: format!(
                        "no pending approval at step {} of instance {instance_id}",
                        instance.current_step
                    ),
                });
            }
        };

        let decide = ApprovalDecision {
            approval_id: slot.id,
            decision: verdict.as_decision(),
            comments,
            decided_at: Utc::now(),
        };

        let outcome = match verdict {
            Verdict::Reject => DecisionOutcome::Rejected,
            Verdict::Approve => {
                let definition = self
                    .definition(instance.workflow_id, instance.version)
                    .await?;
                let step = definition.step_at(instance.current_step).ok_or_else(|| {
                    EngineError::Store(StoreError::Serialization(format!(
                        "instance {instance_id} step {} out of range",
                        instance.current_step
                    )))
                })?;

                let approved_now = 1 + step_approvals
                    .iter()
                    .filter(|a| a.decision == Decision::Approved)
                    .count() as u32;

                if approved_now < step.required_approvals {
                    DecisionOutcome::AwaitingMore
                } else if definition.is_last_step(instance.current_step) {
                    DecisionOutcome::Completed
                } else {
                    let next_index = instance.current_step + 1;
                    let next_step = definition.step_at(next_index).ok_or_else(|| {
                        EngineError::Store(StoreError::Serialization(format!(
                            "definition {} v{} has no step {next_index}",
                            definition.id, definition.version
                        )))
                    })?;

                    match self
                        .router
                        .resolve_approvers(next_step, &instance.context)
                        .await
                    {
                        Ok(approvers) => DecisionOutcome::Advanced {
                            next_index,
                            approvals: approvers
                                .iter()
                                .map(|user| Approval::pending(instance_id, next_index, user))
                                .collect(),
                            stall: None,
                        },
                        Err(RoutingError::UnresolvableApprovers { reason, .. }) => {
                            DecisionOutcome::Advanced {
                                next_index,
                                approvals: vec![],
                                stall: Some(reason),
                            }
                        }
                        Err(RoutingError::Directory(e)) => return Err(e.into()),
                    }
                }
            }
        };

        let transition = match &outcome {
            DecisionOutcome::Rejected => InstanceTransition::new(
                &instance,
                record(
                    actor_id,
                    instance.status,
                    InstanceStatus::Rejected,
                    instance.current_step,
                    "rejected",
                ),
            )
            .with_status(InstanceStatus::Rejected)
            .deciding(decide),

            DecisionOutcome::AwaitingMore => InstanceTransition::new(
                &instance,
                record(
                    actor_id,
                    instance.status,
                    instance.status,
                    instance.current_step,
                    "approved, awaiting further approvals",
                ),
            )
            .deciding(decide),

            DecisionOutcome::Completed => InstanceTransition::new(
                &instance,
                record(
                    actor_id,
                    instance.status,
                    InstanceStatus::Approved,
                    instance.current_step,
                    "final step approved",
                ),
            )
            .with_status(InstanceStatus::Approved)
            .deciding(decide),

            DecisionOutcome::Advanced {
                next_index,
                approvals,
                stall,
            } => {
                let mut t = InstanceTransition::new(
                    &instance,
                    record(
                        actor_id,
                        instance.status,
                        InstanceStatus::UnderReview,
                        instance.current_step,
                        format!("step approved, advanced to step {next_index}"),
                    ),
                )
                .with_status(InstanceStatus::UnderReview)
                .with_current_step(*next_index)
                .deciding(decide)
                .with_new_approvals(approvals.clone());
                if let Some(reason) = stall {
                    warn!(%instance_id, step = next_index, %reason, "instance stalled at step advance");
                    t = t.with_diagnostic(reason.clone());
                }
                t
            }
        };

        let updated = self
            .store
            .commit_transition(transition)
            .await
            .map_err(store_err)?;

        // Post-commit effects: cache, metrics, events. None of these can
        // roll back the transition.
        self.cache.invalidate_instance(instance_id);
        self.cache.invalidate_pending_for_user(actor_id);
        for approval in approvals
            .iter()
            .filter(|a| !a.is_decided())
            .chain(outcome.new_approvals())
        {
            self.cache
                .invalidate_pending_for_user(approval.authorized_decider());
        }

        match &outcome {
            DecisionOutcome::Rejected => {
                self.monitor.record_rejected();
                self.emit(ApprovalEvent::new(
                    EventType::WorkflowRejected,
                    instance_id,
                    instance.current_step,
                    actor_id,
                    serde_json::json!({ "approval_id": slot.id }),
                ))
                .await;
            }
            DecisionOutcome::AwaitingMore => {
                debug!(%instance_id, "approval recorded, step not yet satisfied");
            }
            DecisionOutcome::Completed => {
                self.monitor.record_approved();
                self.emit(ApprovalEvent::new(
                    EventType::WorkflowApproved,
                    instance_id,
                    instance.current_step,
                    actor_id,
                    serde_json::json!({ "approval_id": slot.id }),
                ))
                .await;
            }
            DecisionOutcome::Advanced {
                next_index, stall, ..
            } => {
                self.emit(ApprovalEvent::new(
                    EventType::WorkflowStepAdvanced,
                    instance_id,
                    *next_index,
                    actor_id,
                    serde_json::json!({
                        "from_step": instance.current_step,
                        "to_step": next_index,
                        "diagnostic": stall,
                    }),
                ))
                .await;
            }
        }

        Ok(updated)
    }

    /// Delegate a pending approval to another user
    ///
    /// The caller must be the slot's original approver or an administrator.
    /// Re-delegation overwrites the previous delegate.
    #[instrument(skip(self), fields(%approval_id, from = %from_user_id, to = %to_user_id))]
    pub async fn delegate_approval(
        &self,
        approval_id: Uuid,
        from_user_id: &str,
        to_user_id: &str,
    ) -> Result<Approval, EngineError> {
        let timer = self.monitor.start("delegate_approval");
        let result = self
            .delegate_approval_inner(approval_id, from_user_id, to_user_id)
            .await;
        timer.finish(result.is_ok());
        result
    }

    async fn delegate_approval_inner(
        &self,
        approval_id: Uuid,
        from_user_id: &str,
        to_user_id: &str,
    ) -> Result<Approval, EngineError> {
        let approval = self
            .store
            .get_approval(approval_id)
            .await
            .map_err(store_err)?;
        let instance_id = approval.instance_id;

        self.retry_loop(instance_id, || {
            self.try_delegate(approval_id, from_user_id, to_user_id)
        })
        .await?;

        self.store.get_approval(approval_id).await.map_err(store_err)
    }

    async fn try_delegate(
        &self,
        approval_id: Uuid,
        from_user_id: &str,
        to_user_id: &str,
    ) -> Result<WorkflowInstance, EngineError> {
        let approval = self
            .store
            .get_approval(approval_id)
            .await
            .map_err(store_err)?;

        if approval.is_decided() {
            return Err(EngineError::ApprovalAlreadyDecided {
                approval_id,
                decision: approval.decision,
            });
        }

        let instance = self
            .store
            .get_instance(approval.instance_id)
            .await
            .map_err(store_err)?;

        if instance.is_terminal() {
            return Err(EngineError::InstanceTerminal {
                instance_id: instance.id,
                status: instance.status,
            });
        }

        if approval.approver_id != from_user_id && !self.config.is_administrator(from_user_id) {
            return Err(EngineError::NotAuthorized {
                actor_id: from_user_id.to_string(),
                reason: format!("not the approver of {approval_id} and not an administrator"),
            });
        }

        let previous_decider = approval.authorized_decider().to_string();

        let transition = InstanceTransition::new(
            &instance,
            record(
                from_user_id,
                instance.status,
                instance.status,
                approval.step_number,
                format!("approval delegated to {to_user_id}"),
            ),
        )
        .delegating(ApprovalDelegation {
            approval_id,
            delegated_to: to_user_id.to_string(),
        });

        let updated = self
            .store
            .commit_transition(transition)
            .await
            .map_err(store_err)?;

        self.cache.invalidate_instance(instance.id);
        self.cache.invalidate_pending_for_user(&previous_decider);
        self.cache.invalidate_pending_for_user(to_user_id);

        self.emit(ApprovalEvent::new(
            EventType::ApprovalDelegated,
            instance.id,
            approval.step_number,
            from_user_id,
            serde_json::json!({
                "approval_id": approval_id,
                "delegated_to": to_user_id,
            }),
        ))
        .await;

        Ok(updated)
    }

    /// Administrative override: cancel any non-terminal instance
    #[instrument(skip(self), fields(%instance_id, actor = %actor_id))]
    pub async fn cancel_instance(
        &self,
        instance_id: Uuid,
        actor_id: &str,
    ) -> Result<WorkflowInstance, EngineError> {
        let timer = self.monitor.start("cancel_instance");
        let result = self
            .retry_loop(instance_id, || self.try_cancel(instance_id, actor_id))
            .await;
        timer.finish(result.is_ok());
        result
    }

    async fn try_cancel(
        &self,
        instance_id: Uuid,
        actor_id: &str,
    ) -> Result<WorkflowInstance, EngineError> {
        let instance = self
            .store
            .get_instance(instance_id)
            .await
            .map_err(store_err)?;

        if instance.is_terminal() {
            return Err(EngineError::InstanceTerminal {
                instance_id,
                status: instance.status,
            });
        }

        let transition = InstanceTransition::new(
            &instance,
            record(
                actor_id,
                instance.status,
                InstanceStatus::Cancelled,
                instance.current_step,
                "cancelled",
            ),
        )
        .with_status(InstanceStatus::Cancelled);

        let updated = self
            .store
            .commit_transition(transition)
            .await
            .map_err(store_err)?;

        self.cache.invalidate_instance(instance_id);
        if let Ok(approvals) = self.store.approvals_for_instance(instance_id).await {
            for approval in approvals.iter().filter(|a| !a.is_decided()) {
                self.cache
                    .invalidate_pending_for_user(approval.authorized_decider());
            }
        }

        self.monitor.record_cancelled();
        self.emit(ApprovalEvent::new(
            EventType::WorkflowCancelled,
            instance_id,
            instance.current_step,
            actor_id,
            serde_json::json!({ "previous_status": instance.status }),
        ))
        .await;

        Ok(updated)
    }

    // =========================================================================
    // Reads (lock-free, cache-accelerated, possibly slightly stale)
    // =========================================================================

    /// Instance snapshot through the cache
    #[instrument(skip(self))]
    pub async fn get_instance(&self, instance_id: Uuid) -> Result<WorkflowInstance, EngineError> {
        let timer = self.monitor.start("get_instance");
        let result = self.get_instance_inner(instance_id).await;
        timer.finish(result.is_ok());
        result
    }

    async fn get_instance_inner(
        &self,
        instance_id: Uuid,
    ) -> Result<WorkflowInstance, EngineError> {
        if let Some(cached) = self.cache.get_instance(instance_id) {
            return Ok(cached);
        }
        let instance = self
            .store
            .get_instance(instance_id)
            .await
            .map_err(store_err)?;
        self.cache.put_instance(instance.clone());
        Ok(instance)
    }

    /// Current status of an instance
    pub async fn get_instance_status(
        &self,
        instance_id: Uuid,
    ) -> Result<InstanceStatus, EngineError> {
        Ok(self.get_instance(instance_id).await?.status)
    }

    /// Pending approvals the user can currently act on
    #[instrument(skip(self))]
    pub async fn list_pending_approvals_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<Approval>, EngineError> {
        let timer = self.monitor.start("list_pending_approvals");
        let result = self.list_pending_inner(user_id).await;
        timer.finish(result.is_ok());
        result
    }

    async fn list_pending_inner(&self, user_id: &str) -> Result<Vec<Approval>, EngineError> {
        if let Some(cached) = self.cache.get_pending_for_user(user_id) {
            return Ok(cached);
        }
        let pending = self
            .store
            .pending_approvals_for_user(user_id)
            .await
            .map_err(store_err)?;
        self.cache.put_pending_for_user(user_id, pending.clone());
        Ok(pending)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Run a read-modify-write closure, retrying lost CAS races
    async fn retry_loop<F, Fut, T>(&self, instance_id: Uuid, mut op: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, EngineError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Err(EngineError::ConcurrentModification(_))
                    if attempt < self.config.retry.max_attempts =>
                {
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    debug!(%instance_id, attempt, ?delay, "lost concurrency race, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// At-least-once emission attempt; failures are logged, never fatal
    async fn emit(&self, event: ApprovalEvent) {
        if let Err(e) = self.events.publish(event.clone()).await {
            warn!(
                event_type = %event.event_type,
                instance_id = %event.instance_id,
                error = %e,
                "event emission failed"
            );
        }
    }
}

/// What a single approve/reject does to the instance
enum DecisionOutcome {
    /// Rejection terminates the run immediately
    Rejected,
    /// Approved, but the step still needs more approvals
    AwaitingMore,
    /// Approved and this was the last step
    Completed,
    /// Approved, step satisfied, advance to the next step
    Advanced {
        next_index: i32,
        approvals: Vec<Approval>,
        stall: Option<String>,
    },
}

impl DecisionOutcome {
    fn new_approvals(&self) -> impl Iterator<Item = &Approval> {
        match self {
            Self::Advanced { approvals, .. } => approvals.iter(),
            _ => [].iter(),
        }
    }
}
