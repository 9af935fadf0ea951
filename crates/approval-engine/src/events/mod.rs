//! Outbound audit/notification events
//!
//! The engine emits one event per committed state transition through an
//! [`EventSink`]. Emission is at-least-once attempted: a sink failure is
//! logged and never rolls back the transition. Delivery mechanics (email,
//! push, audit storage) belong to the surrounding application.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// Fixed set of transition event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowCreated,
    WorkflowStepAdvanced,
    WorkflowApproved,
    WorkflowRejected,
    WorkflowCancelled,
    ApprovalDelegated,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WorkflowCreated => write!(f, "workflow_created"),
            Self::WorkflowStepAdvanced => write!(f, "workflow_step_advanced"),
            Self::WorkflowApproved => write!(f, "workflow_approved"),
            Self::WorkflowRejected => write!(f, "workflow_rejected"),
            Self::WorkflowCancelled => write!(f, "workflow_cancelled"),
            Self::ApprovalDelegated => write!(f, "approval_delegated"),
        }
    }
}

/// The fixed event shape handed to external collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalEvent {
    pub event_type: EventType,
    pub instance_id: Uuid,
    pub step_number: i32,
    pub actor_id: String,
    pub timestamp: DateTime<Utc>,

    /// Transition-specific detail (entity ref, decision, delegate, ...)
    pub payload: serde_json::Value,
}

impl ApprovalEvent {
    pub fn new(
        event_type: EventType,
        instance_id: Uuid,
        step_number: i32,
        actor_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            instance_id,
            step_number,
            actor_id: actor_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Error from an event sink
#[derive(Debug, thiserror::Error)]
#[error("event sink error: {0}")]
pub struct SinkError(pub String);

/// Outbound transition-event boundary
///
/// Implementations can forward to a message bus, write an audit table, or
/// collect in memory for tests. The engine never depends on delivery.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: ApprovalEvent) -> Result<(), SinkError>;
}

/// Sink that logs each event through `tracing`
#[derive(Debug, Default, Clone)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn publish(&self, event: ApprovalEvent) -> Result<(), SinkError> {
        info!(
            event_type = %event.event_type,
            instance_id = %event.instance_id,
            step = event.step_number,
            actor = %event.actor_id,
            "workflow event"
        );
        Ok(())
    }
}

/// Sink that collects events in memory, for tests
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<ApprovalEvent>>,
}

impl CollectingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything published so far
    pub fn events(&self) -> Vec<ApprovalEvent> {
        self.events.lock().clone()
    }

    /// Event types in publication order
    pub fn event_types(&self) -> Vec<EventType> {
        self.events.lock().iter().map(|e| e.event_type).collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn publish(&self, event: ApprovalEvent) -> Result<(), SinkError> {
        self.events.lock().push(event);
        Ok(())
    }
}
