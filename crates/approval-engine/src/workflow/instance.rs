//! Workflow instances: one execution of a definition against an entity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created, but the first step's approvals are not resolved
    /// (either not yet, or stalled on an unresolvable rule)
    Pending,

    /// Approvals are outstanding for the current step
    UnderReview,

    /// Terminal: every required step met its approval count
    Approved,

    /// Terminal: a single rejection ended the run
    Rejected,

    /// Terminal: success status written by external tooling; accepted on
    /// read, never produced by the engine
    Completed,

    /// Terminal: cancelled by an administrative override
    Cancelled,
}

impl InstanceStatus {
    /// Terminal statuses admit no further mutation
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Approved | Self::Rejected | Self::Completed | Self::Cancelled
        )
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::UnderReview => write!(f, "under_review"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "under_review" => Ok(Self::UnderReview),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown instance status: {other}")),
        }
    }
}

/// The business entity a workflow runs against
///
/// The engine treats the entity as opaque; `(entity_type, entity_id)`
/// uniquely identifies it and at most one non-terminal instance may exist
/// per entity at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// Entity attributes captured at instance creation
///
/// Threshold routing rules read numeric attributes from here (e.g. the
/// monetary value of a change request). The context is captured once so
/// that later steps route against the same snapshot the run started with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityContext {
    /// Organization scope passed to the role directory
    pub organization: Option<String>,

    /// Named attributes of the entity (numbers, strings, ...)
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl EntityContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Numeric attribute lookup for threshold rules
    pub fn numeric_attribute(&self, name: &str) -> Option<f64> {
        self.attributes.get(name).and_then(|v| v.as_f64())
    }
}

/// One entry in an instance's append-only transition history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub at: DateTime<Utc>,
    pub actor_id: String,
    pub from_status: InstanceStatus,
    pub to_status: InstanceStatus,
    pub step: i32,
    pub note: String,
}

/// One running or completed workflow execution
///
/// Mutated exclusively through the store's `commit_transition`, which
/// compare-and-swaps on `row_version`; `current_step` only ever increases
/// while the instance is non-terminal, and terminal instances are retained
/// forever for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,

    /// Definition this instance runs, pinned at creation
    pub workflow_id: Uuid,
    pub version: i32,

    pub entity: EntityRef,

    /// Entity snapshot used for threshold routing on every step
    pub context: EntityContext,

    /// 0-based index into the definition's step list
    pub current_step: i32,

    pub status: InstanceStatus,

    pub initiator_id: String,

    /// Set when approver resolution stalled the instance; cleared only by
    /// administrative intervention outside the engine
    pub diagnostic: Option<String>,

    /// Optimistic-concurrency version, bumped on every committed transition
    pub row_version: i32,

    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Append-only transition log
    pub history: Vec<TransitionRecord>,
}

impl WorkflowInstance {
    /// Build a fresh instance at step 0 in `Pending` status
    pub fn new(
        workflow_id: Uuid,
        version: i32,
        entity: EntityRef,
        context: EntityContext,
        initiator_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            version,
            entity,
            context,
            current_step: 0,
            status: InstanceStatus::Pending,
            initiator_id: initiator_id.into(),
            diagnostic: None,
            row_version: 0,
            started_at: now,
            updated_at: now,
            history: vec![],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!InstanceStatus::Pending.is_terminal());
        assert!(!InstanceStatus::UnderReview.is_terminal());
        assert!(InstanceStatus::Approved.is_terminal());
        assert!(InstanceStatus::Rejected.is_terminal());
        assert!(InstanceStatus::Completed.is_terminal());
        assert!(InstanceStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            InstanceStatus::Pending,
            InstanceStatus::UnderReview,
            InstanceStatus::Approved,
            InstanceStatus::Rejected,
            InstanceStatus::Completed,
            InstanceStatus::Cancelled,
        ] {
            let parsed: InstanceStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("running".parse::<InstanceStatus>().is_err());
    }

    #[test]
    fn numeric_attribute_lookup() {
        let context = EntityContext::new()
            .with_attribute("amount", 125_000.5)
            .with_attribute("label", "capex");

        assert_eq!(context.numeric_attribute("amount"), Some(125_000.5));
        assert_eq!(context.numeric_attribute("label"), None);
        assert_eq!(context.numeric_attribute("missing"), None);
    }

    #[test]
    fn new_instance_starts_pending_at_step_zero() {
        let instance = WorkflowInstance::new(
            Uuid::now_v7(),
            3,
            EntityRef::new("change_request", "CR-17"),
            EntityContext::new(),
            "ingrid",
        );

        assert_eq!(instance.status, InstanceStatus::Pending);
        assert_eq!(instance.current_step, 0);
        assert_eq!(instance.row_version, 0);
        assert_eq!(instance.version, 3);
        assert!(instance.history.is_empty());
    }
}
