//! Approval records: pending or resolved decision slots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State of a single approval slot
///
/// Transitions only `pending -> approved` or `pending -> rejected`,
/// never reversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Pending,
    Approved,
    Rejected,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

impl std::str::FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown decision: {other}")),
        }
    }
}

/// One approver's pending or decided vote for one step of one instance
///
/// A batch of approval rows is created when a step becomes active, one per
/// resolved approver. Rows are never deleted, only decided. When
/// `delegated_to` is set, the delegate (not the original `approver_id`)
/// holds decision authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub id: Uuid,
    pub instance_id: Uuid,

    /// 0-based step index this slot belongs to
    pub step_number: i32,

    /// Originally resolved approver; retained even after delegation
    pub approver_id: String,

    /// Current delegate, if decision authority was reassigned
    pub delegated_to: Option<String>,

    pub decision: Decision,
    pub comments: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl Approval {
    /// Create a pending slot for a resolved approver
    pub fn pending(instance_id: Uuid, step_number: i32, approver_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id,
            step_number,
            approver_id: approver_id.into(),
            delegated_to: None,
            decision: Decision::Pending,
            comments: None,
            decided_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_decided(&self) -> bool {
        self.decision != Decision::Pending
    }

    /// The user currently authorized to decide this slot
    pub fn authorized_decider(&self) -> &str {
        self.delegated_to.as_deref().unwrap_or(&self.approver_id)
    }

    /// Whether `user_id` may decide this slot right now
    pub fn can_be_decided_by(&self, user_id: &str) -> bool {
        self.authorized_decider() == user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_slot_has_no_decision() {
        let approval = Approval::pending(Uuid::now_v7(), 0, "alice");
        assert_eq!(approval.decision, Decision::Pending);
        assert!(!approval.is_decided());
        assert!(approval.decided_at.is_none());
    }

    #[test]
    fn delegation_redirects_authority() {
        let mut approval = Approval::pending(Uuid::now_v7(), 1, "alice");
        assert!(approval.can_be_decided_by("alice"));
        assert!(!approval.can_be_decided_by("dave"));

        approval.delegated_to = Some("dave".to_string());
        assert!(!approval.can_be_decided_by("alice"));
        assert!(approval.can_be_decided_by("dave"));
        assert_eq!(approval.authorized_decider(), "dave");

        // re-delegation overwrites the delegate
        approval.delegated_to = Some("erin".to_string());
        assert!(!approval.can_be_decided_by("dave"));
        assert!(approval.can_be_decided_by("erin"));
    }

    #[test]
    fn decision_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(Decision::Approved).unwrap(),
            serde_json::json!("approved")
        );
        let parsed: Decision = "rejected".parse().unwrap();
        assert_eq!(parsed, Decision::Rejected);
    }
}
