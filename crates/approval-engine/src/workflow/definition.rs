//! Workflow definitions: immutable, versioned approval templates

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error raised when validating a definition at publish time
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    /// Definition has no steps
    #[error("definition {0} has no steps")]
    NoSteps(Uuid),

    /// Step sequence numbers are not unique and strictly increasing
    #[error("definition {definition_id} has invalid step ordering at sequence {sequence}")]
    InvalidStepOrder { definition_id: Uuid, sequence: i32 },

    /// A step requires fewer than one approval
    #[error("step {step} of definition {definition_id} requires {required} approvals")]
    InvalidRequiredApprovals {
        definition_id: Uuid,
        step: i32,
        required: u32,
    },
}

/// One tier of a threshold-based routing rule
///
/// Tiers are evaluated against a numeric entity attribute; the highest tier
/// whose `min_value` does not exceed the attribute wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdTier {
    /// Inclusive lower bound for this tier
    pub min_value: f64,

    /// Role whose members approve at this tier
    pub role: String,
}

/// How the approvers for a step are determined
///
/// A closed set of rule kinds, resolved by the router through exhaustive
/// matching. Unknown rule kinds cannot exist at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApproverRule {
    /// An explicit, ordered list of user ids
    FixedUsers { users: Vec<String> },

    /// All current members of a role, resolved via the role directory
    Role { role: String },

    /// Role picked by comparing a numeric entity attribute against tiers
    Threshold {
        /// Attribute of the entity context to compare (e.g. "amount")
        attribute: String,

        /// Tiers ordered by ascending `min_value`
        tiers: Vec<ThresholdTier>,
    },
}

/// One stage of a definition requiring N-of-M approvals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Position of the step within the definition, unique and strictly
    /// increasing per version
    pub sequence_order: i32,

    /// Human-readable step name
    pub name: String,

    /// How approvers are resolved for this step
    pub approver_rule: ApproverRule,

    /// How many approvals complete the step (N-of-M)
    pub required_approvals: u32,

    /// Whether the step may be skipped by configuration
    pub is_required: bool,
}

impl StepDefinition {
    pub fn new(sequence_order: i32, name: impl Into<String>, rule: ApproverRule) -> Self {
        Self {
            sequence_order,
            name: name.into(),
            approver_rule: rule,
            required_approvals: 1,
            is_required: true,
        }
    }

    /// Set the number of approvals required to complete the step
    pub fn with_required_approvals(mut self, required: u32) -> Self {
        self.required_approvals = required;
        self
    }

    /// Mark the step optional
    pub fn optional(mut self) -> Self {
        self.is_required = false;
        self
    }
}

/// An immutable, versioned workflow template
///
/// Definitions are never mutated after publish; edits produce a new
/// `version` under the same `id`. Running instances stay pinned to the
/// version they were created against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable identifier shared by all versions
    pub id: Uuid,

    /// Version number, assigned at publish, immutable afterwards
    pub version: i32,

    /// Human-readable workflow name
    pub name: String,

    /// Ordered approval steps; always at least one
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    pub fn new(id: Uuid, version: i32, name: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            id,
            version,
            name: name.into(),
            steps,
        }
    }

    /// Validate the definition invariants before publish
    ///
    /// Checks that at least one step exists, that `sequence_order` values
    /// are strictly increasing, and that every step requires at least one
    /// approval. Whether `required_approvals` can actually be satisfied is
    /// checked at resolution time, not here, because role membership is a
    /// runtime property.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.steps.is_empty() {
            return Err(DefinitionError::NoSteps(self.id));
        }

        let mut previous: Option<i32> = None;
        for step in &self.steps {
            if let Some(prev) = previous {
                if step.sequence_order <= prev {
                    return Err(DefinitionError::InvalidStepOrder {
                        definition_id: self.id,
                        sequence: step.sequence_order,
                    });
                }
            }
            previous = Some(step.sequence_order);

            if step.required_approvals < 1 {
                return Err(DefinitionError::InvalidRequiredApprovals {
                    definition_id: self.id,
                    step: step.sequence_order,
                    required: step.required_approvals,
                });
            }
        }

        Ok(())
    }

    /// Number of steps in this version
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Step at a 0-based index into the ordered step list
    pub fn step_at(&self, index: i32) -> Option<&StepDefinition> {
        usize::try_from(index).ok().and_then(|i| self.steps.get(i))
    }

    /// Whether the 0-based index is the last step
    pub fn is_last_step(&self, index: i32) -> bool {
        index as usize + 1 >= self.steps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(users: &[&str]) -> ApproverRule {
        ApproverRule::FixedUsers {
            users: users.iter().map(|u| u.to_string()).collect(),
        }
    }

    #[test]
    fn validate_accepts_well_formed_definition() {
        let def = WorkflowDefinition::new(
            Uuid::now_v7(),
            1,
            "change-request",
            vec![
                StepDefinition::new(1, "team lead", fixed(&["alice"])),
                StepDefinition::new(2, "portfolio board", fixed(&["bob", "carol"]))
                    .with_required_approvals(2),
            ],
        );

        assert!(def.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_definition() {
        let def = WorkflowDefinition::new(Uuid::now_v7(), 1, "empty", vec![]);
        assert!(matches!(def.validate(), Err(DefinitionError::NoSteps(_))));
    }

    #[test]
    fn validate_rejects_non_increasing_steps() {
        let def = WorkflowDefinition::new(
            Uuid::now_v7(),
            1,
            "bad-order",
            vec![
                StepDefinition::new(2, "first", fixed(&["alice"])),
                StepDefinition::new(2, "second", fixed(&["bob"])),
            ],
        );

        assert!(matches!(
            def.validate(),
            Err(DefinitionError::InvalidStepOrder { sequence: 2, .. })
        ));
    }

    #[test]
    fn validate_rejects_zero_required_approvals() {
        let def = WorkflowDefinition::new(
            Uuid::now_v7(),
            1,
            "zero-required",
            vec![StepDefinition::new(1, "step", fixed(&["alice"])).with_required_approvals(0)],
        );

        assert!(matches!(
            def.validate(),
            Err(DefinitionError::InvalidRequiredApprovals { required: 0, .. })
        ));
    }

    #[test]
    fn approver_rule_round_trips_as_tagged_json() {
        let rule = ApproverRule::Threshold {
            attribute: "amount".to_string(),
            tiers: vec![
                ThresholdTier {
                    min_value: 0.0,
                    role: "manager".to_string(),
                },
                ThresholdTier {
                    min_value: 100_000.0,
                    role: "director".to_string(),
                },
            ],
        };

        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["kind"], "threshold");

        let back: ApproverRule = serde_json::from_value(json).unwrap();
        assert_eq!(back, rule);
    }

    #[test]
    fn step_lookup_by_index() {
        let def = WorkflowDefinition::new(
            Uuid::now_v7(),
            1,
            "lookup",
            vec![
                StepDefinition::new(10, "a", fixed(&["x"])),
                StepDefinition::new(20, "b", fixed(&["y"])),
            ],
        );

        assert_eq!(def.step_at(0).unwrap().name, "a");
        assert_eq!(def.step_at(1).unwrap().name, "b");
        assert!(def.step_at(2).is_none());
        assert!(def.step_at(-1).is_none());
        assert!(!def.is_last_step(0));
        assert!(def.is_last_step(1));
    }
}
