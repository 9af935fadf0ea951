//! Domain types for approval workflows
//!
//! A [`WorkflowDefinition`] is an immutable, versioned template of ordered
//! approval steps. A [`WorkflowInstance`] is one execution of a definition
//! against a business entity, and each [`Approval`] is a single approver's
//! pending or decided vote for one step of one instance.

mod approval;
mod definition;
mod instance;

pub use approval::{Approval, Decision};
pub use definition::{
    ApproverRule, DefinitionError, StepDefinition, ThresholdTier, WorkflowDefinition,
};
pub use instance::{
    EntityContext, EntityRef, InstanceStatus, TransitionRecord, WorkflowInstance,
};
