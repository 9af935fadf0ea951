//! Approver resolution
//!
//! The router turns a step's abstract [`ApproverRule`] into the concrete,
//! ordered set of user ids who may act, at step-activation time. Role
//! membership lives behind the [`RoleDirectory`] trait, the external RBAC
//! collaborator boundary.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

use crate::workflow::{ApproverRule, EntityContext, StepDefinition};

/// Error from the role directory collaborator
#[derive(Debug, thiserror::Error)]
#[error("role directory error: {0}")]
pub struct DirectoryError(pub String);

/// External role-membership collaborator
///
/// Implementations can query an RBAC service, LDAP, or a static map for
/// tests. `organization_scope` narrows membership when the caller's tenant
/// model requires it.
#[async_trait]
pub trait RoleDirectory: Send + Sync {
    async fn resolve_role_members(
        &self,
        role_name: &str,
        organization_scope: Option<&str>,
    ) -> Result<Vec<String>, DirectoryError>;
}

/// Static in-memory role directory, for tests and examples
#[derive(Debug, Default)]
pub struct StaticRoleDirectory {
    roles: HashMap<String, Vec<String>>,
}

impl StaticRoleDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a role and its members
    pub fn with_role(
        mut self,
        role: impl Into<String>,
        members: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.roles
            .insert(role.into(), members.into_iter().map(Into::into).collect());
        self
    }
}

#[async_trait]
impl RoleDirectory for StaticRoleDirectory {
    async fn resolve_role_members(
        &self,
        role_name: &str,
        _organization_scope: Option<&str>,
    ) -> Result<Vec<String>, DirectoryError> {
        Ok(self.roles.get(role_name).cloned().unwrap_or_default())
    }
}

/// Routing failure
///
/// `UnresolvableApprovers` is a configuration error, not a hard failure:
/// the engine stalls the instance with a diagnostic instead of aborting,
/// so an administrator can inspect and fix the routing rule.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    /// A rule yielded zero eligible approvers, or fewer than the step
    /// requires
    #[error("step {step} has no resolvable approvers: {reason}")]
    UnresolvableApprovers { step: i32, reason: String },

    /// The role directory collaborator failed
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Resolves step routing rules into concrete approver identities
pub struct ApprovalRouter {
    directory: std::sync::Arc<dyn RoleDirectory>,
}

impl ApprovalRouter {
    pub fn new(directory: std::sync::Arc<dyn RoleDirectory>) -> Self {
        Self { directory }
    }

    /// Resolve the ordered approver set for a step
    ///
    /// The result preserves rule order and is deduplicated. Fails with
    /// [`RoutingError::UnresolvableApprovers`] when the rule yields zero
    /// users, when a threshold attribute is missing or non-numeric, when
    /// no tier matches, or when fewer users resolve than the step's
    /// `required_approvals`; the step could never complete in any of
    /// those states.
    pub async fn resolve_approvers(
        &self,
        step: &StepDefinition,
        context: &EntityContext,
    ) -> Result<Vec<String>, RoutingError> {
        let unresolvable = |reason: String| RoutingError::UnresolvableApprovers {
            step: step.sequence_order,
            reason,
        };

        let users = match &step.approver_rule {
            ApproverRule::FixedUsers { users } => users.clone(),

            ApproverRule::Role { role } => {
                self.directory
                    .resolve_role_members(role, context.organization.as_deref())
                    .await?
            }

            ApproverRule::Threshold { attribute, tiers } => {
                let value = context.numeric_attribute(attribute).ok_or_else(|| {
                    unresolvable(format!("entity attribute '{attribute}' is missing or not numeric"))
                })?;

                let tier = tiers
                    .iter()
                    .filter(|t| t.min_value <= value)
                    .max_by(|a, b| a.min_value.total_cmp(&b.min_value))
                    .ok_or_else(|| {
                        unresolvable(format!("no threshold tier matches {attribute}={value}"))
                    })?;

                debug!(
                    attribute, value, role = %tier.role,
                    "threshold rule selected role"
                );

                self.directory
                    .resolve_role_members(&tier.role, context.organization.as_deref())
                    .await?
            }
        };

        let mut seen = std::collections::HashSet::new();
        let resolved: Vec<String> = users.into_iter().filter(|u| seen.insert(u.clone())).collect();

        if resolved.is_empty() {
            return Err(unresolvable("rule resolved to zero users".to_string()));
        }

        if resolved.len() < step.required_approvals as usize {
            return Err(unresolvable(format!(
                "step requires {} approvals but only {} approvers resolved",
                step.required_approvals,
                resolved.len()
            )));
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::workflow::ThresholdTier;

    fn router(directory: StaticRoleDirectory) -> ApprovalRouter {
        ApprovalRouter::new(Arc::new(directory))
    }

    fn step(rule: ApproverRule) -> StepDefinition {
        StepDefinition::new(1, "review", rule)
    }

    #[tokio::test]
    async fn fixed_users_pass_through_deduplicated() {
        let r = router(StaticRoleDirectory::new());
        let s = step(ApproverRule::FixedUsers {
            users: vec!["alice".into(), "bob".into(), "alice".into()],
        });

        let resolved = r.resolve_approvers(&s, &EntityContext::new()).await.unwrap();
        assert_eq!(resolved, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn role_rule_resolves_via_directory() {
        let r = router(StaticRoleDirectory::new().with_role("finance", ["carol", "dave"]));
        let s = step(ApproverRule::Role {
            role: "finance".into(),
        });

        let resolved = r.resolve_approvers(&s, &EntityContext::new()).await.unwrap();
        assert_eq!(resolved, vec!["carol", "dave"]);
    }

    #[tokio::test]
    async fn empty_role_is_unresolvable() {
        let r = router(StaticRoleDirectory::new());
        let s = step(ApproverRule::Role {
            role: "ghost-team".into(),
        });

        let err = r.resolve_approvers(&s, &EntityContext::new()).await.unwrap_err();
        assert!(matches!(
            err,
            RoutingError::UnresolvableApprovers { step: 1, .. }
        ));
    }

    #[tokio::test]
    async fn threshold_picks_highest_matching_tier() {
        let r = router(
            StaticRoleDirectory::new()
                .with_role("manager", ["mia"])
                .with_role("director", ["dora"]),
        );
        let s = step(ApproverRule::Threshold {
            attribute: "amount".into(),
            tiers: vec![
                ThresholdTier {
                    min_value: 0.0,
                    role: "manager".into(),
                },
                ThresholdTier {
                    min_value: 100_000.0,
                    role: "director".into(),
                },
            ],
        });

        let small = EntityContext::new().with_attribute("amount", 5_000);
        assert_eq!(r.resolve_approvers(&s, &small).await.unwrap(), vec!["mia"]);

        let large = EntityContext::new().with_attribute("amount", 250_000);
        assert_eq!(r.resolve_approvers(&s, &large).await.unwrap(), vec!["dora"]);
    }

    #[tokio::test]
    async fn threshold_missing_attribute_is_unresolvable() {
        let r = router(StaticRoleDirectory::new().with_role("manager", ["mia"]));
        let s = step(ApproverRule::Threshold {
            attribute: "amount".into(),
            tiers: vec![ThresholdTier {
                min_value: 0.0,
                role: "manager".into(),
            }],
        });

        let err = r.resolve_approvers(&s, &EntityContext::new()).await.unwrap_err();
        assert!(matches!(err, RoutingError::UnresolvableApprovers { .. }));
    }

    #[tokio::test]
    async fn insufficient_approvers_for_required_count() {
        let r = router(StaticRoleDirectory::new().with_role("board", ["solo"]));
        let s = step(ApproverRule::Role {
            role: "board".into(),
        })
        .with_required_approvals(2);

        let err = r.resolve_approvers(&s, &EntityContext::new()).await.unwrap_err();
        assert!(matches!(err, RoutingError::UnresolvableApprovers { .. }));
    }
}
