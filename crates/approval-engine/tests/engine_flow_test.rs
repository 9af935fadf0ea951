//! End-to-end engine flows against the in-memory store
//!
//! Covers the full decision lifecycle: multi-step approval with N-of-M
//! counting, rejection, delegation, the single-active-instance rule,
//! stalled approver resolution, concurrent decisions on one step, and
//! cache-on/cache-off equivalence.

use std::sync::Arc;

use uuid::Uuid;

use approval_engine::cache::WorkflowCache;
use approval_engine::engine::{ApprovalEngine, EngineConfig, EngineError, RetryPolicy, Verdict};
use approval_engine::events::{CollectingEventSink, EventType};
use approval_engine::persistence::{InMemoryWorkflowStore, WorkflowStore};
use approval_engine::routing::StaticRoleDirectory;
use approval_engine::workflow::{
    ApproverRule, EntityContext, EntityRef, InstanceStatus, StepDefinition, ThresholdTier,
    WorkflowDefinition,
};

struct Harness {
    engine: Arc<ApprovalEngine>,
    store: Arc<InMemoryWorkflowStore>,
    events: Arc<CollectingEventSink>,
}

fn harness(directory: StaticRoleDirectory) -> Harness {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let events = Arc::new(CollectingEventSink::new());
    let engine = Arc::new(
        ApprovalEngine::new(store.clone(), Arc::new(directory), events.clone()).with_config(
            EngineConfig::default().with_administrators(["root"]),
        ),
    );
    Harness {
        engine,
        store,
        events,
    }
}

fn entity(id: &str) -> EntityRef {
    EntityRef::new("change_request", id)
}

async fn publish(
    engine: &ApprovalEngine,
    version: i32,
    steps: Vec<StepDefinition>,
) -> Uuid {
    let workflow_id = Uuid::now_v7();
    publish_version(engine, workflow_id, version, steps).await;
    workflow_id
}

async fn publish_version(
    engine: &ApprovalEngine,
    workflow_id: Uuid,
    version: i32,
    steps: Vec<StepDefinition>,
) {
    engine
        .publish_definition(WorkflowDefinition::new(
            workflow_id,
            version,
            "change approval",
            steps,
        ))
        .await
        .unwrap();
}

#[test_log::test(tokio::test)]
async fn two_step_flow_with_two_of_three_first_step() {
    let h = harness(
        StaticRoleDirectory::new()
            .with_role("reviewers", ["ana", "ben", "cho"])
            .with_role("directors", ["dara"]),
    );
    let workflow_id = publish(
        &h.engine,
        1,
        vec![
            StepDefinition::new(
                0,
                "peer review",
                ApproverRule::Role {
                    role: "reviewers".into(),
                },
            )
            .with_required_approvals(2),
            StepDefinition::new(
                1,
                "director sign-off",
                ApproverRule::Role {
                    role: "directors".into(),
                },
            ),
        ],
    )
    .await;

    let instance = h
        .engine
        .create_instance(workflow_id, entity("CR-1"), EntityContext::new(), "iris")
        .await
        .unwrap();
    assert_eq!(instance.status, InstanceStatus::UnderReview);
    assert_eq!(instance.current_step, 0);

    // first of two required approvals: step must not advance
    let after_one = h
        .engine
        .submit_decision(instance.id, "ana", Verdict::Approve, None)
        .await
        .unwrap();
    assert_eq!(after_one.current_step, 0);
    assert_eq!(after_one.status, InstanceStatus::UnderReview);

    // second approval satisfies 2-of-3 and advances to the director step
    let after_two = h
        .engine
        .submit_decision(instance.id, "ben", Verdict::Approve, None)
        .await
        .unwrap();
    assert_eq!(after_two.current_step, 1);
    assert_eq!(after_two.status, InstanceStatus::UnderReview);

    // the director list now shows the pending slot, the reviewers' no longer
    let dara_pending = h
        .engine
        .list_pending_approvals_for_user("dara")
        .await
        .unwrap();
    assert_eq!(dara_pending.len(), 1);
    assert!(h
        .engine
        .list_pending_approvals_for_user("cho")
        .await
        .unwrap()
        .is_empty());

    let done = h
        .engine
        .submit_decision(instance.id, "dara", Verdict::Approve, Some("ship it".into()))
        .await
        .unwrap();
    assert_eq!(done.status, InstanceStatus::Approved);

    assert_eq!(
        h.events.event_types(),
        vec![
            EventType::WorkflowCreated,
            EventType::WorkflowStepAdvanced,
            EventType::WorkflowApproved,
        ]
    );

    // history carries one record per committed transition
    let stored = h.store.get_instance(instance.id).await.unwrap();
    assert_eq!(stored.history.len(), 4);
    assert_eq!(stored.row_version, 3);
}

#[test_log::test(tokio::test)]
async fn single_rejection_terminates_the_run() {
    let h = harness(StaticRoleDirectory::new().with_role("reviewers", ["ana", "ben"]));
    let workflow_id = publish(
        &h.engine,
        1,
        vec![StepDefinition::new(
            0,
            "review",
            ApproverRule::Role {
                role: "reviewers".into(),
            },
        )
        .with_required_approvals(2)],
    )
    .await;

    let instance = h
        .engine
        .create_instance(workflow_id, entity("CR-2"), EntityContext::new(), "iris")
        .await
        .unwrap();

    let rejected = h
        .engine
        .submit_decision(instance.id, "ana", Verdict::Reject, Some("budget".into()))
        .await
        .unwrap();
    assert_eq!(rejected.status, InstanceStatus::Rejected);

    // the other reviewer's vote is now invalid, with the state included
    let err = h
        .engine
        .submit_decision(instance.id, "ben", Verdict::Approve, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InstanceTerminal {
            status: InstanceStatus::Rejected,
            ..
        }
    ));

    // delegation and cancellation are rejected the same way once terminal
    let leftover = h
        .store
        .approvals_for_instance(instance.id)
        .await
        .unwrap()
        .into_iter()
        .find(|a| !a.is_decided())
        .unwrap();
    let err = h
        .engine
        .delegate_approval(leftover.id, "ben", "vik")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InstanceTerminal { .. }));
    let err = h.engine.cancel_instance(instance.id, "root").await.unwrap_err();
    assert!(matches!(err, EngineError::InstanceTerminal { .. }));

    assert!(h
        .events
        .event_types()
        .contains(&EventType::WorkflowRejected));
}

#[test_log::test(tokio::test)]
async fn delegation_moves_authority_to_the_delegate() {
    let h = harness(StaticRoleDirectory::new().with_role("reviewers", ["ana"]));
    let workflow_id = publish(
        &h.engine,
        1,
        vec![StepDefinition::new(
            0,
            "review",
            ApproverRule::Role {
                role: "reviewers".into(),
            },
        )],
    )
    .await;

    let instance = h
        .engine
        .create_instance(workflow_id, entity("CR-3"), EntityContext::new(), "iris")
        .await
        .unwrap();

    let slot = h.engine.list_pending_approvals_for_user("ana").await.unwrap()[0].clone();
    let delegated = h
        .engine
        .delegate_approval(slot.id, "ana", "vik")
        .await
        .unwrap();
    assert_eq!(delegated.delegated_to.as_deref(), Some("vik"));

    // the original approver lost standing
    let err = h
        .engine
        .submit_decision(instance.id, "ana", Verdict::Approve, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotAuthorized { .. }));

    // and the delegate gained it
    let done = h
        .engine
        .submit_decision(instance.id, "vik", Verdict::Approve, None)
        .await
        .unwrap();
    assert_eq!(done.status, InstanceStatus::Approved);

    // the row keeps the original approver alongside the delegate's decision
    let row = h.store.get_approval(slot.id).await.unwrap();
    assert_eq!(row.approver_id, "ana");
    assert_eq!(row.delegated_to.as_deref(), Some("vik"));
    assert!(row.decided_at.is_some());

    assert!(h
        .events
        .event_types()
        .contains(&EventType::ApprovalDelegated));
}

#[test_log::test(tokio::test)]
async fn administrator_may_delegate_on_behalf() {
    let h = harness(StaticRoleDirectory::new().with_role("reviewers", ["ana"]));
    let workflow_id = publish(
        &h.engine,
        1,
        vec![StepDefinition::new(
            0,
            "review",
            ApproverRule::Role {
                role: "reviewers".into(),
            },
        )],
    )
    .await;

    h.engine
        .create_instance(workflow_id, entity("CR-4"), EntityContext::new(), "iris")
        .await
        .unwrap();
    let slot = h.engine.list_pending_approvals_for_user("ana").await.unwrap()[0].clone();

    // a bystander cannot delegate someone else's slot
    let err = h
        .engine
        .delegate_approval(slot.id, "mallory", "vik")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotAuthorized { .. }));

    // the configured administrator can
    let delegated = h.engine.delegate_approval(slot.id, "root", "vik").await.unwrap();
    assert_eq!(delegated.delegated_to.as_deref(), Some("vik"));
}

#[test_log::test(tokio::test)]
async fn second_create_for_active_entity_is_rejected() {
    let h = harness(StaticRoleDirectory::new().with_role("reviewers", ["ana"]));
    let workflow_id = publish(
        &h.engine,
        1,
        vec![StepDefinition::new(
            0,
            "review",
            ApproverRule::Role {
                role: "reviewers".into(),
            },
        )],
    )
    .await;

    let first = h
        .engine
        .create_instance(workflow_id, entity("CR-5"), EntityContext::new(), "iris")
        .await
        .unwrap();

    let err = h
        .engine
        .create_instance(workflow_id, entity("CR-5"), EntityContext::new(), "iris")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::DuplicateActiveInstance { existing, .. } if existing == first.id
    ));

    // once the first run is terminal a new one may start
    h.engine
        .submit_decision(first.id, "ana", Verdict::Approve, None)
        .await
        .unwrap();
    h.engine
        .create_instance(workflow_id, entity("CR-5"), EntityContext::new(), "iris")
        .await
        .unwrap();
}

#[test_log::test(tokio::test)]
async fn empty_role_stalls_the_instance_instead_of_failing() {
    let h = harness(StaticRoleDirectory::new());
    let workflow_id = publish(
        &h.engine,
        1,
        vec![StepDefinition::new(
            0,
            "review",
            ApproverRule::Role {
                role: "nobody-here".into(),
            },
        )],
    )
    .await;

    let instance = h
        .engine
        .create_instance(workflow_id, entity("CR-6"), EntityContext::new(), "iris")
        .await
        .unwrap();

    assert_eq!(instance.status, InstanceStatus::Pending);
    assert!(instance.diagnostic.is_some());
    assert!(h
        .store
        .approvals_for_instance(instance.id)
        .await
        .unwrap()
        .is_empty());
}

#[test_log::test(tokio::test)]
async fn empty_role_at_step_advance_stalls_without_new_slots() {
    let h = harness(StaticRoleDirectory::new().with_role("reviewers", ["ana"]));
    let workflow_id = publish(
        &h.engine,
        1,
        vec![
            StepDefinition::new(
                0,
                "review",
                ApproverRule::Role {
                    role: "reviewers".into(),
                },
            ),
            StepDefinition::new(
                1,
                "legal sign-off",
                ApproverRule::Role {
                    role: "legal".into(),
                },
            ),
        ],
    )
    .await;

    let instance = h
        .engine
        .create_instance(workflow_id, entity("CR-14"), EntityContext::new(), "iris")
        .await
        .unwrap();

    // the advance itself commits even though step 1 resolves nobody
    let stalled = h
        .engine
        .submit_decision(instance.id, "ana", Verdict::Approve, None)
        .await
        .unwrap();
    assert_eq!(stalled.current_step, 1);
    assert_eq!(stalled.status, InstanceStatus::UnderReview);
    assert!(stalled.diagnostic.is_some());

    // no slots were created for the stalled step
    let approvals = h.store.approvals_for_instance(instance.id).await.unwrap();
    assert!(approvals.iter().all(|a| a.step_number == 0));

    // the advance event carries the stall reason
    let advanced = h
        .events
        .events()
        .into_iter()
        .find(|e| e.event_type == EventType::WorkflowStepAdvanced)
        .unwrap();
    assert!(advanced.payload["diagnostic"].is_string());
}

#[test_log::test(tokio::test)]
async fn threshold_routing_follows_the_entity_amount() {
    let h = harness(
        StaticRoleDirectory::new()
            .with_role("managers", ["mia"])
            .with_role("executives", ["eva"]),
    );
    let rule = ApproverRule::Threshold {
        attribute: "amount".into(),
        tiers: vec![
            ThresholdTier {
                min_value: 0.0,
                role: "managers".into(),
            },
            ThresholdTier {
                min_value: 50_000.0,
                role: "executives".into(),
            },
        ],
    };
    let workflow_id = publish(
        &h.engine,
        1,
        vec![StepDefinition::new(0, "spend approval", rule)],
    )
    .await;

    let small = h
        .engine
        .create_instance(
            workflow_id,
            entity("PO-1"),
            EntityContext::new().with_attribute("amount", 900),
            "iris",
        )
        .await
        .unwrap();
    assert_eq!(
        h.engine.list_pending_approvals_for_user("mia").await.unwrap().len(),
        1
    );

    let large = h
        .engine
        .create_instance(
            workflow_id,
            entity("PO-2"),
            EntityContext::new().with_attribute("amount", 75_000),
            "iris",
        )
        .await
        .unwrap();
    let eva_pending = h.engine.list_pending_approvals_for_user("eva").await.unwrap();
    assert_eq!(eva_pending.len(), 1);
    assert_eq!(eva_pending[0].instance_id, large.id);
    assert_ne!(small.id, large.id);
}

#[test_log::test(tokio::test)]
async fn double_vote_is_reported_as_already_decided() {
    let h = harness(StaticRoleDirectory::new().with_role("reviewers", ["ana", "ben"]));
    let workflow_id = publish(
        &h.engine,
        1,
        vec![StepDefinition::new(
            0,
            "review",
            ApproverRule::Role {
                role: "reviewers".into(),
            },
        )
        .with_required_approvals(2)],
    )
    .await;

    let instance = h
        .engine
        .create_instance(workflow_id, entity("CR-7"), EntityContext::new(), "iris")
        .await
        .unwrap();

    h.engine
        .submit_decision(instance.id, "ana", Verdict::Approve, None)
        .await
        .unwrap();
    let err = h
        .engine
        .submit_decision(instance.id, "ana", Verdict::Approve, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ApprovalAlreadyDecided { .. }));

    // a stranger to the step gets an authorization error instead
    let err = h
        .engine
        .submit_decision(instance.id, "zed", Verdict::Approve, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotAuthorized { .. }));
}

#[test_log::test(tokio::test)]
async fn running_instances_stay_pinned_to_their_version() {
    let h = harness(
        StaticRoleDirectory::new()
            .with_role("reviewers", ["ana"])
            .with_role("auditors", ["amal"]),
    );
    let workflow_id = publish(
        &h.engine,
        1,
        vec![StepDefinition::new(
            0,
            "review",
            ApproverRule::Role {
                role: "reviewers".into(),
            },
        )],
    )
    .await;

    let pinned = h
        .engine
        .create_instance(workflow_id, entity("CR-8"), EntityContext::new(), "iris")
        .await
        .unwrap();
    assert_eq!(pinned.version, 1);

    // v2 adds an audit step; the running instance must not pick it up
    publish_version(
        &h.engine,
        workflow_id,
        2,
        vec![
            StepDefinition::new(
                0,
                "review",
                ApproverRule::Role {
                    role: "reviewers".into(),
                },
            ),
            StepDefinition::new(
                1,
                "audit",
                ApproverRule::Role {
                    role: "auditors".into(),
                },
            ),
        ],
    )
    .await;

    let done = h
        .engine
        .submit_decision(pinned.id, "ana", Verdict::Approve, None)
        .await
        .unwrap();
    assert_eq!(done.status, InstanceStatus::Approved);

    // a fresh instance runs the new version
    let fresh = h
        .engine
        .create_instance(workflow_id, entity("CR-9"), EntityContext::new(), "iris")
        .await
        .unwrap();
    assert_eq!(fresh.version, 2);
}

#[test_log::test(tokio::test)]
async fn cancel_is_terminal_and_idempotence_is_reported() {
    let h = harness(StaticRoleDirectory::new().with_role("reviewers", ["ana"]));
    let workflow_id = publish(
        &h.engine,
        1,
        vec![StepDefinition::new(
            0,
            "review",
            ApproverRule::Role {
                role: "reviewers".into(),
            },
        )],
    )
    .await;

    let instance = h
        .engine
        .create_instance(workflow_id, entity("CR-10"), EntityContext::new(), "iris")
        .await
        .unwrap();

    let cancelled = h.engine.cancel_instance(instance.id, "root").await.unwrap();
    assert_eq!(cancelled.status, InstanceStatus::Cancelled);

    let err = h.engine.cancel_instance(instance.id, "root").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InstanceTerminal {
            status: InstanceStatus::Cancelled,
            ..
        }
    ));
    assert!(h
        .events
        .event_types()
        .contains(&EventType::WorkflowCancelled));
}

#[test_log::test(tokio::test)]
async fn concurrent_approvals_serialize_through_the_version_check() {
    let approvers: Vec<String> = (0..5).map(|n| format!("user-{n}")).collect();

    let h = harness(StaticRoleDirectory::new().with_role("committee", approvers.clone()));
    let engine = Arc::new(
        ApprovalEngine::new(
            h.store.clone(),
            Arc::new(StaticRoleDirectory::new().with_role("committee", approvers.clone())),
            h.events.clone(),
        )
        .with_config(EngineConfig::default().with_retry(
            RetryPolicy::fixed(std::time::Duration::from_millis(1), 20),
        )),
    );

    let workflow_id = publish(
        &engine,
        1,
        vec![StepDefinition::new(
            0,
            "committee vote",
            ApproverRule::Role {
                role: "committee".into(),
            },
        )
        .with_required_approvals(5)],
    )
    .await;

    let instance = engine
        .create_instance(workflow_id, entity("CR-11"), EntityContext::new(), "iris")
        .await
        .unwrap();

    let mut tasks = tokio::task::JoinSet::new();
    for approver in approvers {
        let engine = engine.clone();
        let instance_id = instance.id;
        tasks.spawn(async move {
            engine
                .submit_decision(instance_id, &approver, Verdict::Approve, None)
                .await
        });
    }

    let mut ok = 0;
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap().unwrap();
        ok += 1;
    }
    assert_eq!(ok, 5);

    // all five votes landed and exactly one transition completed the run
    let stored = h.store.get_instance(instance.id).await.unwrap();
    assert_eq!(stored.status, InstanceStatus::Approved);
    assert_eq!(stored.row_version, 5);

    let approved_events = h
        .events
        .event_types()
        .into_iter()
        .filter(|t| *t == EventType::WorkflowApproved)
        .count();
    assert_eq!(approved_events, 1);
}

#[test_log::test(tokio::test)]
async fn failed_event_emission_does_not_roll_back_the_transition() {
    struct BrokenSink;

    #[async_trait::async_trait]
    impl approval_engine::events::EventSink for BrokenSink {
        async fn publish(
            &self,
            _event: approval_engine::events::ApprovalEvent,
        ) -> Result<(), approval_engine::events::SinkError> {
            Err(approval_engine::events::SinkError("bus down".into()))
        }
    }

    let store = Arc::new(InMemoryWorkflowStore::new());
    let engine = ApprovalEngine::new(
        store.clone(),
        Arc::new(StaticRoleDirectory::new().with_role("reviewers", ["ana"])),
        Arc::new(BrokenSink),
    );

    let workflow_id = publish(
        &engine,
        1,
        vec![StepDefinition::new(
            0,
            "review",
            ApproverRule::Role {
                role: "reviewers".into(),
            },
        )],
    )
    .await;

    let instance = engine
        .create_instance(workflow_id, entity("CR-13"), EntityContext::new(), "iris")
        .await
        .unwrap();
    let done = engine
        .submit_decision(instance.id, "ana", Verdict::Approve, None)
        .await
        .unwrap();
    assert_eq!(done.status, InstanceStatus::Approved);

    // the committed state survives even though every publish failed
    let stored = store.get_instance(instance.id).await.unwrap();
    assert_eq!(stored.status, InstanceStatus::Approved);
}

#[test_log::test(tokio::test)]
async fn disabled_cache_yields_identical_outcomes() {
    for cache in [
        Arc::new(WorkflowCache::new(Default::default())),
        Arc::new(WorkflowCache::disabled()),
    ] {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let events = Arc::new(CollectingEventSink::new());
        let engine = ApprovalEngine::new(
            store,
            Arc::new(StaticRoleDirectory::new().with_role("reviewers", ["ana"])),
            events.clone(),
        )
        .with_cache(cache);

        let workflow_id = publish(
            &engine,
            1,
            vec![StepDefinition::new(
                0,
                "review",
                ApproverRule::Role {
                    role: "reviewers".into(),
                },
            )],
        )
        .await;

        let instance = engine
            .create_instance(workflow_id, entity("CR-12"), EntityContext::new(), "iris")
            .await
            .unwrap();

        // repeated reads, then a decision, then a read of the new state
        for _ in 0..3 {
            assert_eq!(
                engine.get_instance_status(instance.id).await.unwrap(),
                InstanceStatus::UnderReview
            );
        }
        engine
            .submit_decision(instance.id, "ana", Verdict::Approve, None)
            .await
            .unwrap();
        assert_eq!(
            engine.get_instance_status(instance.id).await.unwrap(),
            InstanceStatus::Approved
        );
        assert_eq!(
            events.event_types(),
            vec![EventType::WorkflowCreated, EventType::WorkflowApproved]
        );
    }
}
