//! # Approval Workflow Engine
//!
//! A multi-step, multi-approver workflow engine for business entities that
//! need sign-off: versioned definitions, N-of-M approval steps, role and
//! threshold routing, delegation, and an auditable transition history.
//!
//! ## Features
//!
//! - **Versioned definitions**: templates are immutable once published; running instances stay pinned to their version
//! - **N-of-M steps**: each step names its approvers (fixed list, role, or value threshold) and how many must approve
//! - **Optimistic concurrency**: all mutation flows through a single compare-and-swap write, retried with backoff
//! - **Read-side cache**: TTL-bounded, LRU-evicted cache for definitions, instances and pending-approval lists
//! - **Batch operations**: bulk create/update/status-query with bounded concurrency and per-item failure reporting
//! - **Observability**: per-operation latency histograms, lifecycle counters and alert thresholds
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ApprovalEngine                         │
//! │  (state machine: create, decide, advance, delegate, cancel) │
//! └─────────────────────────────────────────────────────────────┘
//!        │                  │                       │
//!        ▼                  ▼                       ▼
//! ┌──────────────┐  ┌────────────────┐  ┌─────────────────────┐
//! │ ApprovalRouter│  │ WorkflowCache  │  │     EventSink       │
//! │ (rule → users)│  │ (TTL + LRU)    │  │ (audit/notification)│
//! └──────────────┘  └────────────────┘  └─────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkflowStore                          │
//! │  (PostgreSQL or in-memory: definitions, instances,          │
//! │   approvals; atomic compare-and-swap transitions)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use approval_engine::prelude::*;
//!
//! let store = Arc::new(InMemoryWorkflowStore::new());
//! let directory = Arc::new(StaticRoleDirectory::new().with_role("finance", ["fiona"]));
//! let engine = ApprovalEngine::new(store, directory, Arc::new(TracingEventSink));
//!
//! let definition = WorkflowDefinition::new(
//!     Uuid::now_v7(),
//!     1,
//!     "purchase approval",
//!     vec![StepDefinition::new(
//!         0,
//!         "finance review",
//!         ApproverRule::Role { role: "finance".into() },
//!     )],
//! );
//! engine.publish_definition(definition).await?;
//!
//! let instance = engine
//!     .create_instance(
//!         workflow_id,
//!         EntityRef::new("purchase_order", "PO-1042"),
//!         EntityContext::new().with_attribute("amount", 18_500),
//!         "requester",
//!     )
//!     .await?;
//!
//! engine
//!     .submit_decision(instance.id, "fiona", Verdict::Approve, None)
//!     .await?;
//! ```

pub mod batch;
pub mod cache;
pub mod engine;
pub mod events;
pub mod metrics;
pub mod persistence;
pub mod routing;
pub mod workflow;

pub use engine::{ApprovalEngine, EngineConfig, EngineError, RetryPolicy, Verdict};
pub use persistence::{InMemoryWorkflowStore, PostgresWorkflowStore, StoreError, WorkflowStore};

/// Prelude for common imports
pub mod prelude {
    pub use crate::batch::{
        BatchConfig, BatchProcessor, BatchReport, CreateInstanceRequest, InstanceUpdate,
        UpdateAction,
    };
    pub use crate::cache::{CacheConfig, WorkflowCache};
    pub use crate::engine::{ApprovalEngine, EngineConfig, EngineError, RetryPolicy, Verdict};
    pub use crate::events::{
        ApprovalEvent, CollectingEventSink, EventSink, EventType, TracingEventSink,
    };
    pub use crate::metrics::{Alert, AlertKind, AlertThresholds, PerformanceMonitor};
    pub use crate::persistence::{
        InMemoryWorkflowStore, PostgresWorkflowStore, StoreError, WorkflowStore,
    };
    pub use crate::routing::{ApprovalRouter, RoleDirectory, RoutingError, StaticRoleDirectory};
    pub use crate::workflow::{
        Approval, ApproverRule, Decision, EntityContext, EntityRef, InstanceStatus,
        StepDefinition, ThresholdTier, WorkflowDefinition, WorkflowInstance,
    };
    pub use uuid::Uuid;
}
