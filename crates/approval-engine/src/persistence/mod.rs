//! Persistence layer: the `WorkflowStore` trait and its implementations
//!
//! The store owns the persisted rows and exposes atomic read/write and
//! compare-and-swap operations; it holds no business logic. The in-memory
//! implementation mirrors the PostgreSQL implementation's semantics so the
//! engine can be tested without a database.

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryWorkflowStore;
pub use postgres::PostgresWorkflowStore;
pub use store::{
    ApprovalDecision, ApprovalDelegation, InstanceTransition, StoreError, WorkflowStore,
};
pub(crate) use store::record;
