//! # signoff-flow
//!
//! Orchestration kernel for long-running workflows that interleave
//! machine-executed steps with human approvals.
//!
//! This crate implements the orchestration domain, providing:
//!
//! - **Workflow State Machine**: Validated transitions with optimistic
//!   version guards and an append-only audit log
//! - **Step Executor**: Drives sequential task/approval pipelines to
//!   completion, with compensation on rejection
//! - **Approval Service**: Token-signed callbacks, expiry-before-status
//!   decision intake under a pessimistic row lock
//! - **Event Bus**: In-process pub/sub with per-subscriber retry and a
//!   dead-letter queue
//! - **Timeout Manager**: Background scanner that expires stalled
//!   approvals and retries or abandons stalled workflows
//!
//! ## Core Concepts
//!
//! - **Workflow**: A durable unit of orchestration progressing through a
//!   defined state machine
//! - **Step**: One ordered unit within a workflow, either a task or an
//!   approval
//! - **Approval**: A human-decision record with a callback token, UI
//!   schema, expiry, and terminal status
//!
//! ## Guarantees
//!
//! - **Crash-safe**: The database is the continuation. A paused workflow
//!   is `WAITING_APPROVAL` plus its running approval step; resumption
//!   re-reads storage and advances
//! - **Lost-update safe**: Every persisted workflow mutation bumps a
//!   version under a conditional update; concurrent writers observe
//!   `ConcurrentModification` instead of interleaving
//! - **Replay-resistant**: Callback tokens are MAC-bound to one approval
//!   and expiry; decision intake is idempotent after the first success
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use signoff_flow::config::FlowConfig;
//! use signoff_flow::error::Result;
//! use signoff_flow::registry::TaskRegistry;
//! use signoff_flow::runtime::{CreateWorkflowRequest, Orchestrator};
//! use signoff_flow::store::memory::MemoryStore;
//!
//! # async fn demo() -> Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let orchestrator = Orchestrator::new(FlowConfig::default(), store, TaskRegistry::new());
//! orchestrator.start();
//!
//! let request = CreateWorkflowRequest::new("deployment")
//!     .with_context(serde_json::json!({"env": "prod"}));
//! let workflow = orchestrator.create_workflow(request).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod adapters;
pub mod approval;
pub mod approvals;
pub mod bus;
pub mod callbacks;
pub mod config;
pub mod dlq;
pub mod error;
pub mod events;
pub mod executor;
pub mod machine;
pub mod metrics;
pub mod outbox;
pub mod registry;
pub mod runtime;
pub mod step;
pub mod store;
pub mod timeout;
pub mod workflow;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::approval::{Approval, ApprovalStatus, Decision, UiButton, UiField, UiSchema};
    pub use crate::approvals::ApprovalService;
    pub use crate::bus::{EventBus, EventHandler};
    pub use crate::callbacks::{CallbackRejection, CallbackResult, DecisionIntake, DecisionRequest};
    pub use crate::config::FlowConfig;
    pub use crate::dlq::DeadLetter;
    pub use crate::error::{Error, Result};
    pub use crate::events::{EventKind, FlowEvent, FlowEventData};
    pub use crate::executor::StepExecutor;
    pub use crate::machine::StateMachine;
    pub use crate::registry::{TaskHandler, TaskRegistry};
    pub use crate::runtime::{CreateWorkflowRequest, Orchestrator};
    pub use crate::step::{Step, StepKind, StepSpec, StepStatus};
    pub use crate::store::{CasResult, Store, UnitOfWork};
    pub use crate::timeout::TimeoutManager;
    pub use crate::workflow::{Workflow, WorkflowState};
}
