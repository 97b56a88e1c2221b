//! Persistence gateway for the orchestration kernel.
//!
//! The gateway exclusively owns row writes; every other component goes
//! through it. Two access families exist:
//!
//! - **Snapshot reads** on [`Store`]: consistent point-in-time reads that
//!   must not block writers (MVCC in Postgres).
//! - **[`UnitOfWork`]**: a scoped transaction obtained from
//!   [`Store::begin`]. Mutations inside it are atomic; dropping an
//!   uncommitted unit of work rolls everything back, guaranteeing release
//!   on all exit paths.
//!
//! Two locking primitives are exposed for the rest of the kernel:
//!
//! - **Optimistic conditional update** ([`UnitOfWork::update_workflow`]):
//!   write the workflow row only if its version matches; a mismatch
//!   surfaces as [`CasResult::Conflict`], which callers map to
//!   `ConcurrentModification`.
//! - **Pessimistic row lock** ([`UnitOfWork::lock_approval`] /
//!   [`UnitOfWork::lock_approval_by_token`]): exclusive lock on one
//!   approval row for the duration of the transaction, serializing
//!   decision writes against the timeout scanner.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use signoff_core::{ApprovalId, DeadLetterId, StepId, WorkflowId};

use crate::approval::Approval;
use crate::dlq::DeadLetter;
use crate::error::Result;
use crate::events::{EventKind, WorkflowEventRecord};
use crate::step::Step;
use crate::workflow::{Workflow, WorkflowState};

/// Outcome of an optimistic conditional update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasResult {
    /// The row matched the expected version and was written.
    Committed,
    /// The row's version did not match; nothing was written.
    Conflict,
}

impl CasResult {
    /// Returns true when the write landed.
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }
}

/// Transactional access to the relational store.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Opens a unit of work.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>>;

    /// Reads a workflow by ID.
    async fn workflow(&self, id: WorkflowId) -> Result<Option<Workflow>>;

    /// Reads a workflow by its idempotency key within a workflow type.
    async fn workflow_by_idempotency_key(
        &self,
        workflow_type: &str,
        key: &str,
    ) -> Result<Option<Workflow>>;

    /// Lists workflows, optionally filtered by state, newest first.
    async fn list_workflows(
        &self,
        state: Option<WorkflowState>,
        limit: usize,
    ) -> Result<Vec<Workflow>>;

    /// Reads a workflow's event history ordered by sequence.
    async fn events(&self, workflow_id: WorkflowId) -> Result<Vec<WorkflowEventRecord>>;

    /// Reads a workflow's steps ordered by `step_index`.
    async fn steps(&self, workflow_id: WorkflowId) -> Result<Vec<Step>>;

    /// Reads the step owning the given approval, if any.
    async fn step_by_approval(&self, approval_id: ApprovalId) -> Result<Option<Step>>;

    /// Reads an approval by ID.
    async fn approval(&self, id: ApprovalId) -> Result<Option<Approval>>;

    /// Reads an approval by its callback token.
    async fn approval_by_token(&self, token: &str) -> Result<Option<Approval>>;

    /// Reads PENDING approvals whose expiry has passed, oldest first,
    /// bounded by `limit`.
    async fn expired_approvals(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Approval>>;

    /// Reads workflows sitting in `TIMEOUT` or `FAILED`, oldest first,
    /// bounded by `limit`. Includes workflows out of retry budget so the
    /// caller can abandon them.
    async fn stalled_workflows(&self, limit: usize) -> Result<Vec<Workflow>>;

    /// Inserts a dead-letter entry outside any transaction. Used by the
    /// event bus after delivery retries are exhausted.
    async fn insert_dead_letter(&self, entry: &DeadLetter) -> Result<()>;

    /// Returns true when a dead-letter entry of the given type already
    /// references the workflow.
    async fn dead_letter_exists(&self, workflow_id: WorkflowId, event_type: &str) -> Result<bool>;

    /// Lists dead letters, newest first, bounded by `limit`.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>>;

    /// Deletes a dead-letter entry, returning whether it existed.
    async fn delete_dead_letter(&self, id: DeadLetterId) -> Result<bool>;
}

/// A scoped transaction. Dropping without [`UnitOfWork::commit`] rolls
/// back.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Inserts a new workflow row.
    async fn insert_workflow(&mut self, workflow: &Workflow) -> Result<()>;

    /// Reads a workflow inside the transaction.
    async fn workflow(&mut self, id: WorkflowId) -> Result<Option<Workflow>>;

    /// Reads a workflow by idempotency key inside the transaction.
    async fn workflow_by_idempotency_key(
        &mut self,
        workflow_type: &str,
        key: &str,
    ) -> Result<Option<Workflow>>;

    /// Conditionally writes a workflow row.
    ///
    /// `workflow.version` must already hold the NEW version
    /// (`expected_version + 1`); the write lands only if the stored row
    /// still carries `expected_version`.
    async fn update_workflow(
        &mut self,
        workflow: &Workflow,
        expected_version: u64,
    ) -> Result<CasResult>;

    /// Inserts a step row.
    async fn insert_step(&mut self, step: &Step) -> Result<()>;

    /// Reads a workflow's steps ordered by `step_index`.
    async fn steps(&mut self, workflow_id: WorkflowId) -> Result<Vec<Step>>;

    /// Reads one step by ID.
    async fn step(&mut self, id: StepId) -> Result<Option<Step>>;

    /// Reads the step owning the given approval, if any.
    async fn step_by_approval(&mut self, approval_id: ApprovalId) -> Result<Option<Step>>;

    /// Writes a step row.
    async fn update_step(&mut self, step: &Step) -> Result<()>;

    /// Inserts an approval row.
    async fn insert_approval(&mut self, approval: &Approval) -> Result<()>;

    /// Acquires the exclusive row lock on an approval and returns it.
    async fn lock_approval(&mut self, id: ApprovalId) -> Result<Option<Approval>>;

    /// Acquires the exclusive row lock on the approval holding the given
    /// callback token and returns it.
    async fn lock_approval_by_token(&mut self, token: &str) -> Result<Option<Approval>>;

    /// Reads the PENDING approvals of a workflow.
    async fn pending_approvals(&mut self, workflow_id: WorkflowId) -> Result<Vec<Approval>>;

    /// Writes an approval row.
    async fn update_approval(&mut self, approval: &Approval) -> Result<()>;

    /// Appends an audit event, allocating the next per-workflow sequence.
    async fn append_event(
        &mut self,
        workflow_id: WorkflowId,
        event_type: EventKind,
        payload: JsonValue,
        occurred_at: DateTime<Utc>,
    ) -> Result<WorkflowEventRecord>;

    /// Inserts a dead-letter entry inside the transaction.
    async fn insert_dead_letter(&mut self, entry: &DeadLetter) -> Result<()>;

    /// Commits the transaction.
    async fn commit(self: Box<Self>) -> Result<()>;
}
