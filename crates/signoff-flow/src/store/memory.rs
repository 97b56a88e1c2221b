//! In-memory store implementation for testing.
//!
//! This module provides [`MemoryStore`], a simple in-memory implementation
//! of the [`Store`] trait suitable for testing and development.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process
//!   coordination
//! - **Coarse serialization**: A unit of work holds one store-wide lock,
//!   so snapshot reads wait for open transactions instead of reading MVCC
//!   snapshots the way the Postgres store does
//! - **No persistence**: All state is lost when the process exits

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, OwnedMutexGuard};
use ulid::Ulid;

use signoff_core::{ApprovalId, DeadLetterId, StepId, WorkflowId};

use super::{CasResult, Store, UnitOfWork};
use crate::approval::{Approval, ApprovalStatus};
use crate::dlq::DeadLetter;
use crate::error::{Error, Result};
use crate::events::{EventKind, WorkflowEventRecord};
use crate::step::Step;
use crate::workflow::{Workflow, WorkflowState};

#[derive(Debug, Default, Clone)]
struct MemoryInner {
    workflows: HashMap<WorkflowId, Workflow>,
    steps: HashMap<StepId, Step>,
    approvals: HashMap<ApprovalId, Approval>,
    events: Vec<WorkflowEventRecord>,
    dead_letters: Vec<DeadLetter>,
}

/// In-memory store for testing.
///
/// ## Example
///
/// ```rust
/// use signoff_flow::store::memory::MemoryStore;
///
/// let store = MemoryStore::new();
/// // Use store in tests...
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of workflows currently stored.
    pub async fn workflow_count(&self) -> usize {
        self.inner.lock().await.workflows.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let guard = Arc::clone(&self.inner).lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(MemoryUnitOfWork {
            guard,
            snapshot: Some(snapshot),
            committed: false,
        }))
    }

    async fn workflow(&self, id: WorkflowId) -> Result<Option<Workflow>> {
        Ok(self.inner.lock().await.workflows.get(&id).cloned())
    }

    async fn workflow_by_idempotency_key(
        &self,
        workflow_type: &str,
        key: &str,
    ) -> Result<Option<Workflow>> {
        let inner = self.inner.lock().await;
        Ok(find_by_idempotency_key(&inner, workflow_type, key))
    }

    async fn list_workflows(
        &self,
        state: Option<WorkflowState>,
        limit: usize,
    ) -> Result<Vec<Workflow>> {
        let inner = self.inner.lock().await;
        let mut workflows: Vec<Workflow> = inner
            .workflows
            .values()
            .filter(|wf| state.is_none_or(|s| wf.state == s))
            .cloned()
            .collect();
        workflows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        workflows.truncate(limit);
        Ok(workflows)
    }

    async fn events(&self, workflow_id: WorkflowId) -> Result<Vec<WorkflowEventRecord>> {
        let inner = self.inner.lock().await;
        let mut events: Vec<WorkflowEventRecord> = inner
            .events
            .iter()
            .filter(|ev| ev.workflow_id == workflow_id)
            .cloned()
            .collect();
        events.sort_by_key(|ev| ev.sequence);
        Ok(events)
    }

    async fn steps(&self, workflow_id: WorkflowId) -> Result<Vec<Step>> {
        let inner = self.inner.lock().await;
        Ok(steps_of(&inner, workflow_id))
    }

    async fn step_by_approval(&self, approval_id: ApprovalId) -> Result<Option<Step>> {
        let inner = self.inner.lock().await;
        Ok(find_step_by_approval(&inner, approval_id))
    }

    async fn approval(&self, id: ApprovalId) -> Result<Option<Approval>> {
        Ok(self.inner.lock().await.approvals.get(&id).cloned())
    }

    async fn approval_by_token(&self, token: &str) -> Result<Option<Approval>> {
        let inner = self.inner.lock().await;
        Ok(find_approval_by_token(&inner, token))
    }

    async fn expired_approvals(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Approval>> {
        let inner = self.inner.lock().await;
        let mut expired: Vec<Approval> = inner
            .approvals
            .values()
            .filter(|ap| ap.status == ApprovalStatus::Pending && ap.expires_at <= now)
            .cloned()
            .collect();
        expired.sort_by_key(|ap| ap.expires_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn stalled_workflows(&self, limit: usize) -> Result<Vec<Workflow>> {
        let inner = self.inner.lock().await;
        let mut stalled: Vec<Workflow> = inner
            .workflows
            .values()
            .filter(|wf| {
                matches!(wf.state, WorkflowState::Timeout | WorkflowState::Failed)
            })
            .cloned()
            .collect();
        stalled.sort_by_key(|wf| wf.updated_at);
        stalled.truncate(limit);
        Ok(stalled)
    }

    async fn insert_dead_letter(&self, entry: &DeadLetter) -> Result<()> {
        self.inner.lock().await.dead_letters.push(entry.clone());
        Ok(())
    }

    async fn dead_letter_exists(
        &self,
        workflow_id: WorkflowId,
        event_type: &str,
    ) -> Result<bool> {
        let inner = self.inner.lock().await;
        Ok(inner
            .dead_letters
            .iter()
            .any(|dl| dl.workflow_id == Some(workflow_id) && dl.event_type == event_type))
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let inner = self.inner.lock().await;
        let mut entries = inner.dead_letters.clone();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn delete_dead_letter(&self, id: DeadLetterId) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.dead_letters.len();
        inner.dead_letters.retain(|dl| dl.id != id);
        Ok(inner.dead_letters.len() < before)
    }
}

fn find_by_idempotency_key(
    inner: &MemoryInner,
    workflow_type: &str,
    key: &str,
) -> Option<Workflow> {
    inner
        .workflows
        .values()
        .find(|wf| {
            wf.workflow_type == workflow_type && wf.idempotency_key.as_deref() == Some(key)
        })
        .cloned()
}

fn steps_of(inner: &MemoryInner, workflow_id: WorkflowId) -> Vec<Step> {
    let mut steps: Vec<Step> = inner
        .steps
        .values()
        .filter(|step| step.workflow_id == workflow_id)
        .cloned()
        .collect();
    steps.sort_by_key(|step| step.step_index);
    steps
}

fn find_step_by_approval(inner: &MemoryInner, approval_id: ApprovalId) -> Option<Step> {
    inner
        .steps
        .values()
        .find(|step| step.approval_id == Some(approval_id))
        .cloned()
}

fn find_approval_by_token(inner: &MemoryInner, token: &str) -> Option<Approval> {
    inner
        .approvals
        .values()
        .find(|ap| ap.callback_token == token)
        .cloned()
}

/// Unit of work over the in-memory store.
///
/// Holds the store-wide lock for its lifetime; mutations apply directly
/// to live state and the pre-transaction snapshot is restored on drop
/// unless `commit` ran.
struct MemoryUnitOfWork {
    guard: OwnedMutexGuard<MemoryInner>,
    snapshot: Option<MemoryInner>,
    committed: bool,
}

impl Drop for MemoryUnitOfWork {
    fn drop(&mut self) {
        if !self.committed {
            if let Some(snapshot) = self.snapshot.take() {
                *self.guard = snapshot;
            }
        }
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn insert_workflow(&mut self, workflow: &Workflow) -> Result<()> {
        if let Some(key) = workflow.idempotency_key.as_deref() {
            if find_by_idempotency_key(&self.guard, &workflow.workflow_type, key).is_some() {
                return Err(Error::storage(format!(
                    "duplicate idempotency key '{key}' for workflow type '{}'",
                    workflow.workflow_type
                )));
            }
        }
        self.guard.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn workflow(&mut self, id: WorkflowId) -> Result<Option<Workflow>> {
        Ok(self.guard.workflows.get(&id).cloned())
    }

    async fn workflow_by_idempotency_key(
        &mut self,
        workflow_type: &str,
        key: &str,
    ) -> Result<Option<Workflow>> {
        Ok(find_by_idempotency_key(&self.guard, workflow_type, key))
    }

    async fn update_workflow(
        &mut self,
        workflow: &Workflow,
        expected_version: u64,
    ) -> Result<CasResult> {
        match self.guard.workflows.get_mut(&workflow.id) {
            Some(stored) if stored.version == expected_version => {
                *stored = workflow.clone();
                Ok(CasResult::Committed)
            }
            Some(_) => Ok(CasResult::Conflict),
            None => Err(Error::WorkflowNotFound {
                workflow_id: workflow.id,
            }),
        }
    }

    async fn insert_step(&mut self, step: &Step) -> Result<()> {
        self.guard.steps.insert(step.id, step.clone());
        Ok(())
    }

    async fn steps(&mut self, workflow_id: WorkflowId) -> Result<Vec<Step>> {
        Ok(steps_of(&self.guard, workflow_id))
    }

    async fn step(&mut self, id: StepId) -> Result<Option<Step>> {
        Ok(self.guard.steps.get(&id).cloned())
    }

    async fn step_by_approval(&mut self, approval_id: ApprovalId) -> Result<Option<Step>> {
        Ok(find_step_by_approval(&self.guard, approval_id))
    }

    async fn update_step(&mut self, step: &Step) -> Result<()> {
        if !self.guard.steps.contains_key(&step.id) {
            return Err(Error::StepNotFound { step_id: step.id });
        }
        self.guard.steps.insert(step.id, step.clone());
        Ok(())
    }

    async fn insert_approval(&mut self, approval: &Approval) -> Result<()> {
        if find_approval_by_token(&self.guard, &approval.callback_token).is_some() {
            return Err(Error::storage("duplicate callback token"));
        }
        self.guard.approvals.insert(approval.id, approval.clone());
        Ok(())
    }

    async fn lock_approval(&mut self, id: ApprovalId) -> Result<Option<Approval>> {
        // The store-wide lock already serializes; returning the row is the
        // lock acquisition.
        Ok(self.guard.approvals.get(&id).cloned())
    }

    async fn lock_approval_by_token(&mut self, token: &str) -> Result<Option<Approval>> {
        Ok(find_approval_by_token(&self.guard, token))
    }

    async fn pending_approvals(&mut self, workflow_id: WorkflowId) -> Result<Vec<Approval>> {
        let mut pending: Vec<Approval> = self
            .guard
            .approvals
            .values()
            .filter(|ap| ap.workflow_id == workflow_id && ap.status == ApprovalStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|ap| ap.requested_at);
        Ok(pending)
    }

    async fn update_approval(&mut self, approval: &Approval) -> Result<()> {
        if !self.guard.approvals.contains_key(&approval.id) {
            return Err(Error::ApprovalNotFound {
                approval_id: approval.id,
            });
        }
        self.guard.approvals.insert(approval.id, approval.clone());
        Ok(())
    }

    async fn append_event(
        &mut self,
        workflow_id: WorkflowId,
        event_type: EventKind,
        payload: JsonValue,
        occurred_at: DateTime<Utc>,
    ) -> Result<WorkflowEventRecord> {
        let sequence = self
            .guard
            .events
            .iter()
            .filter(|ev| ev.workflow_id == workflow_id)
            .map(|ev| ev.sequence)
            .max()
            .unwrap_or(0)
            + 1;

        let record = WorkflowEventRecord {
            id: Ulid::new().to_string(),
            workflow_id,
            event_type,
            payload,
            sequence,
            occurred_at,
        };
        self.guard.events.push(record.clone());
        Ok(record)
    }

    async fn insert_dead_letter(&mut self, entry: &DeadLetter) -> Result<()> {
        self.guard.dead_letters.push(entry.clone());
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.committed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow() -> Workflow {
        Workflow::new("deployment", serde_json::json!({"env": "prod"}))
    }

    #[tokio::test]
    async fn uncommitted_unit_of_work_rolls_back() -> Result<()> {
        let store = MemoryStore::new();
        let wf = workflow();

        {
            let mut uow = store.begin().await?;
            uow.insert_workflow(&wf).await?;
            // Dropped without commit.
        }

        assert!(store.workflow(wf.id).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn committed_unit_of_work_persists() -> Result<()> {
        let store = MemoryStore::new();
        let wf = workflow();

        let mut uow = store.begin().await?;
        uow.insert_workflow(&wf).await?;
        uow.commit().await?;

        assert!(store.workflow(wf.id).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn conditional_update_rejects_version_mismatch() -> Result<()> {
        let store = MemoryStore::new();
        let mut wf = workflow();

        let mut uow = store.begin().await?;
        uow.insert_workflow(&wf).await?;
        uow.commit().await?;

        // Winner bumps 1 -> 2.
        wf.state = WorkflowState::Running;
        wf.version = 2;
        let mut uow = store.begin().await?;
        assert_eq!(uow.update_workflow(&wf, 1).await?, CasResult::Committed);
        uow.commit().await?;

        // Loser still expects version 1.
        let mut stale = wf.clone();
        stale.version = 2;
        let mut uow = store.begin().await?;
        assert_eq!(uow.update_workflow(&stale, 1).await?, CasResult::Conflict);
        Ok(())
    }

    #[tokio::test]
    async fn event_sequences_are_dense_per_workflow() -> Result<()> {
        let store = MemoryStore::new();
        let wf = workflow();
        let other = workflow();

        let mut uow = store.begin().await?;
        uow.insert_workflow(&wf).await?;
        uow.insert_workflow(&other).await?;
        let first = uow
            .append_event(
                wf.id,
                EventKind::WorkflowCreated,
                serde_json::json!({}),
                Utc::now(),
            )
            .await?;
        let unrelated = uow
            .append_event(
                other.id,
                EventKind::WorkflowCreated,
                serde_json::json!({}),
                Utc::now(),
            )
            .await?;
        let second = uow
            .append_event(
                wf.id,
                EventKind::WorkflowStateChanged,
                serde_json::json!({}),
                Utc::now(),
            )
            .await?;
        uow.commit().await?;

        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(unrelated.sequence, 1);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_is_rejected() -> Result<()> {
        let store = MemoryStore::new();
        let mut first = workflow();
        first.idempotency_key = Some("deploy-42".to_string());
        let mut second = workflow();
        second.idempotency_key = Some("deploy-42".to_string());

        let mut uow = store.begin().await?;
        uow.insert_workflow(&first).await?;
        uow.commit().await?;

        let mut uow = store.begin().await?;
        assert!(uow.insert_workflow(&second).await.is_err());
        Ok(())
    }
}
