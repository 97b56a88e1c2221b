//! The workflow state machine.
//!
//! Every persisted workflow mutation flows through here. A transition
//! atomically (1) loads the row, (2) verifies the expected version,
//! (3) validates the edge against [`WorkflowState::can_transition_to`],
//! (4) writes the new state with `version + 1` under a conditional
//! update, and (5) appends a `workflow.state_changed` audit event, then
//! commits. Bus events are published only after commit, via the outbox.
//!
//! Version-on-every-write plus the conditional update gives lost-update
//! safety without coarse locking: the timeout manager and the approval
//! path run concurrently and the loser of any race observes
//! `ConcurrentModification` instead of interleaving committed states.

use std::sync::Arc;

use chrono::Utc;
use metrics::counter;

use signoff_core::WorkflowId;

use crate::approval::ApprovalStatus;
use crate::bus::EventBus;
use crate::error::{Error, Result};
use crate::events::{FlowEvent, FlowEventData};
use crate::metrics::{labels, names};
use crate::outbox::{EventSink, Outbox};
use crate::step::StepStatus;
use crate::store::{Store, UnitOfWork};
use crate::workflow::{Workflow, WorkflowState};

/// Appends an audit row and queues the matching bus event.
///
/// The audit payload is the serialized event data, so the persisted
/// history and the bus see the same shape.
pub(crate) async fn record(
    uow: &mut dyn UnitOfWork,
    outbox: &mut Outbox,
    data: FlowEventData,
) -> Result<()> {
    let event = FlowEvent::new(data);
    let payload = serde_json::to_value(&event.data)
        .map_err(|e| Error::serialization(format!("event payload: {e}")))?;
    uow.append_event(event.workflow_id(), event.kind, payload, event.occurred_at)
        .await?;
    outbox.push(event);
    Ok(())
}

/// Validated, versioned workflow state transitions.
pub struct StateMachine {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
}

impl StateMachine {
    /// Creates a state machine over the given store and bus.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    /// Transitions a workflow inside a caller-owned unit of work.
    ///
    /// `workflow` is mutated in place: state, `updated_at`, and `version`
    /// advance, and the conditional update guards against concurrent
    /// writers. The `workflow.state_changed` audit event is appended and
    /// the bus envelope queued on `outbox` for post-commit publication.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidTransition`] when the edge is not in the table.
    /// - [`Error::ConcurrentModification`] when another writer won.
    pub async fn transition_in(
        &self,
        uow: &mut dyn UnitOfWork,
        outbox: &mut Outbox,
        workflow: &mut Workflow,
        to: WorkflowState,
        payload: serde_json::Value,
    ) -> Result<()> {
        let from = workflow.state;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { from, to });
        }

        let expected_version = workflow.version;
        workflow.state = to;
        workflow.version += 1;
        workflow.updated_at = Utc::now();

        if !uow
            .update_workflow(workflow, expected_version)
            .await?
            .is_committed()
        {
            return Err(Error::ConcurrentModification {
                workflow_id: workflow.id,
                expected_version,
            });
        }

        counter!(
            names::TRANSITIONS_TOTAL,
            labels::FROM_STATE => from.as_str(),
            labels::TO_STATE => to.as_str(),
        )
        .increment(1);
        tracing::info!(
            workflow_id = %workflow.id,
            from = %from,
            to = %to,
            version = workflow.version,
            "workflow state changed"
        );

        record(
            uow,
            outbox,
            FlowEventData::WorkflowStateChanged {
                workflow_id: workflow.id,
                from,
                to,
                payload,
            },
        )
        .await
    }

    /// Transitions a workflow in its own transaction.
    ///
    /// Verifies `expected_version` against the loaded row before writing;
    /// publishes `workflow.state_changed` after commit.
    ///
    /// # Errors
    ///
    /// - [`Error::WorkflowNotFound`] for unknown IDs.
    /// - [`Error::ConcurrentModification`] on version mismatch.
    /// - [`Error::InvalidTransition`] on a disallowed edge.
    #[tracing::instrument(skip(self, payload), fields(workflow_id = %workflow_id, to = %to))]
    pub async fn transition(
        &self,
        workflow_id: WorkflowId,
        to: WorkflowState,
        expected_version: u64,
        payload: serde_json::Value,
    ) -> Result<Workflow> {
        let mut uow = self.store.begin().await?;
        let mut outbox = Outbox::new();

        let mut workflow = uow
            .workflow(workflow_id)
            .await?
            .ok_or(Error::WorkflowNotFound { workflow_id })?;
        if workflow.version != expected_version {
            return Err(Error::ConcurrentModification {
                workflow_id,
                expected_version,
            });
        }

        self.transition_in(uow.as_mut(), &mut outbox, &mut workflow, to, payload)
            .await?;
        uow.commit().await?;
        self.bus.publish_all(outbox.drain()).await?;
        Ok(workflow)
    }

    /// Reopens a `FAILED` or `TIMEOUT` workflow for another attempt.
    ///
    /// Consumes one retry slot, stamps `last_retry_at`, cancels any
    /// orphaned pending approvals from the previous attempt, and
    /// transitions to `RUNNING` in one versioned write.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidTransition`] outside `FAILED`/`TIMEOUT`.
    /// - [`Error::Validation`] when the retry budget is exhausted.
    pub async fn retry(&self, workflow_id: WorkflowId) -> Result<Workflow> {
        let mut uow = self.store.begin().await?;
        let mut outbox = Outbox::new();

        let mut workflow = uow
            .workflow(workflow_id)
            .await?
            .ok_or(Error::WorkflowNotFound { workflow_id })?;

        if !matches!(
            workflow.state,
            WorkflowState::Failed | WorkflowState::Timeout
        ) {
            return Err(Error::InvalidTransition {
                from: workflow.state,
                to: WorkflowState::Running,
            });
        }
        if !workflow.has_retry_budget() {
            return Err(Error::validation(format!(
                "retry budget exhausted ({}/{})",
                workflow.retry_count, workflow.max_retries
            )));
        }

        cancel_pending_approvals(uow.as_mut(), &workflow).await?;

        workflow.retry_count += 1;
        workflow.last_retry_at = Some(Utc::now());
        let attempt = workflow.retry_count;
        let max_retries = workflow.max_retries;

        self.transition_in(
            uow.as_mut(),
            &mut outbox,
            &mut workflow,
            WorkflowState::Running,
            serde_json::json!({
                "reason": "retry",
                "attempt": attempt,
                "maxRetries": max_retries,
            }),
        )
        .await?;

        uow.commit().await?;
        self.bus.publish_all(outbox.drain()).await?;

        tracing::info!(
            workflow_id = %workflow_id,
            attempt,
            max_retries = workflow.max_retries,
            "workflow retry initiated"
        );
        Ok(workflow)
    }

    /// Fails a workflow inside a caller-owned unit of work.
    ///
    /// Keeps terminal workflows consistent: pending approvals are
    /// cancelled and the running step (if any) marked failed in the same
    /// transaction, then the workflow transitions to `FAILED` and a
    /// `workflow.failed` audit event carries the reason.
    pub async fn fail_in(
        &self,
        uow: &mut dyn UnitOfWork,
        outbox: &mut Outbox,
        workflow: &mut Workflow,
        error: &str,
    ) -> Result<()> {
        let cancelled = cancel_pending_approvals(uow, workflow).await?;

        let mut steps = uow.steps(workflow.id).await?;
        for step in &mut steps {
            if step.status == StepStatus::Running {
                step.status = StepStatus::Failed;
                step.completed_at = Some(Utc::now());
                step.task_output = Some(serde_json::json!({
                    "error": error,
                    "interrupted": true,
                }));
                uow.update_step(step).await?;
            }
        }

        self.transition_in(
            uow,
            outbox,
            workflow,
            WorkflowState::Failed,
            serde_json::json!({
                "error": error,
                "cancelledApprovals": cancelled,
            }),
        )
        .await?;

        record(
            uow,
            outbox,
            FlowEventData::WorkflowFailed {
                workflow_id: workflow.id,
                error: error.to_string(),
            },
        )
        .await
    }

    /// Fails a workflow in its own transaction. See [`StateMachine::fail_in`].
    ///
    /// # Errors
    ///
    /// Propagates transition and storage errors.
    pub async fn fail(&self, workflow_id: WorkflowId, error: &str) -> Result<Workflow> {
        let mut uow = self.store.begin().await?;
        let mut outbox = Outbox::new();

        let mut workflow = uow
            .workflow(workflow_id)
            .await?
            .ok_or(Error::WorkflowNotFound { workflow_id })?;

        self.fail_in(uow.as_mut(), &mut outbox, &mut workflow, error)
            .await?;
        uow.commit().await?;
        self.bus.publish_all(outbox.drain()).await?;
        Ok(workflow)
    }

    /// Completes a workflow inside a caller-owned unit of work, appending
    /// the `workflow.completed` audit event.
    pub async fn complete_in(
        &self,
        uow: &mut dyn UnitOfWork,
        outbox: &mut Outbox,
        workflow: &mut Workflow,
        result: serde_json::Value,
    ) -> Result<()> {
        self.transition_in(
            uow,
            outbox,
            workflow,
            WorkflowState::Completed,
            serde_json::json!({"reason": "all work finished"}),
        )
        .await?;

        record(
            uow,
            outbox,
            FlowEventData::WorkflowCompleted {
                workflow_id: workflow.id,
                result,
            },
        )
        .await
    }
}

/// Cancels the workflow's PENDING approvals, returning their IDs.
///
/// Invariant: a workflow in a terminal state never owns a live approval.
async fn cancel_pending_approvals(
    uow: &mut dyn UnitOfWork,
    workflow: &Workflow,
) -> Result<Vec<String>> {
    let pending = uow.pending_approvals(workflow.id).await?;
    let mut cancelled = Vec::with_capacity(pending.len());
    for mut approval in pending {
        approval.status = ApprovalStatus::Cancelled;
        approval.responded_at = Some(Utc::now());
        uow.update_approval(&approval).await?;
        cancelled.push(approval.id.to_string());
    }
    if !cancelled.is_empty() {
        tracing::info!(
            workflow_id = %workflow.id,
            count = cancelled.len(),
            "pending approvals cancelled"
        );
    }
    Ok(cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::store::memory::MemoryStore;

    fn harness() -> (Arc<MemoryStore>, StateMachine) {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::new(
            BusConfig::default(),
            Arc::clone(&store) as Arc<dyn Store>,
        ));
        bus.start();
        let machine = StateMachine::new(Arc::clone(&store) as Arc<dyn Store>, bus);
        (store, machine)
    }

    async fn seed(store: &MemoryStore) -> Result<Workflow> {
        let workflow = Workflow::new("deployment", serde_json::json!({}));
        let mut uow = store.begin().await?;
        uow.insert_workflow(&workflow).await?;
        uow.commit().await?;
        Ok(workflow)
    }

    #[tokio::test]
    async fn transition_bumps_version_and_appends_audit_event() -> Result<()> {
        let (store, machine) = harness();
        let workflow = seed(&store).await?;

        let updated = machine
            .transition(
                workflow.id,
                WorkflowState::Running,
                1,
                serde_json::json!({"reason": "start"}),
            )
            .await?;

        assert_eq!(updated.state, WorkflowState::Running);
        assert_eq!(updated.version, 2);

        let events = store.events(workflow.id).await?;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type.as_str(), "workflow.state_changed");
        assert_eq!(events[0].payload["from"], "CREATED");
        assert_eq!(events[0].payload["to"], "RUNNING");
        Ok(())
    }

    #[tokio::test]
    async fn stale_version_is_rejected() -> Result<()> {
        let (store, machine) = harness();
        let workflow = seed(&store).await?;

        machine
            .transition(workflow.id, WorkflowState::Running, 1, serde_json::json!({}))
            .await?;

        let err = machine
            .transition(workflow.id, WorkflowState::Completed, 1, serde_json::json!({}))
            .await
            .expect_err("stale version must fail");
        assert!(err.is_concurrent_modification());
        Ok(())
    }

    #[tokio::test]
    async fn disallowed_edge_is_rejected() -> Result<()> {
        let (store, machine) = harness();
        let workflow = seed(&store).await?;

        let err = machine
            .transition(
                workflow.id,
                WorkflowState::Approved,
                1,
                serde_json::json!({}),
            )
            .await
            .expect_err("CREATED -> APPROVED must fail");
        assert!(matches!(err, Error::InvalidTransition { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn retry_is_limited_to_failed_and_timeout() -> Result<()> {
        let (store, machine) = harness();
        let workflow = seed(&store).await?;

        let err = machine.retry(workflow.id).await.expect_err("must fail");
        assert!(matches!(err, Error::InvalidTransition { .. }));

        machine
            .transition(workflow.id, WorkflowState::Running, 1, serde_json::json!({}))
            .await?;
        machine.fail(workflow.id, "boom").await?;

        let retried = machine.retry(workflow.id).await?;
        assert_eq!(retried.state, WorkflowState::Running);
        assert_eq!(retried.retry_count, 1);
        assert!(retried.last_retry_at.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn retry_budget_is_enforced() -> Result<()> {
        let (store, machine) = harness();
        let mut workflow = Workflow::new("deployment", serde_json::json!({}));
        workflow.max_retries = 1;
        workflow.state = WorkflowState::Failed;
        let mut uow = store.begin().await?;
        uow.insert_workflow(&workflow).await?;
        uow.commit().await?;

        machine.retry(workflow.id).await?;
        machine.fail(workflow.id, "boom again").await?;

        let err = machine.retry(workflow.id).await.expect_err("budget spent");
        assert!(matches!(err, Error::Validation { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn versions_increase_by_one_per_mutation() -> Result<()> {
        let (store, machine) = harness();
        let workflow = seed(&store).await?;

        let w1 = machine
            .transition(workflow.id, WorkflowState::Running, 1, serde_json::json!({}))
            .await?;
        let w2 = machine
            .transition(
                workflow.id,
                WorkflowState::Running,
                w1.version,
                serde_json::json!({}),
            )
            .await?;
        let w3 = machine
            .transition(
                workflow.id,
                WorkflowState::Completed,
                w2.version,
                serde_json::json!({}),
            )
            .await?;

        assert_eq!((w1.version, w2.version, w3.version), (2, 3, 4));
        Ok(())
    }

    #[tokio::test]
    async fn adjacent_state_changes_chain_from_and_to() -> Result<()> {
        let (store, machine) = harness();
        let workflow = seed(&store).await?;

        let w1 = machine
            .transition(workflow.id, WorkflowState::Running, 1, serde_json::json!({}))
            .await?;
        machine
            .transition(
                workflow.id,
                WorkflowState::WaitingApproval,
                w1.version,
                serde_json::json!({}),
            )
            .await?;

        let events = store.events(workflow.id).await?;
        let changes: Vec<_> = events
            .iter()
            .filter(|ev| ev.event_type.as_str() == "workflow.state_changed")
            .collect();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].payload["to"], changes[1].payload["from"]);
        Ok(())
    }
}
