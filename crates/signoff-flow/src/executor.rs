//! The step executor: drives workflows through their pipelines.
//!
//! The executor reacts to `workflow.created`, `approval.received`, and
//! `workflow.rollback_requested` bus events. Consecutive task steps are
//! driven by the internal advance loop (each completed step immediately
//! claims the next), while approval steps park the workflow in
//! `WAITING_APPROVAL` until a decision event arrives.
//!
//! ## Double-advance protection
//!
//! Two executor instances may observe the same workflow, e.g. after a
//! race between `approval.received` and a timer tick. Every claim runs a
//! state-machine transition under the workflow version guard, so the
//! losing instance observes `ConcurrentModification`, logs, and exits;
//! the winner continues. Suspended workflows are not suspended stacks:
//! the database row plus the running approval step IS the continuation,
//! which is what makes crash recovery a plain re-read-and-advance.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value as JsonValue;

use signoff_core::{ApprovalId, WorkflowId};

use crate::approval::{ApprovalStatus, Decision, UiSchema};
use crate::approvals::ApprovalService;
use crate::bus::EventBus;
use crate::error::{Error, Result};
use crate::events::FlowEventData;
use crate::machine::{record, StateMachine};
use crate::outbox::Outbox;
use crate::registry::TaskRegistry;
use crate::step::{Step, StepKind, StepStatus};
use crate::store::{Store, UnitOfWork};
use crate::workflow::{Workflow, WorkflowState};

/// Context key holding the inline approval schema of single-step
/// workflows.
pub(crate) const CTX_APPROVAL_SCHEMA: &str = "_approval_schema";
/// Context key holding the inline approval timeout of single-step
/// workflows.
pub(crate) const CTX_APPROVAL_TIMEOUT: &str = "_approval_timeout";

/// What the advance loop decided to do next.
enum Claim {
    /// Nothing further to do (terminal, parked on an approval, or lost a
    /// race).
    Exit,
    /// A task step was claimed; run its handler.
    RunTask(Step),
}

/// Drives multi-step pipelines and single-step approval workflows.
pub struct StepExecutor {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    machine: Arc<StateMachine>,
    approvals: Arc<ApprovalService>,
    registry: Arc<TaskRegistry>,
    default_approval_timeout_secs: u64,
}

impl StepExecutor {
    /// Creates a step executor.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        machine: Arc<StateMachine>,
        approvals: Arc<ApprovalService>,
        registry: Arc<TaskRegistry>,
        default_approval_timeout_secs: u64,
    ) -> Self {
        Self {
            store,
            bus,
            machine,
            approvals,
            registry,
            default_approval_timeout_secs,
        }
    }

    /// Reacts to `workflow.created`: starts the workflow.
    ///
    /// Multi-step workflows transition to `RUNNING` and advance. For
    /// single-step workflows, an inline approval schema in the context
    /// parks the workflow on a fresh approval; without one the workflow
    /// completes immediately.
    ///
    /// # Errors
    ///
    /// Propagates storage and transition errors. Lost claim races are
    /// recovered internally and are not errors.
    pub async fn on_created(&self, workflow_id: WorkflowId) -> Result<()> {
        let mut uow = self.store.begin().await?;
        let mut outbox = Outbox::new();

        let Some(mut workflow) = uow.workflow(workflow_id).await? else {
            return Err(Error::WorkflowNotFound { workflow_id });
        };
        if workflow.state != WorkflowState::Created {
            // Duplicate delivery; another instance already started it.
            return Ok(());
        }

        let result = self
            .machine
            .transition_in(
                uow.as_mut(),
                &mut outbox,
                &mut workflow,
                WorkflowState::Running,
                serde_json::json!({"reason": "workflow started"}),
            )
            .await;
        if swallow_lost_race(result, workflow_id)?.is_none() {
            return Ok(());
        }

        if workflow.is_multi_step {
            uow.commit().await?;
            self.bus.publish_all(outbox.drain()).await?;
            return self.advance(workflow_id).await;
        }

        // Single-step: the inline schema is the entire pipeline.
        if let Some(schema_value) = workflow.context.get(CTX_APPROVAL_SCHEMA).cloned() {
            let ui_schema: UiSchema = serde_json::from_value(schema_value)
                .map_err(|e| Error::validation(format!("approval schema invalid: {e}")))?;
            let timeout_seconds = workflow
                .context
                .get(CTX_APPROVAL_TIMEOUT)
                .and_then(JsonValue::as_u64)
                .unwrap_or(self.default_approval_timeout_secs);

            self.approvals
                .request_in(
                    uow.as_mut(),
                    &mut outbox,
                    &mut workflow,
                    None,
                    ui_schema,
                    timeout_seconds,
                )
                .await?;
        } else {
            self.machine
                .complete_in(
                    uow.as_mut(),
                    &mut outbox,
                    &mut workflow,
                    serde_json::json!({"autoApproved": true}),
                )
                .await?;
        }

        uow.commit().await?;
        self.bus.publish_all(outbox.drain()).await?;
        Ok(())
    }

    /// Reacts to `approval.received`: records the step outcome and either
    /// advances (approve) or runs compensation (reject).
    ///
    /// # Errors
    ///
    /// Propagates storage and transition errors.
    pub async fn on_decision(
        &self,
        approval_id: ApprovalId,
        decision: Decision,
        response_data: JsonValue,
    ) -> Result<()> {
        let Some(step) = self.store.step_by_approval(approval_id).await? else {
            return self.finish_single_step(approval_id, decision).await;
        };
        let workflow_id = step.workflow_id;

        let mut uow = self.store.begin().await?;
        let mut outbox = Outbox::new();

        let Some(mut step) = uow.step(step.id).await? else {
            return Err(Error::StepNotFound { step_id: step.id });
        };
        if step.status != StepStatus::Running {
            // Duplicate delivery; the outcome is already recorded.
            return Ok(());
        }

        step.completed_at = Some(Utc::now());
        match decision {
            Decision::Approve => {
                step.status = StepStatus::Completed;
                step.task_output = Some(response_data);
                uow.update_step(&step).await?;
                record(
                    uow.as_mut(),
                    &mut outbox,
                    FlowEventData::StepCompleted {
                        workflow_id,
                        step_id: step.id,
                        step_index: step.step_index,
                        output: step.task_output.clone().unwrap_or(JsonValue::Null),
                    },
                )
                .await?;
            }
            Decision::Reject => {
                step.status = StepStatus::Failed;
                step.task_output = Some(response_data);
                uow.update_step(&step).await?;
                record(
                    uow.as_mut(),
                    &mut outbox,
                    FlowEventData::StepFailed {
                        workflow_id,
                        step_id: step.id,
                        step_index: step.step_index,
                        error: "approval rejected".to_string(),
                    },
                )
                .await?;
            }
        }

        uow.commit().await?;
        self.bus.publish_all(outbox.drain()).await?;

        match decision {
            Decision::Approve => self.advance(workflow_id).await,
            Decision::Reject => {
                // The workflow is already REJECTED; completed steps keep
                // their status, but their external effects are undone.
                self.compensate(workflow_id, step.step_index).await;
                Ok(())
            }
        }
    }

    /// Reacts to `workflow.rollback_requested`: re-enters the wait on the
    /// reopened approval (or re-runs the pipeline from it).
    ///
    /// # Errors
    ///
    /// Propagates storage and transition errors.
    pub async fn on_rollback(&self, workflow_id: WorkflowId) -> Result<()> {
        let Some(workflow) = self.store.workflow(workflow_id).await? else {
            return Err(Error::WorkflowNotFound { workflow_id });
        };

        if workflow.is_multi_step {
            return self.advance(workflow_id).await;
        }

        // Single-step: the approval is PENDING again; park the workflow
        // back on it without minting a duplicate.
        let mut uow = self.store.begin().await?;
        let mut outbox = Outbox::new();
        let Some(mut workflow) = uow.workflow(workflow_id).await? else {
            return Err(Error::WorkflowNotFound { workflow_id });
        };
        if workflow.state != WorkflowState::Running {
            return Ok(());
        }
        let result = self
            .machine
            .transition_in(
                uow.as_mut(),
                &mut outbox,
                &mut workflow,
                WorkflowState::WaitingApproval,
                serde_json::json!({"reason": "rollback re-entered wait"}),
            )
            .await;
        if swallow_lost_race(result, workflow_id)?.is_none() {
            return Ok(());
        }
        uow.commit().await?;
        self.bus.publish_all(outbox.drain()).await?;
        Ok(())
    }

    /// Resumes a retried workflow (state `RUNNING` after
    /// `StateMachine::retry`).
    ///
    /// Multi-step: resets the first failed or interrupted step and
    /// everything after it to `pending` (clearing outputs and approval
    /// links), then advances. Single-step: re-requests the approval from
    /// the inline schema.
    ///
    /// # Errors
    ///
    /// Propagates storage and transition errors.
    pub async fn resume(&self, workflow_id: WorkflowId) -> Result<()> {
        let Some(workflow) = self.store.workflow(workflow_id).await? else {
            return Err(Error::WorkflowNotFound { workflow_id });
        };

        if workflow.is_multi_step {
            self.reset_steps_from_failure(workflow_id).await?;
            return self.advance(workflow_id).await;
        }

        let mut uow = self.store.begin().await?;
        let mut outbox = Outbox::new();
        let Some(mut workflow) = uow.workflow(workflow_id).await? else {
            return Err(Error::WorkflowNotFound { workflow_id });
        };
        if workflow.state != WorkflowState::Running {
            return Ok(());
        }

        if let Some(schema_value) = workflow.context.get(CTX_APPROVAL_SCHEMA).cloned() {
            let ui_schema: UiSchema = serde_json::from_value(schema_value)
                .map_err(|e| Error::validation(format!("approval schema invalid: {e}")))?;
            let timeout_seconds = workflow
                .context
                .get(CTX_APPROVAL_TIMEOUT)
                .and_then(JsonValue::as_u64)
                .unwrap_or(self.default_approval_timeout_secs);
            self.approvals
                .request_in(
                    uow.as_mut(),
                    &mut outbox,
                    &mut workflow,
                    None,
                    ui_schema,
                    timeout_seconds,
                )
                .await?;
        } else {
            self.machine
                .complete_in(
                    uow.as_mut(),
                    &mut outbox,
                    &mut workflow,
                    serde_json::json!({"autoApproved": true}),
                )
                .await?;
        }

        uow.commit().await?;
        self.bus.publish_all(outbox.drain()).await?;
        Ok(())
    }

    /// Runs the workflow forward until it completes, fails, or parks on
    /// an approval.
    ///
    /// # Errors
    ///
    /// Propagates storage and transition errors. A lost claim race exits
    /// cleanly with `Ok(())`.
    #[tracing::instrument(skip(self), fields(workflow_id = %workflow_id))]
    pub async fn advance(&self, workflow_id: WorkflowId) -> Result<()> {
        loop {
            match self.claim_next(workflow_id).await {
                Ok(Claim::Exit) => return Ok(()),
                Ok(Claim::RunTask(step)) => {
                    if !self.run_task(step).await? {
                        return Ok(());
                    }
                }
                Err(err) if err.is_concurrent_modification() => {
                    tracing::info!(
                        workflow_id = %workflow_id,
                        "executor lost claim race; exiting"
                    );
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Claims the next non-completed step under the version guard.
    async fn claim_next(&self, workflow_id: WorkflowId) -> Result<Claim> {
        let mut uow = self.store.begin().await?;
        let mut outbox = Outbox::new();

        let Some(mut workflow) = uow.workflow(workflow_id).await? else {
            return Err(Error::WorkflowNotFound { workflow_id });
        };
        if workflow.is_terminal() {
            return Ok(Claim::Exit);
        }

        let steps = uow.steps(workflow_id).await?;
        let Some(mut step) = steps
            .into_iter()
            .find(|step| step.status != StepStatus::Completed)
        else {
            self.machine
                .complete_in(
                    uow.as_mut(),
                    &mut outbox,
                    &mut workflow,
                    serde_json::json!({"message": "all steps completed"}),
                )
                .await?;
            uow.commit().await?;
            self.bus.publish_all(outbox.drain()).await?;
            return Ok(Claim::Exit);
        };

        if step.status == StepStatus::Failed {
            let error = step
                .task_output
                .as_ref()
                .and_then(|out| out.get("error"))
                .and_then(JsonValue::as_str)
                .unwrap_or("step failed")
                .to_string();
            self.machine
                .fail_in(uow.as_mut(), &mut outbox, &mut workflow, &error)
                .await?;
            uow.commit().await?;
            self.bus.publish_all(outbox.drain()).await?;
            return Ok(Claim::Exit);
        }

        match step.kind {
            StepKind::Approval => {
                self.claim_approval_step(uow, outbox, workflow, step).await
            }
            StepKind::Task => {
                // The RUNNING write (self-edge or APPROVED -> RUNNING) is
                // the claim; a racing executor loses here.
                self.machine
                    .transition_in(
                        uow.as_mut(),
                        &mut outbox,
                        &mut workflow,
                        WorkflowState::Running,
                        serde_json::json!({
                            "reason": "advancing",
                            "stepIndex": step.step_index,
                        }),
                    )
                    .await?;

                if step.status == StepStatus::Pending {
                    step.status = StepStatus::Running;
                    step.started_at = Some(Utc::now());
                    uow.update_step(&step).await?;
                    record(
                        uow.as_mut(),
                        &mut outbox,
                        FlowEventData::StepStarted {
                            workflow_id,
                            step_id: step.id,
                            step_index: step.step_index,
                            step_kind: step.kind,
                        },
                    )
                    .await?;
                }

                uow.commit().await?;
                self.bus.publish_all(outbox.drain()).await?;
                Ok(Claim::RunTask(step))
            }
        }
    }

    /// Claims an approval step: re-enters an existing pending approval or
    /// mints a new one.
    async fn claim_approval_step(
        &self,
        mut uow: Box<dyn UnitOfWork>,
        mut outbox: Outbox,
        mut workflow: Workflow,
        mut step: Step,
    ) -> Result<Claim> {
        // Idempotency guard: a live approval already attached to the step
        // means this claim is a resume, not a new request.
        if let Some(approval_id) = step.approval_id {
            if let Some(approval) = uow.lock_approval(approval_id).await? {
                if approval.status == ApprovalStatus::Pending {
                    if workflow.state == WorkflowState::WaitingApproval {
                        return Ok(Claim::Exit);
                    }
                    if workflow.state == WorkflowState::Approved {
                        self.machine
                            .transition_in(
                                uow.as_mut(),
                                &mut outbox,
                                &mut workflow,
                                WorkflowState::Running,
                                serde_json::json!({"reason": "advancing"}),
                            )
                            .await?;
                    }
                    self.machine
                        .transition_in(
                            uow.as_mut(),
                            &mut outbox,
                            &mut workflow,
                            WorkflowState::WaitingApproval,
                            serde_json::json!({
                                "reason": "re-entered wait",
                                "approvalId": approval_id.to_string(),
                            }),
                        )
                        .await?;
                    if step.status != StepStatus::Running {
                        step.status = StepStatus::Running;
                        step.started_at = Some(Utc::now());
                        uow.update_step(&step).await?;
                    }
                    uow.commit().await?;
                    self.bus.publish_all(outbox.drain()).await?;
                    return Ok(Claim::Exit);
                }
            }
        }

        // APPROVED cannot reach WAITING_APPROVAL directly; pass through
        // RUNNING first.
        if workflow.state == WorkflowState::Approved {
            self.machine
                .transition_in(
                    uow.as_mut(),
                    &mut outbox,
                    &mut workflow,
                    WorkflowState::Running,
                    serde_json::json!({
                        "reason": "advancing",
                        "stepIndex": step.step_index,
                    }),
                )
                .await?;
        }

        let config = ApprovalStepConfig::from_input(step.task_input.as_ref())?;
        let timeout_seconds = config
            .timeout_seconds
            .unwrap_or(self.default_approval_timeout_secs);

        let started_fresh = step.status == StepStatus::Pending;
        step.status = StepStatus::Running;
        step.started_at = Some(Utc::now());

        let approval = self
            .approvals
            .request_in(
                uow.as_mut(),
                &mut outbox,
                &mut workflow,
                Some(step.id),
                config.ui_schema,
                timeout_seconds,
            )
            .await?;

        step.approval_id = Some(approval.id);
        uow.update_step(&step).await?;
        if started_fresh {
            record(
                uow.as_mut(),
                &mut outbox,
                FlowEventData::StepStarted {
                    workflow_id: workflow.id,
                    step_id: step.id,
                    step_index: step.step_index,
                    step_kind: step.kind,
                },
            )
            .await?;
        }

        uow.commit().await?;
        self.bus.publish_all(outbox.drain()).await?;
        Ok(Claim::Exit)
    }

    /// Runs a claimed task step. Returns `true` to keep advancing.
    async fn run_task(&self, step: Step) -> Result<bool> {
        let handler_name = step.task_handler.clone().unwrap_or_default();
        let input = step.task_input.clone().unwrap_or(JsonValue::Null);

        // A missing handler is a permanent failure; a raised error is a
        // permanent step failure. Retries are orchestrated at the
        // workflow level, never per step.
        let outcome = match self.registry.resolve(&handler_name) {
            Ok(handler) => handler.run(&input).await,
            Err(err) => Err(err),
        };

        match outcome {
            Ok(output) => {
                self.finish_task(step, output).await?;
                Ok(true)
            }
            Err(err) => {
                tracing::error!(
                    workflow_id = %step.workflow_id,
                    step_id = %step.id,
                    handler = %handler_name,
                    error = %err,
                    "task step failed"
                );
                self.fail_task(step, &err.to_string()).await?;
                Ok(false)
            }
        }
    }

    async fn finish_task(&self, mut step: Step, output: JsonValue) -> Result<()> {
        let mut uow = self.store.begin().await?;
        let mut outbox = Outbox::new();

        step.status = StepStatus::Completed;
        step.task_output = Some(output.clone());
        step.completed_at = Some(Utc::now());
        uow.update_step(&step).await?;

        record(
            uow.as_mut(),
            &mut outbox,
            FlowEventData::StepCompleted {
                workflow_id: step.workflow_id,
                step_id: step.id,
                step_index: step.step_index,
                output,
            },
        )
        .await?;

        uow.commit().await?;
        self.bus.publish_all(outbox.drain()).await?;
        Ok(())
    }

    async fn fail_task(&self, mut step: Step, error: &str) -> Result<()> {
        let mut uow = self.store.begin().await?;
        let mut outbox = Outbox::new();

        step.status = StepStatus::Failed;
        step.task_output = Some(serde_json::json!({"error": error}));
        step.completed_at = Some(Utc::now());
        uow.update_step(&step).await?;

        record(
            uow.as_mut(),
            &mut outbox,
            FlowEventData::StepFailed {
                workflow_id: step.workflow_id,
                step_id: step.id,
                step_index: step.step_index,
                error: error.to_string(),
            },
        )
        .await?;

        let Some(mut workflow) = uow.workflow(step.workflow_id).await? else {
            return Err(Error::WorkflowNotFound {
                workflow_id: step.workflow_id,
            });
        };
        self.machine
            .fail_in(uow.as_mut(), &mut outbox, &mut workflow, error)
            .await?;

        uow.commit().await?;
        self.bus.publish_all(outbox.drain()).await?;
        Ok(())
    }

    /// Completes a single-step workflow after its approval was approved.
    async fn finish_single_step(
        &self,
        approval_id: ApprovalId,
        decision: Decision,
    ) -> Result<()> {
        if decision == Decision::Reject {
            // The submit path already moved the workflow to REJECTED.
            return Ok(());
        }

        let Some(approval) = self.store.approval(approval_id).await? else {
            return Err(Error::ApprovalNotFound { approval_id });
        };

        let mut uow = self.store.begin().await?;
        let mut outbox = Outbox::new();
        let Some(mut workflow) = uow.workflow(approval.workflow_id).await? else {
            return Err(Error::WorkflowNotFound {
                workflow_id: approval.workflow_id,
            });
        };
        if workflow.state != WorkflowState::Approved {
            // Duplicate delivery or a racing instance already finished.
            return Ok(());
        }

        let result = self
            .machine
            .complete_in(
                uow.as_mut(),
                &mut outbox,
                &mut workflow,
                serde_json::json!({
                    "approval": approval.response_data.clone().unwrap_or(JsonValue::Null),
                }),
            )
            .await;
        if swallow_lost_race(result, workflow.id)?.is_none() {
            return Ok(());
        }
        uow.commit().await?;
        self.bus.publish_all(outbox.drain()).await?;
        Ok(())
    }

    /// Resets the first failed or interrupted step and everything after
    /// it to `pending`, so a retry resumes from the failure point.
    async fn reset_steps_from_failure(&self, workflow_id: WorkflowId) -> Result<()> {
        let mut uow = self.store.begin().await?;

        let steps = uow.steps(workflow_id).await?;
        let Some(first_failed) = steps
            .iter()
            .find(|step| matches!(step.status, StepStatus::Failed | StepStatus::Running))
            .map(|step| step.step_index)
        else {
            return Ok(());
        };

        let mut reset_count = 0u32;
        for mut step in steps {
            if step.step_index >= first_failed && step.status != StepStatus::Pending {
                step.reset();
                uow.update_step(&step).await?;
                reset_count += 1;
            }
        }
        uow.commit().await?;

        tracing::info!(
            workflow_id = %workflow_id,
            from_index = first_failed,
            steps_reset = reset_count,
            "steps reset for retry"
        );
        Ok(())
    }

    /// Runs compensation handlers over completed task steps that precede
    /// the rejected approval, in reverse order. Statuses stay
    /// `completed`; only external effects are undone. Failures are
    /// logged, never fatal.
    async fn compensate(&self, workflow_id: WorkflowId, rejected_index: u32) {
        let steps = match self.store.steps(workflow_id).await {
            Ok(steps) => steps,
            Err(err) => {
                tracing::error!(
                    workflow_id = %workflow_id,
                    error = %err,
                    "compensation skipped: step load failed"
                );
                return;
            }
        };

        for step in steps.iter().rev() {
            if step.step_index >= rejected_index
                || step.kind != StepKind::Task
                || step.status != StepStatus::Completed
            {
                continue;
            }
            let Some(handler_name) = step.task_handler.as_deref() else {
                continue;
            };
            let Some(compensation) = self.registry.compensation(handler_name) else {
                continue;
            };
            let output = step.task_output.clone().unwrap_or(JsonValue::Null);
            if let Err(err) = compensation.compensate(&output).await {
                tracing::error!(
                    workflow_id = %workflow_id,
                    step_id = %step.id,
                    handler = handler_name,
                    error = %err,
                    "compensation handler failed"
                );
            } else {
                tracing::info!(
                    workflow_id = %workflow_id,
                    step_id = %step.id,
                    handler = handler_name,
                    "step compensated"
                );
            }
        }
    }
}

/// Approval configuration carried in an approval step's `task_input`.
struct ApprovalStepConfig {
    ui_schema: UiSchema,
    timeout_seconds: Option<u64>,
}

impl ApprovalStepConfig {
    fn from_input(input: Option<&JsonValue>) -> Result<Self> {
        let Some(input) = input else {
            return Ok(Self {
                ui_schema: UiSchema::default(),
                timeout_seconds: None,
            });
        };

        let ui_schema = match input.get("ui_schema") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| Error::validation(format!("approval step ui_schema invalid: {e}")))?,
            None => UiSchema::default(),
        };
        let timeout_seconds = input.get("timeout_seconds").and_then(JsonValue::as_u64);

        Ok(Self {
            ui_schema,
            timeout_seconds,
        })
    }
}

/// Maps a lost version race to a clean `None`; real errors propagate.
fn swallow_lost_race(result: Result<()>, workflow_id: WorkflowId) -> Result<Option<()>> {
    match result {
        Ok(()) => Ok(Some(())),
        Err(err) if err.is_concurrent_modification() => {
            tracing::info!(workflow_id = %workflow_id, "lost claim race; exiting");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}
