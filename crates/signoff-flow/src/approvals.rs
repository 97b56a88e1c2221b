//! The approval service: request, decide, expire, and roll back
//! human-approval gates.
//!
//! ## Decision intake ordering
//!
//! [`ApprovalService::submit`] runs inside one transaction holding the
//! pessimistic row lock on the approval, and checks **expiry before
//! status**. The ordering is non-negotiable: checking status first races
//! the timeout scanner, letting a late decision appear to succeed against
//! a workflow that has already timed out. Concurrent submits for one
//! token serialize on the row lock; exactly one commits, the rest observe
//! the terminal status and fail with `AlreadyDecided`.

use std::sync::Arc;

use chrono::{Duration, Utc};
use metrics::counter;
use serde_json::Value as JsonValue;

use signoff_core::signing::{decode_callback_token, mint_callback_token, SigningConfig};
use signoff_core::{ApprovalId, StepId, WorkflowId};

use crate::approval::{Approval, ApprovalStatus, Decision, UiSchema};
use crate::bus::EventBus;
use crate::error::{Error, Result};
use crate::events::FlowEventData;
use crate::machine::{record, StateMachine};
use crate::metrics::{labels, names};
use crate::outbox::Outbox;
use crate::step::StepStatus;
use crate::store::{Store, UnitOfWork};
use crate::workflow::{Workflow, WorkflowState};

/// Manages the approval lifecycle.
pub struct ApprovalService {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    machine: Arc<StateMachine>,
    signing: SigningConfig,
}

impl ApprovalService {
    /// Creates an approval service.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        machine: Arc<StateMachine>,
        signing: SigningConfig,
    ) -> Self {
        Self {
            store,
            bus,
            machine,
            signing,
        }
    }

    /// Creates an approval inside a caller-owned unit of work.
    ///
    /// Inserts the PENDING approval with `expires_at = now + timeout`,
    /// mints the callback token bound to the approval ID and expiry,
    /// transitions the workflow to `WAITING_APPROVAL`, and queues the
    /// `approval.requested` event for post-commit publication.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for a zero timeout.
    /// - [`Error::TokenInvalid`] when no signing key is configured.
    /// - Transition errors from the state machine.
    pub async fn request_in(
        &self,
        uow: &mut dyn UnitOfWork,
        outbox: &mut Outbox,
        workflow: &mut Workflow,
        step_id: Option<StepId>,
        ui_schema: UiSchema,
        timeout_seconds: u64,
    ) -> Result<Approval> {
        if timeout_seconds == 0 {
            return Err(Error::validation("approval timeout must be positive"));
        }

        let now = Utc::now();
        let expires_at = now
            + Duration::seconds(
                i64::try_from(timeout_seconds)
                    .map_err(|_| Error::validation("approval timeout out of range"))?,
            );

        let approval_id = ApprovalId::generate();
        let minted = mint_callback_token(&self.signing, &approval_id.to_string(), expires_at)?;

        let approval = Approval {
            id: approval_id,
            workflow_id: workflow.id,
            step_id,
            ui_schema,
            status: ApprovalStatus::Pending,
            requested_at: now,
            expires_at,
            responded_at: None,
            decision: None,
            response_data: None,
            callback_token: minted.token,
        };
        uow.insert_approval(&approval).await?;

        self.machine
            .transition_in(
                uow,
                outbox,
                workflow,
                WorkflowState::WaitingApproval,
                serde_json::json!({
                    "reason": "approval requested",
                    "approvalId": approval.id.to_string(),
                }),
            )
            .await?;

        record(
            uow,
            outbox,
            FlowEventData::ApprovalRequested {
                approval_id: approval.id,
                workflow_id: workflow.id,
                expires_at,
            },
        )
        .await?;

        tracing::info!(
            approval_id = %approval.id,
            workflow_id = %workflow.id,
            expires_at = %expires_at,
            "approval requested"
        );
        Ok(approval)
    }

    /// Creates an approval in its own transaction, publishing after
    /// commit. Returns the approval, whose `callback_token` carries the
    /// minted token.
    ///
    /// # Errors
    ///
    /// See [`ApprovalService::request_in`]; additionally
    /// [`Error::WorkflowNotFound`].
    pub async fn request(
        &self,
        workflow_id: WorkflowId,
        step_id: Option<StepId>,
        ui_schema: UiSchema,
        timeout_seconds: u64,
    ) -> Result<Approval> {
        let mut uow = self.store.begin().await?;
        let mut outbox = Outbox::new();

        let mut workflow = uow
            .workflow(workflow_id)
            .await?
            .ok_or(Error::WorkflowNotFound { workflow_id })?;

        let approval = self
            .request_in(
                uow.as_mut(),
                &mut outbox,
                &mut workflow,
                step_id,
                ui_schema,
                timeout_seconds,
            )
            .await?;

        uow.commit().await?;
        self.bus.publish_all(outbox.drain()).await?;
        Ok(approval)
    }

    /// Verifies a callback token without touching any state.
    ///
    /// # Errors
    ///
    /// [`Error::TokenInvalid`] on verification failure, including the
    /// fail-closed path where no signing key is configured.
    pub fn verify_token(&self, token: &str) -> Result<()> {
        decode_callback_token(&self.signing, token)
            .map(|_| ())
            .map_err(Error::from)
    }

    /// Records a decision delivered through a signed callback.
    ///
    /// Token verification fails closed; then, under the approval row
    /// lock, the checks run in this exact order:
    ///
    /// 1. token lookup (`TokenInvalid`),
    /// 2. expiry (`ApprovalExpired`), regardless of status,
    /// 3. status (`AlreadyDecided`),
    /// 4. response validation against the UI schema (`Validation`).
    ///
    /// The decision write and the workflow transition commit atomically;
    /// `approval.received` is published after commit.
    ///
    /// # Errors
    ///
    /// As listed above, plus storage and transition errors.
    #[tracing::instrument(skip_all, fields(decision = %decision))]
    pub async fn submit(
        &self,
        token: &str,
        decision: Decision,
        response_data: JsonValue,
    ) -> Result<Approval> {
        let claims = decode_callback_token(&self.signing, token)?;

        let mut uow = self.store.begin().await?;
        let mut outbox = Outbox::new();

        let Some(mut approval) = uow.lock_approval_by_token(token).await? else {
            return Err(Error::token_invalid("callback token unknown"));
        };
        if claims.approval_id != approval.id.to_string() {
            return Err(Error::token_invalid("token not bound to this approval"));
        }

        let now = Utc::now();
        if approval.is_expired(now) {
            tracing::warn!(
                approval_id = %approval.id,
                workflow_id = %approval.workflow_id,
                expires_at = %approval.expires_at,
                "decision rejected: approval expired"
            );
            return Err(Error::ApprovalExpired {
                approval_id: approval.id,
                expired_at: approval.expires_at,
            });
        }

        if approval.status != ApprovalStatus::Pending {
            tracing::warn!(
                approval_id = %approval.id,
                status = %approval.status,
                "decision rejected: already decided"
            );
            return Err(Error::AlreadyDecided {
                approval_id: approval.id,
                status: approval.status,
            });
        }

        approval.ui_schema.validate_response(&response_data)?;

        approval.status = match decision {
            Decision::Approve => ApprovalStatus::Approved,
            Decision::Reject => ApprovalStatus::Rejected,
        };
        approval.decision = Some(decision);
        approval.response_data = Some(response_data.clone());
        approval.responded_at = Some(now);
        uow.update_approval(&approval).await?;

        let mut workflow = uow
            .workflow(approval.workflow_id)
            .await?
            .ok_or(Error::WorkflowNotFound {
                workflow_id: approval.workflow_id,
            })?;
        let to = match decision {
            Decision::Approve => WorkflowState::Approved,
            Decision::Reject => WorkflowState::Rejected,
        };
        self.machine
            .transition_in(
                uow.as_mut(),
                &mut outbox,
                &mut workflow,
                to,
                serde_json::json!({
                    "reason": "decision received",
                    "approvalId": approval.id.to_string(),
                    "decision": decision.as_str(),
                }),
            )
            .await?;

        record(
            uow.as_mut(),
            &mut outbox,
            FlowEventData::ApprovalReceived {
                approval_id: approval.id,
                workflow_id: approval.workflow_id,
                decision,
                response_data,
            },
        )
        .await?;

        uow.commit().await?;
        self.bus.publish_all(outbox.drain()).await?;

        counter!(names::DECISIONS_TOTAL, labels::DECISION => decision.as_str()).increment(1);
        tracing::info!(
            approval_id = %approval.id,
            workflow_id = %approval.workflow_id,
            decision = %decision,
            "approval decision recorded"
        );
        Ok(approval)
    }

    /// Expires one pending approval. Used by the timeout manager.
    ///
    /// Under the row lock, re-checks that the approval is still PENDING
    /// (a concurrent submit may have won the race) and returns `Ok(None)`
    /// if not. Otherwise stamps `TIMEOUT`/`responded_at`, transitions the
    /// owning workflow to `TIMEOUT`, and publishes `approval.timeout`
    /// after commit.
    ///
    /// # Errors
    ///
    /// [`Error::ApprovalNotFound`], plus storage and transition errors.
    pub async fn timeout(&self, approval_id: ApprovalId) -> Result<Option<Approval>> {
        let mut uow = self.store.begin().await?;
        let mut outbox = Outbox::new();

        let Some(mut approval) = uow.lock_approval(approval_id).await? else {
            return Err(Error::ApprovalNotFound { approval_id });
        };

        if approval.status != ApprovalStatus::Pending {
            tracing::debug!(
                approval_id = %approval_id,
                status = %approval.status,
                "timeout skipped: already decided"
            );
            return Ok(None);
        }

        approval.status = ApprovalStatus::Timeout;
        approval.responded_at = Some(Utc::now());
        uow.update_approval(&approval).await?;

        let mut workflow = uow
            .workflow(approval.workflow_id)
            .await?
            .ok_or(Error::WorkflowNotFound {
                workflow_id: approval.workflow_id,
            })?;
        if workflow.state == WorkflowState::WaitingApproval {
            self.machine
                .transition_in(
                    uow.as_mut(),
                    &mut outbox,
                    &mut workflow,
                    WorkflowState::Timeout,
                    serde_json::json!({
                        "reason": "approval expired with no response",
                        "approvalId": approval.id.to_string(),
                    }),
                )
                .await?;
        }

        record(
            uow.as_mut(),
            &mut outbox,
            FlowEventData::ApprovalTimeout {
                approval_id: approval.id,
                workflow_id: approval.workflow_id,
            },
        )
        .await?;

        uow.commit().await?;
        self.bus.publish_all(outbox.drain()).await?;

        counter!(names::DECISIONS_TOTAL, labels::DECISION => "timeout").increment(1);
        tracing::warn!(
            approval_id = %approval.id,
            workflow_id = %approval.workflow_id,
            "approval timed out"
        );
        Ok(Some(approval))
    }

    /// Admin-only: reopens a rejected approval.
    ///
    /// Resets the approval to PENDING (clearing the decision), resets its
    /// owning step to `pending` while keeping the approval link (so the
    /// executor re-enters the wait without minting a duplicate), and
    /// transitions the workflow `REJECTED -> RUNNING`. Publishes
    /// `workflow.rollback_requested` after commit; the executor resumes
    /// from that event.
    ///
    /// Completed work is never unwound: a workflow that reached
    /// `COMPLETED` cannot be reopened, and previously completed steps
    /// keep their status.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] unless the approval is `REJECTED`.
    /// - [`Error::ApprovalExpired`] when the approval already expired.
    /// - Transition errors (e.g. the workflow is not `REJECTED`).
    pub async fn rollback(&self, approval_id: ApprovalId) -> Result<Approval> {
        let mut uow = self.store.begin().await?;
        let mut outbox = Outbox::new();

        let Some(mut approval) = uow.lock_approval(approval_id).await? else {
            return Err(Error::ApprovalNotFound { approval_id });
        };

        if approval.status != ApprovalStatus::Rejected {
            return Err(Error::validation(format!(
                "only rejected approvals can be rolled back; status is {}",
                approval.status
            )));
        }
        let now = Utc::now();
        if approval.is_expired(now) {
            return Err(Error::ApprovalExpired {
                approval_id: approval.id,
                expired_at: approval.expires_at,
            });
        }

        approval.status = ApprovalStatus::Pending;
        approval.decision = None;
        approval.response_data = None;
        approval.responded_at = None;
        uow.update_approval(&approval).await?;

        if let Some(mut step) = uow.step_by_approval(approval_id).await? {
            step.status = StepStatus::Pending;
            step.task_output = None;
            step.completed_at = None;
            step.started_at = None;
            uow.update_step(&step).await?;
        }

        let mut workflow = uow
            .workflow(approval.workflow_id)
            .await?
            .ok_or(Error::WorkflowNotFound {
                workflow_id: approval.workflow_id,
            })?;
        self.machine
            .transition_in(
                uow.as_mut(),
                &mut outbox,
                &mut workflow,
                WorkflowState::Running,
                serde_json::json!({
                    "reason": "rollback",
                    "approvalId": approval.id.to_string(),
                }),
            )
            .await?;

        record(
            uow.as_mut(),
            &mut outbox,
            FlowEventData::WorkflowRollbackRequested {
                workflow_id: approval.workflow_id,
                approval_id: approval.id,
            },
        )
        .await?;

        uow.commit().await?;
        self.bus.publish_all(outbox.drain()).await?;

        tracing::info!(
            approval_id = %approval.id,
            workflow_id = %approval.workflow_id,
            "approval rolled back to pending"
        );
        Ok(approval)
    }
}
