//! Lifecycle events for workflows, steps, and approvals.
//!
//! Two closely related shapes live here:
//!
//! - [`FlowEvent`]: the envelope delivered through the in-process event
//!   bus. Carries a ULID identifier (lexicographically sortable, so event
//!   IDs order chronologically), the event kind, and a typed payload.
//! - [`WorkflowEventRecord`]: the append-only audit row persisted per
//!   workflow. The per-workflow `sequence` is dense from 1 and is the
//!   authoritative history for replay and debugging.
//!
//! Events are modeled as a tagged variant ([`FlowEventData`]) so handlers
//! dispatch on one enum rather than downcasting heterogeneous payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use ulid::Ulid;

use signoff_core::{ApprovalId, StepId, WorkflowId};

use crate::approval::Decision;
use crate::step::StepKind;
use crate::workflow::WorkflowState;

/// The canonical set of event kinds published by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A workflow row was inserted.
    #[serde(rename = "workflow.created")]
    WorkflowCreated,
    /// A workflow moved between states.
    #[serde(rename = "workflow.state_changed")]
    WorkflowStateChanged,
    /// A workflow reached `COMPLETED`.
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted,
    /// A workflow reached `FAILED`.
    #[serde(rename = "workflow.failed")]
    WorkflowFailed,
    /// An operator rolled a rejected workflow back to `RUNNING`.
    #[serde(rename = "workflow.rollback_requested")]
    WorkflowRollbackRequested,
    /// An approval was created and is awaiting a decision.
    #[serde(rename = "approval.requested")]
    ApprovalRequested,
    /// A decision was recorded for an approval.
    #[serde(rename = "approval.received")]
    ApprovalReceived,
    /// An approval expired before any decision arrived.
    #[serde(rename = "approval.timeout")]
    ApprovalTimeout,
    /// A step began executing.
    #[serde(rename = "step.started")]
    StepStarted,
    /// A step finished successfully.
    #[serde(rename = "step.completed")]
    StepCompleted,
    /// A step finished with an error or a rejected approval.
    #[serde(rename = "step.failed")]
    StepFailed,
}

impl EventKind {
    /// Returns the canonical dotted name of this kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowCreated => "workflow.created",
            Self::WorkflowStateChanged => "workflow.state_changed",
            Self::WorkflowCompleted => "workflow.completed",
            Self::WorkflowFailed => "workflow.failed",
            Self::WorkflowRollbackRequested => "workflow.rollback_requested",
            Self::ApprovalRequested => "approval.requested",
            Self::ApprovalReceived => "approval.received",
            Self::ApprovalTimeout => "approval.timeout",
            Self::StepStarted => "step.started",
            Self::StepCompleted => "step.completed",
            Self::StepFailed => "step.failed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "workflow.created" => Ok(Self::WorkflowCreated),
            "workflow.state_changed" => Ok(Self::WorkflowStateChanged),
            "workflow.completed" => Ok(Self::WorkflowCompleted),
            "workflow.failed" => Ok(Self::WorkflowFailed),
            "workflow.rollback_requested" => Ok(Self::WorkflowRollbackRequested),
            "approval.requested" => Ok(Self::ApprovalRequested),
            "approval.received" => Ok(Self::ApprovalReceived),
            "approval.timeout" => Ok(Self::ApprovalTimeout),
            "step.started" => Ok(Self::StepStarted),
            "step.completed" => Ok(Self::StepCompleted),
            "step.failed" => Ok(Self::StepFailed),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// Typed event payloads, tagged by kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FlowEventData {
    /// A workflow row was inserted.
    #[serde(rename_all = "camelCase")]
    WorkflowCreated {
        /// The new workflow.
        workflow_id: WorkflowId,
        /// Its caller-supplied type.
        workflow_type: String,
        /// Whether it carries an explicit step pipeline.
        is_multi_step: bool,
    },

    /// A workflow moved between states.
    #[serde(rename_all = "camelCase")]
    WorkflowStateChanged {
        /// The workflow that moved.
        workflow_id: WorkflowId,
        /// The state it left.
        from: WorkflowState,
        /// The state it entered.
        to: WorkflowState,
        /// Caller-supplied transition payload.
        payload: JsonValue,
    },

    /// A workflow reached `COMPLETED`.
    #[serde(rename_all = "camelCase")]
    WorkflowCompleted {
        /// The completed workflow.
        workflow_id: WorkflowId,
        /// Result data recorded at completion.
        result: JsonValue,
    },

    /// A workflow reached `FAILED`.
    #[serde(rename_all = "camelCase")]
    WorkflowFailed {
        /// The failed workflow.
        workflow_id: WorkflowId,
        /// Human-readable reason.
        error: String,
    },

    /// An operator rolled a rejected workflow back to `RUNNING`.
    #[serde(rename_all = "camelCase")]
    WorkflowRollbackRequested {
        /// The workflow being reopened.
        workflow_id: WorkflowId,
        /// The approval that was reset to pending.
        approval_id: ApprovalId,
    },

    /// An approval was created and is awaiting a decision.
    #[serde(rename_all = "camelCase")]
    ApprovalRequested {
        /// The new approval.
        approval_id: ApprovalId,
        /// Its owning workflow.
        workflow_id: WorkflowId,
        /// When it expires.
        expires_at: DateTime<Utc>,
    },

    /// A decision was recorded for an approval.
    #[serde(rename_all = "camelCase")]
    ApprovalReceived {
        /// The decided approval.
        approval_id: ApprovalId,
        /// Its owning workflow.
        workflow_id: WorkflowId,
        /// The decision.
        decision: Decision,
        /// Captured form values.
        response_data: JsonValue,
    },

    /// An approval expired before any decision arrived.
    #[serde(rename_all = "camelCase")]
    ApprovalTimeout {
        /// The expired approval.
        approval_id: ApprovalId,
        /// Its owning workflow.
        workflow_id: WorkflowId,
    },

    /// A step began executing.
    #[serde(rename_all = "camelCase")]
    StepStarted {
        /// The owning workflow.
        workflow_id: WorkflowId,
        /// The step.
        step_id: StepId,
        /// Its position.
        step_index: u32,
        /// Task or approval.
        step_kind: StepKind,
    },

    /// A step finished successfully.
    #[serde(rename_all = "camelCase")]
    StepCompleted {
        /// The owning workflow.
        workflow_id: WorkflowId,
        /// The step.
        step_id: StepId,
        /// Its position.
        step_index: u32,
        /// Handler output or captured decision data.
        output: JsonValue,
    },

    /// A step finished with an error or a rejected approval.
    #[serde(rename_all = "camelCase")]
    StepFailed {
        /// The owning workflow.
        workflow_id: WorkflowId,
        /// The step.
        step_id: StepId,
        /// Its position.
        step_index: u32,
        /// The failure message.
        error: String,
    },
}

impl FlowEventData {
    /// Returns the kind tag of this payload.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::WorkflowCreated { .. } => EventKind::WorkflowCreated,
            Self::WorkflowStateChanged { .. } => EventKind::WorkflowStateChanged,
            Self::WorkflowCompleted { .. } => EventKind::WorkflowCompleted,
            Self::WorkflowFailed { .. } => EventKind::WorkflowFailed,
            Self::WorkflowRollbackRequested { .. } => EventKind::WorkflowRollbackRequested,
            Self::ApprovalRequested { .. } => EventKind::ApprovalRequested,
            Self::ApprovalReceived { .. } => EventKind::ApprovalReceived,
            Self::ApprovalTimeout { .. } => EventKind::ApprovalTimeout,
            Self::StepStarted { .. } => EventKind::StepStarted,
            Self::StepCompleted { .. } => EventKind::StepCompleted,
            Self::StepFailed { .. } => EventKind::StepFailed,
        }
    }

    /// Returns the workflow this payload concerns.
    #[must_use]
    pub const fn workflow_id(&self) -> WorkflowId {
        match self {
            Self::WorkflowCreated { workflow_id, .. }
            | Self::WorkflowStateChanged { workflow_id, .. }
            | Self::WorkflowCompleted { workflow_id, .. }
            | Self::WorkflowFailed { workflow_id, .. }
            | Self::WorkflowRollbackRequested { workflow_id, .. }
            | Self::ApprovalRequested { workflow_id, .. }
            | Self::ApprovalReceived { workflow_id, .. }
            | Self::ApprovalTimeout { workflow_id, .. }
            | Self::StepStarted { workflow_id, .. }
            | Self::StepCompleted { workflow_id, .. }
            | Self::StepFailed { workflow_id, .. } => *workflow_id,
        }
    }
}

/// The envelope delivered through the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEvent {
    /// Unique event identifier (ULID; sorts chronologically).
    pub id: String,

    /// Event kind, duplicated from the payload tag for cheap routing.
    pub kind: EventKind,

    /// When the event was emitted.
    pub occurred_at: DateTime<Utc>,

    /// The typed payload.
    pub data: FlowEventData,
}

impl FlowEvent {
    /// Creates an envelope with a fresh ID and the current timestamp.
    #[must_use]
    pub fn new(data: FlowEventData) -> Self {
        Self {
            id: Ulid::new().to_string(),
            kind: data.kind(),
            occurred_at: Utc::now(),
            data,
        }
    }

    /// Returns the workflow this event concerns.
    #[must_use]
    pub const fn workflow_id(&self) -> WorkflowId {
        self.data.workflow_id()
    }
}

/// One append-only audit row in a workflow's event history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEventRecord {
    /// Unique identifier (ULID).
    pub id: String,

    /// Owning workflow.
    pub workflow_id: WorkflowId,

    /// Event kind.
    pub event_type: EventKind,

    /// Serialized payload.
    pub payload: JsonValue,

    /// Per-workflow sequence number, dense from 1. Allocated under the
    /// workflow's write serialization, so it totally orders the history.
    pub sequence: u64,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_round_trip() {
        for kind in [
            EventKind::WorkflowCreated,
            EventKind::WorkflowStateChanged,
            EventKind::WorkflowCompleted,
            EventKind::WorkflowFailed,
            EventKind::WorkflowRollbackRequested,
            EventKind::ApprovalRequested,
            EventKind::ApprovalReceived,
            EventKind::ApprovalTimeout,
            EventKind::StepStarted,
            EventKind::StepCompleted,
            EventKind::StepFailed,
        ] {
            let parsed: EventKind = kind.as_str().parse().expect("parse");
            assert_eq!(kind, parsed);
        }
    }

    #[test]
    fn envelope_kind_matches_payload() {
        let workflow_id = WorkflowId::generate();
        let event = FlowEvent::new(FlowEventData::WorkflowCompleted {
            workflow_id,
            result: serde_json::json!({"ok": true}),
        });

        assert_eq!(event.kind, EventKind::WorkflowCompleted);
        assert_eq!(event.workflow_id(), workflow_id);
    }

    #[test]
    fn envelope_ids_sort_chronologically() {
        let first = FlowEvent::new(FlowEventData::ApprovalTimeout {
            approval_id: ApprovalId::generate(),
            workflow_id: WorkflowId::generate(),
        });
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = FlowEvent::new(FlowEventData::ApprovalTimeout {
            approval_id: ApprovalId::generate(),
            workflow_id: WorkflowId::generate(),
        });
        assert!(first.id < second.id);
    }

    #[test]
    fn state_change_payload_serializes_with_kind_tag() {
        let data = FlowEventData::WorkflowStateChanged {
            workflow_id: WorkflowId::generate(),
            from: WorkflowState::Running,
            to: WorkflowState::WaitingApproval,
            payload: serde_json::json!({"reason": "approval requested"}),
        };
        let json = serde_json::to_value(&data).expect("serialize");
        assert_eq!(json["kind"], "workflowStateChanged");
        assert_eq!(json["from"], "RUNNING");
        assert_eq!(json["to"], "WAITING_APPROVAL");
    }
}
