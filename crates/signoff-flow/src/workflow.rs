//! Workflow tracking and the workflow state table.
//!
//! A workflow is the durable unit of orchestration, capturing:
//!
//! - **Identity**: Unique ID and a caller-supplied `workflow_type`
//! - **Context**: Arbitrary JSON carried through the lifecycle
//! - **State**: Current position in the state machine
//! - **Version**: Monotonic counter bumped on every persisted mutation,
//!   the optimistic concurrency guard

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use signoff_core::WorkflowId;

/// Default retry budget for workflows that time out or fail.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// The state of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    /// Created but not yet picked up by the executor.
    Created,

    /// Executing machine steps.
    Running,

    /// Paused on a pending human approval.
    WaitingApproval,

    /// The pending approval was approved; the executor resumes next.
    Approved,

    /// An approval was rejected. Terminal except via explicit rollback.
    Rejected,

    /// A pending approval expired. Terminal except via retry.
    Timeout,

    /// All work finished. Terminal, no rollback.
    Completed,

    /// A step or handler failed. Terminal except via retry.
    Failed,
}

impl WorkflowState {
    /// Returns the canonical wire name of this state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::WaitingApproval => "WAITING_APPROVAL",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Timeout => "TIMEOUT",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Returns true if this state is terminal.
    ///
    /// Terminal states are absorbing except via the explicit rollback
    /// (`REJECTED`) and retry (`TIMEOUT`, `FAILED`) operations. `COMPLETED`
    /// has no exit at all.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Rejected | Self::Failed | Self::Timeout
        )
    }

    /// Returns true when the `self -> to` edge is in the transition table.
    ///
    /// The table, including the `RUNNING -> RUNNING` self-edge used for
    /// multi-step advancement between approvals:
    ///
    /// ```text
    /// CREATED          -> RUNNING | FAILED
    /// RUNNING          -> WAITING_APPROVAL | RUNNING | COMPLETED | FAILED
    /// WAITING_APPROVAL -> APPROVED | REJECTED | TIMEOUT
    /// APPROVED         -> RUNNING | COMPLETED
    /// REJECTED         -> RUNNING            (explicit rollback only)
    /// TIMEOUT          -> RUNNING            (retry only)
    /// FAILED           -> RUNNING            (retry only)
    /// COMPLETED        -> (none)
    /// ```
    #[must_use]
    pub const fn can_transition_to(&self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Created, Self::Running | Self::Failed)
                | (
                    Self::Running,
                    Self::WaitingApproval | Self::Running | Self::Completed | Self::Failed
                )
                | (
                    Self::WaitingApproval,
                    Self::Approved | Self::Rejected | Self::Timeout
                )
                | (Self::Approved, Self::Running | Self::Completed)
                | (Self::Rejected | Self::Timeout | Self::Failed, Self::Running)
        )
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "RUNNING" => Ok(Self::Running),
            "WAITING_APPROVAL" => Ok(Self::WaitingApproval),
            "APPROVED" => Ok(Self::Approved),
            "REJECTED" => Ok(Self::Rejected),
            "TIMEOUT" => Ok(Self::Timeout),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown workflow state: {other}")),
        }
    }
}

/// A durable orchestration unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique identifier.
    pub id: WorkflowId,

    /// Caller-supplied classification, e.g. `deployment`.
    pub workflow_type: String,

    /// Arbitrary JSON context carried through the lifecycle.
    pub context: JsonValue,

    /// Current state.
    pub state: WorkflowState,

    /// Optimistic concurrency guard. Strictly increases by one on every
    /// persisted mutation; starts at 1 on insert.
    pub version: u64,

    /// Retries consumed so far.
    pub retry_count: u32,

    /// Retry budget.
    pub max_retries: u32,

    /// Whether this workflow carries an explicit step pipeline.
    pub is_multi_step: bool,

    /// Deduplication key, unique within `workflow_type`.
    pub idempotency_key: Option<String>,

    /// When the workflow was created.
    pub created_at: DateTime<Utc>,

    /// When the workflow row was last mutated.
    pub updated_at: DateTime<Utc>,

    /// When the last retry was initiated (if any).
    pub last_retry_at: Option<DateTime<Utc>>,
}

impl Workflow {
    /// Creates a new workflow in `CREATED` at version 1.
    #[must_use]
    pub fn new(workflow_type: impl Into<String>, context: JsonValue) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::generate(),
            workflow_type: workflow_type.into(),
            context,
            state: WorkflowState::Created,
            version: 1,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            is_multi_step: false,
            idempotency_key: None,
            created_at: now,
            updated_at: now,
            last_retry_at: None,
        }
    }

    /// Returns true if the workflow is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Returns true when the retry budget still has room.
    #[must_use]
    pub const fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [WorkflowState; 8] = [
        WorkflowState::Created,
        WorkflowState::Running,
        WorkflowState::WaitingApproval,
        WorkflowState::Approved,
        WorkflowState::Rejected,
        WorkflowState::Timeout,
        WorkflowState::Completed,
        WorkflowState::Failed,
    ];

    #[test]
    fn completed_has_no_outgoing_edges() {
        for to in ALL_STATES {
            assert!(
                !WorkflowState::Completed.can_transition_to(to),
                "COMPLETED -> {to} must be rejected"
            );
        }
    }

    #[test]
    fn terminal_states_only_reopen_to_running() {
        for from in [
            WorkflowState::Rejected,
            WorkflowState::Timeout,
            WorkflowState::Failed,
        ] {
            for to in ALL_STATES {
                let allowed = from.can_transition_to(to);
                assert_eq!(
                    allowed,
                    to == WorkflowState::Running,
                    "{from} -> {to} mismatch"
                );
            }
        }
    }

    #[test]
    fn running_self_edge_is_allowed() {
        assert!(WorkflowState::Running.can_transition_to(WorkflowState::Running));
    }

    #[test]
    fn waiting_approval_diverges_to_decision_states_only() {
        let from = WorkflowState::WaitingApproval;
        assert!(from.can_transition_to(WorkflowState::Approved));
        assert!(from.can_transition_to(WorkflowState::Rejected));
        assert!(from.can_transition_to(WorkflowState::Timeout));
        assert!(!from.can_transition_to(WorkflowState::Running));
        assert!(!from.can_transition_to(WorkflowState::Completed));
    }

    #[test]
    fn state_names_round_trip() {
        for state in ALL_STATES {
            let parsed: WorkflowState = state.as_str().parse().expect("parse");
            assert_eq!(state, parsed);
        }
    }

    #[test]
    fn states_serialize_as_screaming_snake_case() {
        let json = serde_json::to_string(&WorkflowState::WaitingApproval).expect("serialize");
        assert_eq!(json, "\"WAITING_APPROVAL\"");
    }

    #[test]
    fn new_workflow_starts_at_version_one() {
        let wf = Workflow::new("deployment", serde_json::json!({"env": "prod"}));
        assert_eq!(wf.version, 1);
        assert_eq!(wf.state, WorkflowState::Created);
        assert!(!wf.is_terminal());
        assert!(wf.has_retry_budget());
    }
}
