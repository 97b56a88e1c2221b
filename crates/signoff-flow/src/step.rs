//! Steps: the ordered units of work inside a multi-step workflow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use signoff_core::{ApprovalId, StepId, WorkflowId};

/// What kind of work a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// A synchronous task handler invocation.
    Task,
    /// A human approval gate.
    Approval,
}

impl StepKind {
    /// Returns the canonical wire name of this kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Approval => "approval",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "task" => Ok(Self::Task),
            "approval" => Ok(Self::Approval),
            other => Err(format!("unknown step kind: {other}")),
        }
    }
}

/// The execution status of a step.
///
/// A step transitions `pending -> running -> (completed | failed)`. At
/// most one step of a workflow is `running` at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet started.
    Pending,
    /// Currently executing (or awaiting its approval decision).
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error or a rejected approval.
    Failed,
}

impl StepStatus {
    /// Returns the canonical wire name of this status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

/// One ordered unit within a workflow.
///
/// Step indices are dense and unique per workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique identifier.
    pub id: StepId,

    /// Owning workflow.
    pub workflow_id: WorkflowId,

    /// 0-based position in the pipeline.
    pub step_index: u32,

    /// Task or approval.
    pub kind: StepKind,

    /// Current execution status.
    pub status: StepStatus,

    /// Registered handler name (task steps).
    pub task_handler: Option<String>,

    /// Handler input, or approval configuration for approval steps.
    pub task_input: Option<JsonValue>,

    /// Handler output or captured decision data.
    pub task_output: Option<JsonValue>,

    /// Back-reference to the approval created for this step.
    pub approval_id: Option<ApprovalId>,

    /// When execution started.
    pub started_at: Option<DateTime<Utc>>,

    /// When execution finished.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Step {
    /// Creates a pending step from a spec at the given position.
    #[must_use]
    pub fn from_spec(workflow_id: WorkflowId, step_index: u32, spec: &StepSpec) -> Self {
        Self {
            id: StepId::generate(),
            workflow_id,
            step_index,
            kind: spec.kind,
            status: StepStatus::Pending,
            task_handler: spec.handler.clone(),
            task_input: spec.input.clone(),
            task_output: None,
            approval_id: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Resets the step to `pending`, clearing execution metadata.
    ///
    /// Used when a retry resumes a workflow from its first failure point.
    /// Approval links are cleared so the next run mints a fresh approval.
    pub fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.task_output = None;
        self.approval_id = None;
        self.started_at = None;
        self.completed_at = None;
    }
}

/// Caller-facing description of one step in a workflow creation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Task or approval.
    #[serde(rename = "type")]
    pub kind: StepKind,

    /// Registered handler name (task steps only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,

    /// Handler input, or approval configuration
    /// (`{ui_schema, timeout_seconds}`) for approval steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<JsonValue>,
}

impl StepSpec {
    /// Creates a task step spec.
    #[must_use]
    pub fn task(handler: impl Into<String>, input: JsonValue) -> Self {
        Self {
            kind: StepKind::Task,
            handler: Some(handler.into()),
            input: Some(input),
        }
    }

    /// Creates an approval step spec.
    #[must_use]
    pub fn approval(input: JsonValue) -> Self {
        Self {
            kind: StepKind::Approval,
            handler: None,
            input: Some(input),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_from_spec_starts_pending() {
        let spec = StepSpec::task("validate", serde_json::json!({"target": "prod"}));
        let step = Step::from_spec(WorkflowId::generate(), 0, &spec);

        assert_eq!(step.status, StepStatus::Pending);
        assert_eq!(step.kind, StepKind::Task);
        assert_eq!(step.task_handler.as_deref(), Some("validate"));
        assert!(step.approval_id.is_none());
    }

    #[test]
    fn reset_clears_execution_metadata() {
        let spec = StepSpec::approval(serde_json::json!({"timeout_seconds": 60}));
        let mut step = Step::from_spec(WorkflowId::generate(), 1, &spec);
        step.status = StepStatus::Failed;
        step.approval_id = Some(ApprovalId::generate());
        step.task_output = Some(serde_json::json!({"decision": "rejected"}));
        step.started_at = Some(Utc::now());

        step.reset();

        assert_eq!(step.status, StepStatus::Pending);
        assert!(step.approval_id.is_none());
        assert!(step.task_output.is_none());
        assert!(step.started_at.is_none());
    }

    #[test]
    fn spec_deserializes_with_type_field() {
        let spec: StepSpec = serde_json::from_value(serde_json::json!({
            "type": "task",
            "handler": "deploy",
            "input": {"version": "v2.5.0"}
        }))
        .expect("deserialize");
        assert_eq!(spec.kind, StepKind::Task);
        assert_eq!(spec.handler.as_deref(), Some("deploy"));
    }
}
