//! Dead letters: events and workflows whose processing permanently failed.
//!
//! Entries are retained until an operator retries or deletes them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use signoff_core::{DeadLetterId, WorkflowId};

/// Event type recorded when a workflow exhausts its retry budget and is
/// abandoned by the timeout manager.
pub const WORKFLOW_ABANDONED: &str = "workflow.abandoned";

/// A permanently failed event or abandoned workflow, parked for operator
/// triage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Unique identifier.
    pub id: DeadLetterId,

    /// The original event type (or [`WORKFLOW_ABANDONED`]).
    pub event_type: String,

    /// Full serialized event payload at the time of failure.
    pub payload: JsonValue,

    /// The terminal error message.
    pub error: String,

    /// Delivery attempts consumed before giving up.
    pub retry_count: u32,

    /// Owning workflow, when the payload carried one.
    pub workflow_id: Option<WorkflowId>,

    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Creates a new dead-letter entry.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        payload: JsonValue,
        error: impl Into<String>,
        retry_count: u32,
        workflow_id: Option<WorkflowId>,
    ) -> Self {
        Self {
            id: DeadLetterId::generate(),
            event_type: event_type.into(),
            payload,
            error: error.into(),
            retry_count,
            workflow_id,
            created_at: Utc::now(),
        }
    }
}
