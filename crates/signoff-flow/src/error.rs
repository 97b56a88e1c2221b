//! Error types for the orchestration domain.

use signoff_core::{ApprovalId, StepId, WorkflowId};

use crate::approval::ApprovalStatus;
use crate::workflow::WorkflowState;

/// The result type used throughout signoff-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Input failed validation (bad request shape, unknown decision value,
    /// response data not matching the UI schema). Surfaced to the caller;
    /// never retried.
    #[error("validation failed: {message}")]
    Validation {
        /// Description of the validation failure.
        message: String,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        /// The current state.
        from: WorkflowState,
        /// The attempted target state.
        to: WorkflowState,
    },

    /// The workflow row changed underneath an optimistic update. Recovered
    /// locally by the component that raised the operation; never surfaced
    /// to end users.
    #[error("workflow {workflow_id} was modified concurrently (expected version {expected_version})")]
    ConcurrentModification {
        /// The workflow that was concurrently modified.
        workflow_id: WorkflowId,
        /// The version the loser expected to observe.
        expected_version: u64,
    },

    /// A workflow was not found.
    #[error("workflow not found: {workflow_id}")]
    WorkflowNotFound {
        /// The workflow ID that was looked up.
        workflow_id: WorkflowId,
    },

    /// An approval was not found.
    #[error("approval not found: {approval_id}")]
    ApprovalNotFound {
        /// The approval ID that was looked up.
        approval_id: ApprovalId,
    },

    /// A step was not found.
    #[error("step not found: {step_id}")]
    StepNotFound {
        /// The step ID that was looked up.
        step_id: StepId,
    },

    /// A callback token failed verification, including the fail-closed
    /// path where no signing key is configured. Maps to HTTP 401.
    #[error("token invalid: {message}")]
    TokenInvalid {
        /// Description of the verification failure.
        message: String,
    },

    /// A decision arrived after the approval expired. Checked before the
    /// status so a late decision cannot race the timeout scanner. Maps to
    /// HTTP 410.
    #[error("approval {approval_id} expired at {expired_at}")]
    ApprovalExpired {
        /// The expired approval.
        approval_id: ApprovalId,
        /// When it expired.
        expired_at: chrono::DateTime<chrono::Utc>,
    },

    /// A decision arrived for an approval that is no longer pending. Maps
    /// to HTTP 409.
    #[error("approval {approval_id} already decided: {status}")]
    AlreadyDecided {
        /// The approval that already holds a decision.
        approval_id: ApprovalId,
        /// Its current status.
        status: ApprovalStatus,
    },

    /// No task handler is registered under the requested name. A permanent
    /// step failure.
    #[error("unknown task handler: {handler}")]
    UnknownHandler {
        /// The handler name that was not found.
        handler: String,
    },

    /// A task handler raised. Marks the step failed and the workflow
    /// FAILED; the workflow-level retry mechanism may try again.
    #[error("task handler '{handler}' failed: {message}")]
    HandlerFailure {
        /// The handler that failed.
        handler: String,
        /// The failure message.
        message: String,
    },

    /// The event bus is shut down and no longer accepts publishes.
    #[error("event bus is closed")]
    BusClosed,

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Configuration is missing or invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },
}

impl Error {
    /// Creates a new validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new token-invalid error.
    #[must_use]
    pub fn token_invalid(message: impl Into<String>) -> Self {
        Self::TokenInvalid {
            message: message.into(),
        }
    }

    /// Returns true for conflicts that the caller recovers from locally by
    /// letting the winning writer proceed.
    #[must_use]
    pub const fn is_concurrent_modification(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }
}

impl From<signoff_core::Error> for Error {
    fn from(err: signoff_core::Error) -> Self {
        match err {
            signoff_core::Error::TokenInvalid { message } => Self::TokenInvalid { message },
            signoff_core::Error::InvalidId { message } => Self::Validation { message },
            signoff_core::Error::InvalidInput(message) => Self::Validation { message },
            signoff_core::Error::Internal { message } => Self::Storage {
                message,
                source: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_error_display_names_both_states() {
        let err = Error::InvalidTransition {
            from: WorkflowState::Completed,
            to: WorkflowState::Running,
        };
        let msg = err.to_string();
        assert!(msg.contains("COMPLETED"));
        assert!(msg.contains("RUNNING"));
    }

    #[test]
    fn concurrent_modification_is_classified() {
        let err = Error::ConcurrentModification {
            workflow_id: WorkflowId::generate(),
            expected_version: 3,
        };
        assert!(err.is_concurrent_modification());
        assert!(!Error::BusClosed.is_concurrent_modification());
    }

    #[test]
    fn core_token_errors_map_to_token_invalid() {
        let core = signoff_core::Error::token_invalid("bad signature");
        let err: Error = core.into();
        assert!(matches!(err, Error::TokenInvalid { .. }));
    }
}
