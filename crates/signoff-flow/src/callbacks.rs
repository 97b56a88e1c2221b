//! Decision-callback intake contract.
//!
//! The HTTP facade is an external collaborator; this module is the named
//! interface it calls for `POST /callbacks/{token}`. Outcomes map onto
//! distinct statuses:
//!
//! | Outcome | Status |
//! |---|---|
//! | decision accepted | 200 |
//! | token MAC invalid or no signing key | 401 |
//! | already decided | 409 |
//! | expired (always checked before 409) | 410 |
//! | decision value outside the permitted set | 422 |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::approval::{Approval, ApprovalStatus, Decision, UiSchema};
use crate::approvals::ApprovalService;
use crate::error::Error;

/// Response shape for approval creation: the caller gets the raw token
/// exactly once, here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalCreated {
    /// The new approval.
    pub id: String,
    /// The signed callback token.
    pub callback_token: String,
    /// When the approval expires.
    pub expires_at: DateTime<Utc>,
}

impl From<&Approval> for ApprovalCreated {
    fn from(approval: &Approval) -> Self {
        Self {
            id: approval.id.to_string(),
            callback_token: approval.callback_token.clone(),
            expires_at: approval.expires_at,
        }
    }
}

/// Read shape for approvals: the stored record minus the raw token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalView {
    /// The approval.
    pub id: String,
    /// Its owning workflow.
    pub workflow_id: String,
    /// Its owning step, if created by a pipeline step.
    pub step_id: Option<String>,
    /// The form to render.
    pub ui_schema: UiSchema,
    /// Current status.
    pub status: ApprovalStatus,
    /// When the approval was requested.
    pub requested_at: DateTime<Utc>,
    /// When it expires.
    pub expires_at: DateTime<Utc>,
    /// When a decision (or timeout) was recorded.
    pub responded_at: Option<DateTime<Utc>>,
    /// The recorded decision.
    pub decision: Option<Decision>,
    /// Captured form values.
    pub response_data: Option<JsonValue>,
}

impl From<&Approval> for ApprovalView {
    fn from(approval: &Approval) -> Self {
        Self {
            id: approval.id.to_string(),
            workflow_id: approval.workflow_id.to_string(),
            step_id: approval.step_id.map(|id| id.to_string()),
            ui_schema: approval.ui_schema.clone(),
            status: approval.status,
            requested_at: approval.requested_at,
            expires_at: approval.expires_at,
            responded_at: approval.responded_at,
            decision: approval.decision,
            response_data: approval.response_data.clone(),
        }
    }
}

/// Request body for `POST /callbacks/{token}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRequest {
    /// `approve` or `reject`.
    pub decision: String,
    /// Captured form values.
    #[serde(default)]
    pub response_data: JsonValue,
}

/// Response body for an accepted decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionAccepted {
    /// The decided approval.
    pub approval_id: String,
    /// Its owning workflow.
    pub workflow_id: String,
    /// The recorded decision.
    pub decision: Decision,
    /// When the decision was recorded.
    pub responded_at: Option<DateTime<Utc>>,
}

/// Error body for rejected callbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackRejection {
    /// Machine-readable error code.
    pub error: String,
    /// Human-readable message.
    pub message: String,
    /// Current approval status (for 409).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl CallbackRejection {
    /// Creates an "invalid token" rejection (401).
    #[must_use]
    pub fn invalid_token(message: impl Into<String>) -> Self {
        Self {
            error: "token_invalid".to_string(),
            message: message.into(),
            status: None,
        }
    }

    /// Creates an "already decided" rejection (409).
    #[must_use]
    pub fn already_decided(status: &str) -> Self {
        Self {
            error: "already_decided".to_string(),
            message: format!("approval already decided: {status}"),
            status: Some(status.to_string()),
        }
    }

    /// Creates an "expired" rejection (410).
    #[must_use]
    pub fn expired(expired_at: DateTime<Utc>) -> Self {
        Self {
            error: "approval_expired".to_string(),
            message: format!("approval expired at {expired_at}"),
            status: None,
        }
    }

    /// Creates a validation rejection (422).
    #[must_use]
    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self {
            error: "validation_failed".to_string(),
            message: message.into(),
            status: None,
        }
    }
}

/// Result of one callback submission.
#[derive(Debug, Clone)]
pub enum CallbackResult {
    /// Decision accepted (200 OK).
    Accepted(DecisionAccepted),
    /// Token rejected (401 Unauthorized).
    Unauthorized(CallbackRejection),
    /// Approval already decided (409 Conflict).
    Conflict(CallbackRejection),
    /// Approval expired (410 Gone).
    Gone(CallbackRejection),
    /// Request body rejected (422 Unprocessable Entity).
    UnprocessableEntity(CallbackRejection),
    /// Internal failure (500).
    InternalError(String),
}

impl CallbackResult {
    /// Returns the HTTP status code for this result.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Accepted(_) => 200,
            Self::Unauthorized(_) => 401,
            Self::Conflict(_) => 409,
            Self::Gone(_) => 410,
            Self::UnprocessableEntity(_) => 422,
            Self::InternalError(_) => 500,
        }
    }

    /// Returns true for an accepted decision.
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

/// The callback endpoint's entry into the kernel.
pub struct DecisionIntake {
    approvals: std::sync::Arc<ApprovalService>,
}

impl DecisionIntake {
    /// Creates the intake over the approval service.
    #[must_use]
    pub fn new(approvals: std::sync::Arc<ApprovalService>) -> Self {
        Self { approvals }
    }

    /// Handles one `POST /callbacks/{token}` submission.
    ///
    /// Token verification runs before body validation, so with no
    /// signing key configured every POST is a 401 regardless of body.
    pub async fn submit(&self, token: &str, request: DecisionRequest) -> CallbackResult {
        if let Err(Error::TokenInvalid { message }) = self.approvals.verify_token(token) {
            return CallbackResult::Unauthorized(CallbackRejection::invalid_token(message));
        }

        let decision = match Decision::parse(&request.decision) {
            Ok(decision) => decision,
            Err(err) => {
                return CallbackResult::UnprocessableEntity(CallbackRejection::unprocessable(
                    err.to_string(),
                ));
            }
        };

        match self
            .approvals
            .submit(token, decision, request.response_data)
            .await
        {
            Ok(approval) => CallbackResult::Accepted(DecisionAccepted {
                approval_id: approval.id.to_string(),
                workflow_id: approval.workflow_id.to_string(),
                decision,
                responded_at: approval.responded_at,
            }),
            Err(Error::TokenInvalid { message }) => {
                CallbackResult::Unauthorized(CallbackRejection::invalid_token(message))
            }
            Err(Error::ApprovalExpired { expired_at, .. }) => {
                CallbackResult::Gone(CallbackRejection::expired(expired_at))
            }
            Err(Error::AlreadyDecided { status, .. }) => {
                CallbackResult::Conflict(CallbackRejection::already_decided(status.as_str()))
            }
            Err(Error::Validation { message }) => {
                CallbackResult::UnprocessableEntity(CallbackRejection::unprocessable(message))
            }
            Err(err) => {
                tracing::error!(error = %err, "callback submission failed");
                CallbackResult::InternalError(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_the_contract() {
        let unauthorized =
            CallbackResult::Unauthorized(CallbackRejection::invalid_token("bad MAC"));
        assert_eq!(unauthorized.status_code(), 401);

        let conflict = CallbackResult::Conflict(CallbackRejection::already_decided("APPROVED"));
        assert_eq!(conflict.status_code(), 409);

        let gone = CallbackResult::Gone(CallbackRejection::expired(Utc::now()));
        assert_eq!(gone.status_code(), 410);

        let unprocessable =
            CallbackResult::UnprocessableEntity(CallbackRejection::unprocessable("bad decision"));
        assert_eq!(unprocessable.status_code(), 422);

        assert_eq!(CallbackResult::InternalError("boom".to_string()).status_code(), 500);
    }

    #[test]
    fn rejection_bodies_carry_machine_readable_codes() {
        let rejection = CallbackRejection::already_decided("REJECTED");
        assert_eq!(rejection.error, "already_decided");
        assert_eq!(rejection.status.as_deref(), Some("REJECTED"));

        let json = serde_json::to_value(&rejection).expect("serialize");
        assert_eq!(json["error"], "already_decided");
    }

    #[test]
    fn approval_view_omits_the_raw_token() {
        let approval = Approval {
            id: signoff_core::ApprovalId::generate(),
            workflow_id: signoff_core::WorkflowId::generate(),
            step_id: None,
            ui_schema: UiSchema::titled("Deploy?"),
            status: ApprovalStatus::Pending,
            requested_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            responded_at: None,
            decision: None,
            response_data: None,
            callback_token: "secret-token".to_string(),
        };

        let view = ApprovalView::from(&approval);
        let json = serde_json::to_string(&view).expect("serialize");
        assert!(!json.contains("secret-token"));
        assert!(json.contains("uiSchema"));

        let created = ApprovalCreated::from(&approval);
        assert_eq!(created.callback_token, "secret-token");
    }

    #[test]
    fn request_body_defaults_response_data() {
        let request: DecisionRequest =
            serde_json::from_str(r#"{"decision": "approve"}"#).expect("deserialize");
        assert_eq!(request.decision, "approve");
        assert!(request.response_data.is_null());
    }
}
