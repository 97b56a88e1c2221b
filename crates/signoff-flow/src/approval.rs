//! Approvals: human-decision records with signed callbacks and expiry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use signoff_core::{ApprovalId, StepId, WorkflowId};

use crate::error::{Error, Result};

/// The status of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    /// Awaiting a human decision.
    Pending,
    /// Approved by a reviewer.
    Approved,
    /// Rejected by a reviewer.
    Rejected,
    /// Expired before any decision arrived.
    Timeout,
    /// Invalidated because the owning workflow failed or was retried.
    Cancelled,
}

impl ApprovalStatus {
    /// Returns the canonical wire name of this status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Returns true once a terminal status is reached. Terminal statuses
    /// are reached exactly once; only the explicit rollback operation
    /// reopens a decided approval.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "APPROVED" => Ok(Self::Approved),
            "REJECTED" => Ok(Self::Rejected),
            "TIMEOUT" => Ok(Self::Timeout),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unknown approval status: {other}")),
        }
    }
}

/// A reviewer's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// The reviewer approved.
    Approve,
    /// The reviewer rejected.
    Reject,
}

impl Decision {
    /// Returns the canonical wire name of this decision.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }

    /// Parses a decision from its wire name, rejecting anything outside
    /// the permitted set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for unknown values.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            other => Err(Error::validation(format!(
                "decision must be 'approve' or 'reject', got '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An option within a `select` UI field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiOption {
    /// The submitted value.
    pub value: String,
    /// Human-readable label. Falls back to the value when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// One input field in an approval form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiField {
    /// Field name, the key expected in `response_data`.
    pub name: String,
    /// Human-readable label.
    pub label: String,
    /// Field type (`text`, `textarea`, `select`, ...). Rendering is an
    /// adapter concern; the kernel only validates `select` options.
    #[serde(rename = "type")]
    pub field_type: String,
    /// Whether a value must be present in the response.
    #[serde(default)]
    pub required: bool,
    /// Permitted values for `select` fields.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<UiOption>,
}

/// One action button in an approval form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiButton {
    /// Action submitted when pressed (`approve` / `reject`).
    pub action: String,
    /// Human-readable label.
    pub label: String,
    /// Rendering hint (`primary`, `danger`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
}

/// The portable, schema-driven description of an approval form.
///
/// Rendering per channel (chat, dashboard, email) is an adapter concern;
/// the kernel stores the schema and validates responses against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiSchema {
    /// Form title.
    pub title: String,
    /// Form description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered input fields.
    #[serde(default)]
    pub fields: Vec<UiField>,
    /// Action buttons.
    #[serde(default = "UiSchema::default_buttons")]
    pub buttons: Vec<UiButton>,
}

impl UiSchema {
    /// Creates a minimal schema with the given title and the default
    /// approve/reject buttons.
    #[must_use]
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
            fields: Vec::new(),
            buttons: Self::default_buttons(),
        }
    }

    fn default_buttons() -> Vec<UiButton> {
        vec![
            UiButton {
                action: "approve".to_string(),
                label: "Approve".to_string(),
                style: Some("primary".to_string()),
            },
            UiButton {
                action: "reject".to_string(),
                label: "Reject".to_string(),
                style: Some("danger".to_string()),
            },
        ]
    }

    /// Validates captured response data against this schema.
    ///
    /// Required fields must be present and non-empty; `select` values must
    /// be among the declared options. Fields not declared in the schema
    /// pass through untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] naming the offending field.
    pub fn validate_response(&self, response_data: &JsonValue) -> Result<()> {
        for field in &self.fields {
            let value = response_data.get(&field.name);

            if field.required {
                let missing = match value {
                    None | Some(JsonValue::Null) => true,
                    Some(JsonValue::String(s)) => s.is_empty(),
                    Some(_) => false,
                };
                if missing {
                    return Err(Error::validation(format!(
                        "required field '{}' missing in response",
                        field.name
                    )));
                }
            }

            if field.field_type == "select" && !field.options.is_empty() {
                if let Some(JsonValue::String(value)) = value {
                    let permitted = field.options.iter().any(|opt| opt.value == *value);
                    if !permitted {
                        return Err(Error::validation(format!(
                            "value '{value}' not permitted for field '{}'",
                            field.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for UiSchema {
    fn default() -> Self {
        Self {
            title: "Approval Required".to_string(),
            description: Some("Please approve this workflow step".to_string()),
            fields: Vec::new(),
            buttons: Self::default_buttons(),
        }
    }
}

/// A human-decision record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    /// Unique identifier.
    pub id: ApprovalId,

    /// Owning workflow.
    pub workflow_id: WorkflowId,

    /// Owning step, for approvals created by a pipeline step.
    pub step_id: Option<StepId>,

    /// The form to render.
    pub ui_schema: UiSchema,

    /// Current status.
    pub status: ApprovalStatus,

    /// When the approval was requested.
    pub requested_at: DateTime<Utc>,

    /// Hard deadline; strictly greater than `requested_at`.
    pub expires_at: DateTime<Utc>,

    /// When a decision (or timeout) was recorded.
    pub responded_at: Option<DateTime<Utc>>,

    /// The recorded decision.
    pub decision: Option<Decision>,

    /// Captured form values.
    pub response_data: Option<JsonValue>,

    /// Opaque signed token for the decision callback. Uniquely indexed.
    pub callback_token: String,
}

impl Approval {
    /// Returns true once `now` has reached the expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Returns true once a terminal status has been reached.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema_with_fields() -> UiSchema {
        UiSchema {
            title: "Deploy?".to_string(),
            description: None,
            fields: vec![
                UiField {
                    name: "reviewer_name".to_string(),
                    label: "Reviewer".to_string(),
                    field_type: "text".to_string(),
                    required: true,
                    options: Vec::new(),
                },
                UiField {
                    name: "environment".to_string(),
                    label: "Environment".to_string(),
                    field_type: "select".to_string(),
                    required: false,
                    options: vec![
                        UiOption {
                            value: "staging".to_string(),
                            label: None,
                        },
                        UiOption {
                            value: "prod".to_string(),
                            label: Some("Production".to_string()),
                        },
                    ],
                },
            ],
            buttons: Vec::new(),
        }
    }

    #[test]
    fn decision_parse_rejects_unknown_values() {
        assert_eq!(Decision::parse("approve").unwrap(), Decision::Approve);
        assert_eq!(Decision::parse("reject").unwrap(), Decision::Reject);
        assert!(matches!(
            Decision::parse("maybe"),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn required_field_must_be_present_and_non_empty() {
        let schema = schema_with_fields();

        assert!(schema.validate_response(&json!({})).is_err());
        assert!(schema
            .validate_response(&json!({"reviewer_name": ""}))
            .is_err());
        assert!(schema
            .validate_response(&json!({"reviewer_name": null}))
            .is_err());
        assert!(schema
            .validate_response(&json!({"reviewer_name": "alice"}))
            .is_ok());
    }

    #[test]
    fn select_values_must_be_among_options() {
        let schema = schema_with_fields();

        let ok = json!({"reviewer_name": "alice", "environment": "prod"});
        assert!(schema.validate_response(&ok).is_ok());

        let bad = json!({"reviewer_name": "alice", "environment": "sandbox"});
        let err = schema.validate_response(&bad).expect_err("must fail");
        assert!(err.to_string().contains("environment"));
    }

    #[test]
    fn undeclared_fields_pass_through() {
        let schema = schema_with_fields();
        let data = json!({"reviewer_name": "alice", "comment": "ship it"});
        assert!(schema.validate_response(&data).is_ok());
    }

    #[test]
    fn default_schema_carries_approve_and_reject_buttons() {
        let schema = UiSchema::default();
        let actions: Vec<_> = schema.buttons.iter().map(|b| b.action.as_str()).collect();
        assert_eq!(actions, vec!["approve", "reject"]);
    }

    #[test]
    fn pending_is_the_only_non_terminal_status() {
        assert!(!ApprovalStatus::Pending.is_terminal());
        for status in [
            ApprovalStatus::Approved,
            ApprovalStatus::Rejected,
            ApprovalStatus::Timeout,
            ApprovalStatus::Cancelled,
        ] {
            assert!(status.is_terminal());
        }
    }
}
