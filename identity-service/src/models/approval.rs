//! Approval request model - two-person rule for high-risk actions.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use utoipa::ToSchema;
use uuid::Uuid;

use super::authority::AuthorityLevel;

/// Approval lifecycle. `Pending` transitions exactly once to a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "denied" => Ok(ApprovalStatus::Denied),
            "expired" => Ok(ApprovalStatus::Expired),
            _ => Err(format!("Invalid approval status: {}", s)),
        }
    }
}

/// Approver's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Deny,
}

impl Decision {
    pub fn resulting_status(self) -> ApprovalStatus {
        match self {
            Decision::Approve => ApprovalStatus::Approved,
            Decision::Deny => ApprovalStatus::Denied,
        }
    }
}

/// The allow-list of actions that may enter the workflow, with their
/// action-specific payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalAction {
    DeleteUser,
    SuspendUser { reason: Option<String> },
    UnsuspendUser,
    EscalateAuthority { authority_level: AuthorityLevel },
    ResetTwoFactor,
}

impl ApprovalAction {
    pub const DELETE_USER: &'static str = "delete_user";
    pub const SUSPEND_USER: &'static str = "suspend_user";
    pub const UNSUSPEND_USER: &'static str = "unsuspend_user";
    pub const ESCALATE_AUTHORITY: &'static str = "escalate_authority";
    pub const RESET_2FA: &'static str = "reset_2fa";

    pub fn action_type(&self) -> &'static str {
        match self {
            ApprovalAction::DeleteUser => Self::DELETE_USER,
            ApprovalAction::SuspendUser { .. } => Self::SUSPEND_USER,
            ApprovalAction::UnsuspendUser => Self::UNSUSPEND_USER,
            ApprovalAction::EscalateAuthority { .. } => Self::ESCALATE_AUTHORITY,
            ApprovalAction::ResetTwoFactor => Self::RESET_2FA,
        }
    }

    /// Structured payload as stored alongside the action type.
    pub fn action_data(&self) -> Option<Value> {
        match self {
            ApprovalAction::SuspendUser { reason: Some(reason) } => {
                Some(json!({ "reason": reason }))
            }
            ApprovalAction::EscalateAuthority { authority_level } => {
                Some(json!({ "authorityLevel": authority_level }))
            }
            _ => None,
        }
    }

    /// Decode an action type plus payload, rejecting anything outside the
    /// allow-list or with a malformed payload.
    pub fn parse(action_type: &str, action_data: Option<&Value>) -> Result<Self, String> {
        match action_type {
            Self::DELETE_USER => Ok(ApprovalAction::DeleteUser),
            Self::SUSPEND_USER => {
                let reason = action_data
                    .and_then(|d| d.get("reason"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok(ApprovalAction::SuspendUser { reason })
            }
            Self::UNSUSPEND_USER => Ok(ApprovalAction::UnsuspendUser),
            Self::ESCALATE_AUTHORITY => {
                let level = action_data
                    .and_then(|d| d.get("authorityLevel"))
                    .ok_or_else(|| "escalate_authority requires authorityLevel".to_string())?;
                let authority_level: AuthorityLevel = serde_json::from_value(level.clone())
                    .map_err(|e| format!("Invalid authorityLevel: {}", e))?;
                Ok(ApprovalAction::EscalateAuthority { authority_level })
            }
            Self::RESET_2FA => Ok(ApprovalAction::ResetTwoFactor),
            other => Err(format!("Action type '{}' is not eligible for approval", other)),
        }
    }
}

impl fmt::Display for ApprovalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.action_type())
    }
}

/// Approval request entity.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub approval_id: Uuid,
    pub requester_id: Uuid,
    pub approver_id: Option<Uuid>,
    pub action: ApprovalAction,
    pub target_user_id: Option<Uuid>,
    pub reason: String,
    pub status: ApprovalStatus,
    pub expires_utc: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
    pub resolved_utc: Option<DateTime<Utc>>,
    pub approver_comment: Option<String>,
}

impl ApprovalRequest {
    /// Create a new pending request expiring `ttl` from now.
    pub fn new(
        requester_id: Uuid,
        action: ApprovalAction,
        target_user_id: Option<Uuid>,
        reason: String,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            approval_id: Uuid::new_v4(),
            requester_id,
            approver_id: None,
            action,
            target_user_id,
            reason,
            status: ApprovalStatus::Pending,
            expires_utc: now + ttl,
            created_utc: now,
            resolved_utc: None,
            approver_comment: None,
        }
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == ApprovalStatus::Pending && now > self.expires_utc
    }
}

/// Approval response for API.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResponse {
    pub approval_id: Uuid,
    pub requester_id: Uuid,
    pub approver_id: Option<Uuid>,
    pub action_type: String,
    pub action_data: Option<Value>,
    pub target_user_id: Option<Uuid>,
    pub reason: String,
    pub status: ApprovalStatus,
    pub expires_utc: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
    pub resolved_utc: Option<DateTime<Utc>>,
    pub approver_comment: Option<String>,
}

impl From<&ApprovalRequest> for ApprovalResponse {
    fn from(a: &ApprovalRequest) -> Self {
        Self {
            approval_id: a.approval_id,
            requester_id: a.requester_id,
            approver_id: a.approver_id,
            action_type: a.action.action_type().to_string(),
            action_data: a.action.action_data(),
            target_user_id: a.target_user_id,
            reason: a.reason.clone(),
            status: a.status,
            expires_utc: a.expires_utc,
            created_utc: a.created_utc,
            resolved_utc: a.resolved_utc,
            approver_comment: a.approver_comment.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_actions_outside_allow_list() {
        let err = ApprovalAction::parse("grant_permission", None).unwrap_err();
        assert!(err.contains("not eligible"));
    }

    #[test]
    fn test_parse_escalation_requires_level() {
        assert!(ApprovalAction::parse("escalate_authority", None).is_err());
        assert!(ApprovalAction::parse(
            "escalate_authority",
            Some(&json!({ "authorityLevel": 12 }))
        )
        .is_err());

        let action =
            ApprovalAction::parse("escalate_authority", Some(&json!({ "authorityLevel": 3 })))
                .unwrap();
        assert_eq!(
            action,
            ApprovalAction::EscalateAuthority {
                authority_level: AuthorityLevel::Admin
            }
        );
        assert_eq!(action.action_data(), Some(json!({ "authorityLevel": 3 })));
    }

    #[test]
    fn test_suspend_reason_is_optional() {
        assert_eq!(
            ApprovalAction::parse("suspend_user", None).unwrap(),
            ApprovalAction::SuspendUser { reason: None }
        );
        let action =
            ApprovalAction::parse("suspend_user", Some(&json!({ "reason": "abuse" }))).unwrap();
        assert_eq!(action.action_data(), Some(json!({ "reason": "abuse" })));
    }

    #[test]
    fn test_new_request_expires_after_ttl() {
        let req = ApprovalRequest::new(
            Uuid::new_v4(),
            ApprovalAction::DeleteUser,
            Some(Uuid::new_v4()),
            "offboarding".to_string(),
            Duration::hours(24),
        );
        assert_eq!(req.status, ApprovalStatus::Pending);
        assert_eq!(req.expires_utc - req.created_utc, Duration::hours(24));
        assert!(!req.is_overdue(Utc::now()));
        assert!(req.is_overdue(Utc::now() + Duration::hours(25)));
    }
}
