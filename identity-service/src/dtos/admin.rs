use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

use crate::models::{ApprovalResponse, ApprovalStatus, AuthorityLevel, Decision, UserProfile};

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    #[validate(email(message = "Invalid email format"))]
    #[schema(example = "new.user@example.com")]
    pub email: String,

    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    #[schema(example = "s3cretpass", min_length = 8)]
    pub password: String,

    #[validate(length(min = 1, max = 64, message = "Display name must be 1-64 characters"))]
    #[schema(example = "New User")]
    pub display_name: String,

    #[schema(example = "123456789012345678")]
    pub discord_id: Option<String>,

    #[serde(default = "default_authority")]
    #[schema(value_type = i16, example = 0)]
    pub authority_level: AuthorityLevel,

    #[serde(default)]
    #[schema(example = json!(["mail:admin"]))]
    pub permissions: Vec<String>,
}

fn default_authority() -> AuthorityLevel {
    AuthorityLevel::User
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserResponse {
    pub user: UserProfile,
    /// False when the mail-system account could not be created.
    pub provisioning_ok: bool,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUserRequest {
    #[validate(email(message = "Invalid email format"))]
    pub email: Option<String>,

    #[validate(length(min = 1, max = 64, message = "Display name must be 1-64 characters"))]
    pub display_name: Option<String>,

    #[serde(default, deserialize_with = "super::double_option")]
    #[schema(value_type = Option<String>)]
    pub discord_id: Option<Option<String>>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SetAuthorityRequest {
    #[schema(value_type = i16, example = 3)]
    pub authority_level: AuthorityLevel,

    /// Required when the change needs a second approver.
    #[serde(default)]
    #[validate(length(max = 500, message = "Reason must be at most 500 characters"))]
    pub reason: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct SetPermissionsRequest {
    #[schema(example = json!(["mail:admin", "audit:read"]))]
    pub permissions: Vec<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct SetEnabledRequest {
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ReasonRequest {
    #[validate(length(min = 1, max = 500, message = "Reason must be 1-500 characters"))]
    #[schema(example = "Repeated policy violations")]
    pub reason: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateApprovalRequest {
    #[validate(length(min = 1, message = "Action type is required"))]
    #[schema(example = "suspend_user")]
    pub action_type: String,

    pub action_data: Option<Value>,

    pub target_user_id: Option<Uuid>,

    #[validate(length(min = 1, max = 500, message = "Reason must be 1-500 characters"))]
    pub reason: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct DecideApprovalRequest {
    pub decision: Decision,

    #[validate(length(max = 500, message = "Comment must be at most 500 characters"))]
    pub comment: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DecisionResponse {
    pub approval: ApprovalResponse,
    /// Present only when the approved action touched the mail system.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioning_ok: Option<bool>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ApprovalListQuery {
    /// Filter by status; all statuses when omitted.
    pub status: Option<ApprovalStatus>,
}

#[derive(Debug, Default, Deserialize, Validate, ToSchema)]
pub struct OptionalReasonRequest {
    /// Required only when the action needs a second approver.
    #[serde(default)]
    #[validate(length(max = 500, message = "Reason must be at most 500 characters"))]
    pub reason: String,
}
