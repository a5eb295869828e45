use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::models::UserProfile;
use crate::services::{AccessClaims, AuthSession};

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    #[validate(email(message = "Invalid email format"))]
    #[schema(example = "user@example.com")]
    pub email: String,

    #[validate(length(min = 1, message = "Password is required"))]
    #[schema(example = "password123")]
    pub password: String,

    #[serde(default)]
    pub remember_me: bool,

    #[validate(length(min = 8, max = 256, message = "Device fingerprint must be 8-256 characters"))]
    #[schema(example = "b6f0c9a2d1e84f57")]
    pub device_fingerprint: Option<String>,

    #[validate(length(max = 100, message = "Device name must be at most 100 characters"))]
    #[schema(example = "Work laptop")]
    pub device_name: Option<String>,
}

/// Login result. `requires2FA` is set with a `challengeToken` when a second
/// factor must be verified at `/auth/2fa/verify`.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserProfile>,
    #[serde(rename = "requires2FA")]
    pub requires_2fa: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<uuid::Uuid>,
}

impl LoginResponse {
    pub fn authenticated(session: AuthSession) -> Self {
        Self {
            success: true,
            token: Some(session.token),
            user: Some(session.user),
            requires_2fa: false,
            challenge_token: None,
            expires_at: Some(session.expires_at),
            session_id: Some(session.session_id),
        }
    }

    pub fn second_factor_required(challenge: String, expires_at: DateTime<Utc>) -> Self {
        Self {
            success: false,
            token: None,
            user: None,
            requires_2fa: true,
            challenge_token: Some(challenge),
            expires_at: Some(expires_at),
            session_id: None,
        }
    }
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerifySecondFactorRequest {
    #[validate(length(min = 1, message = "Challenge token is required"))]
    pub challenge_token: String,

    #[validate(length(equal = 6, message = "Code must be 6 digits"))]
    #[schema(example = "123456")]
    pub code: Option<String>,

    #[validate(length(min = 8, max = 16, message = "Invalid recovery code format"))]
    #[schema(example = "ABCD-EFGH")]
    pub recovery_code: Option<String>,

    #[serde(default)]
    pub remember_device: bool,

    #[validate(length(max = 100, message = "Device name must be at most 100 characters"))]
    pub device_name: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub user: Option<AccessClaims>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionsRevokedResponse {
    #[schema(example = 2)]
    pub sessions_revoked: u64,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TwoFactorSetupResponse {
    #[schema(example = "JBSWY3DPEHPK3PXP")]
    pub secret: String,
    pub otpauth_url: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct TwoFactorCodeRequest {
    #[validate(length(equal = 6, message = "Code must be 6 digits"))]
    #[schema(example = "123456")]
    pub code: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryCodesResponse {
    /// Shown once; only hashes are stored.
    pub recovery_codes: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DevicesForgottenResponse {
    #[schema(example = 1)]
    pub devices_forgotten: u64,
}
