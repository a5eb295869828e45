//! Audit log model - append-only security event trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audit action tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    LoginFailed,
    #[serde(rename = "LOGIN_2FA_REQUIRED")]
    Login2faRequired,
    #[serde(rename = "LOGIN_2FA_DEVICE_BYPASS")]
    Login2faDeviceBypass,
    LoginSuccess,
    SecondFactorFailed,
    RecoveryCodeUsed,
    RecoveryCodeFailed,
    TokenRejected,
    Logout,
    LogoutAll,
    SessionRevoked,
    SessionsSwept,
    DeviceRemembered,
    DeviceForgotten,
    TwoFactorEnabled,
    TwoFactorDisabled,
    TwoFactorReset,
    RecoveryCodesRegenerated,
    UserCreated,
    UserUpdated,
    UserDeleted,
    UserSuspended,
    UserUnsuspended,
    AuthorityChanged,
    PermissionsChanged,
    PasswordChanged,
    ApprovalRequested,
    ApprovalApproved,
    ApprovalDenied,
    ApprovalExpired,
    ApprovalSelfRejected,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::LoginFailed => "LOGIN_FAILED",
            AuditAction::Login2faRequired => "LOGIN_2FA_REQUIRED",
            AuditAction::Login2faDeviceBypass => "LOGIN_2FA_DEVICE_BYPASS",
            AuditAction::LoginSuccess => "LOGIN_SUCCESS",
            AuditAction::SecondFactorFailed => "SECOND_FACTOR_FAILED",
            AuditAction::RecoveryCodeUsed => "RECOVERY_CODE_USED",
            AuditAction::RecoveryCodeFailed => "RECOVERY_CODE_FAILED",
            AuditAction::TokenRejected => "TOKEN_REJECTED",
            AuditAction::Logout => "LOGOUT",
            AuditAction::LogoutAll => "LOGOUT_ALL",
            AuditAction::SessionRevoked => "SESSION_REVOKED",
            AuditAction::SessionsSwept => "SESSIONS_SWEPT",
            AuditAction::DeviceRemembered => "DEVICE_REMEMBERED",
            AuditAction::DeviceForgotten => "DEVICE_FORGOTTEN",
            AuditAction::TwoFactorEnabled => "TWO_FACTOR_ENABLED",
            AuditAction::TwoFactorDisabled => "TWO_FACTOR_DISABLED",
            AuditAction::TwoFactorReset => "TWO_FACTOR_RESET",
            AuditAction::RecoveryCodesRegenerated => "RECOVERY_CODES_REGENERATED",
            AuditAction::UserCreated => "USER_CREATED",
            AuditAction::UserUpdated => "USER_UPDATED",
            AuditAction::UserDeleted => "USER_DELETED",
            AuditAction::UserSuspended => "USER_SUSPENDED",
            AuditAction::UserUnsuspended => "USER_UNSUSPENDED",
            AuditAction::AuthorityChanged => "AUTHORITY_CHANGED",
            AuditAction::PermissionsChanged => "PERMISSIONS_CHANGED",
            AuditAction::PasswordChanged => "PASSWORD_CHANGED",
            AuditAction::ApprovalRequested => "APPROVAL_REQUESTED",
            AuditAction::ApprovalApproved => "APPROVAL_APPROVED",
            AuditAction::ApprovalDenied => "APPROVAL_DENIED",
            AuditAction::ApprovalExpired => "APPROVAL_EXPIRED",
            AuditAction::ApprovalSelfRejected => "APPROVAL_SELF_REJECTED",
        }
    }
}

/// Audit log entry. Never updated or deleted once appended.
#[derive(Debug, Clone)]
pub struct AuditLogEntry {
    pub entry_id: Uuid,
    pub actor_user_id: Option<Uuid>,
    pub action: String,
    pub target: Option<String>,
    pub details: Option<String>,
    pub ip_address: Option<String>,
    pub created_utc: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn new(action: AuditAction) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            actor_user_id: None,
            action: action.as_str().to_string(),
            target: None,
            details: None,
            ip_address: None,
            created_utc: Utc::now(),
        }
    }

    pub fn actor(mut self, user_id: Uuid) -> Self {
        self.actor_user_id = Some(user_id);
        self
    }

    pub fn target(mut self, target: impl ToString) -> Self {
        self.target = Some(target.to_string());
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn ip(mut self, ip_address: Option<&str>) -> Self {
        self.ip_address = ip_address.map(str::to_string);
        self
    }
}
