//! User model - identity records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use utoipa::ToSchema;
use uuid::Uuid;

use super::authority::{effective_permissions, AuthorityLevel};

/// Suspension sub-state. Present only while the account is suspended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Suspension {
    pub reason: String,
    pub suspended_by: Option<Uuid>,
    pub suspended_at: DateTime<Utc>,
}

/// User entity.
#[derive(Debug, Clone)]
pub struct User {
    pub user_id: Uuid,
    /// Lowercase-normalized, unique.
    pub email: String,
    pub password_hash: String,
    /// External messaging-platform identity, unique when present.
    pub discord_id: Option<String>,
    pub display_name: String,
    pub authority_level: AuthorityLevel,
    /// Explicit grants layered on top of the level defaults.
    pub permissions: BTreeSet<String>,
    pub enabled: bool,
    pub suspension: Option<Suspension>,
    pub two_factor_secret: Option<String>,
    pub two_factor_enabled: bool,
    /// SHA-256 hashes of unused recovery codes.
    pub recovery_codes: Vec<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl User {
    /// Create a new enabled user with no explicit grants and no second factor.
    pub fn new(
        email: String,
        password_hash: String,
        display_name: String,
        authority_level: AuthorityLevel,
    ) -> Self {
        let now = Utc::now();
        Self {
            user_id: Uuid::new_v4(),
            email,
            password_hash,
            discord_id: None,
            display_name,
            authority_level,
            permissions: BTreeSet::new(),
            enabled: true,
            suspension: None,
            two_factor_secret: None,
            two_factor_enabled: false,
            recovery_codes: Vec::new(),
            created_utc: now,
            updated_utc: now,
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspension.is_some()
    }

    /// Whether this account may log in or use existing sessions.
    pub fn can_authenticate(&self) -> bool {
        self.enabled && !self.is_suspended()
    }

    pub fn effective_permissions(&self) -> BTreeSet<String> {
        effective_permissions(self.authority_level, &self.permissions)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
            || self.authority_level.default_permissions().contains(permission)
    }

    /// Clear every second-factor artifact.
    pub fn clear_two_factor(&mut self) {
        self.two_factor_secret = None;
        self.two_factor_enabled = false;
        self.recovery_codes.clear();
    }

    /// Convert to sanitized response (no secrets or hashes).
    pub fn profile(&self) -> UserProfile {
        UserProfile::from(self)
    }
}

/// User response for API (without sensitive fields).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: Uuid,
    pub email: String,
    pub discord_id: Option<String>,
    pub display_name: String,
    #[schema(value_type = i16)]
    pub authority_level: AuthorityLevel,
    pub permissions: Vec<String>,
    pub effective_permissions: Vec<String>,
    pub enabled: bool,
    pub suspension: Option<Suspension>,
    pub two_factor_enabled: bool,
    pub recovery_codes_remaining: usize,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl From<&User> for UserProfile {
    fn from(u: &User) -> Self {
        Self {
            user_id: u.user_id,
            email: u.email.clone(),
            discord_id: u.discord_id.clone(),
            display_name: u.display_name.clone(),
            authority_level: u.authority_level,
            permissions: u.permissions.iter().cloned().collect(),
            effective_permissions: u.effective_permissions().into_iter().collect(),
            enabled: u.enabled,
            suspension: u.suspension.clone(),
            two_factor_enabled: u.two_factor_enabled,
            recovery_codes_remaining: u.recovery_codes.len(),
            created_utc: u.created_utc,
            updated_utc: u.updated_utc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> User {
        User::new(
            "a@x.com".to_string(),
            "$argon2id$stub".to_string(),
            "Alice".to_string(),
            AuthorityLevel::Moderator,
        )
    }

    #[test]
    fn test_suspended_user_cannot_authenticate() {
        let mut u = user();
        assert!(u.can_authenticate());

        u.suspension = Some(Suspension {
            reason: "spam".to_string(),
            suspended_by: None,
            suspended_at: Utc::now(),
        });
        assert!(!u.can_authenticate());

        u.suspension = None;
        u.enabled = false;
        assert!(!u.can_authenticate());
    }

    #[test]
    fn test_profile_hides_secrets() {
        let mut u = user();
        u.two_factor_secret = Some("JBSWY3DPEHPK3PXP".to_string());
        u.recovery_codes = vec!["hash1".to_string(), "hash2".to_string()];

        let json = serde_json::to_value(u.profile()).unwrap();
        assert!(json.get("passwordHash").is_none());
        assert!(json.get("twoFactorSecret").is_none());
        assert_eq!(json["recoveryCodesRemaining"], 2);
        assert_eq!(json["authorityLevel"], 1);
    }

    #[test]
    fn test_has_permission_checks_defaults_and_grants() {
        let mut u = user();
        assert!(u.has_permission("auth:view_users"));
        assert!(!u.has_permission("mail:admin"));

        u.permissions.insert("mail:admin".to_string());
        assert!(u.has_permission("mail:admin"));
    }
}
