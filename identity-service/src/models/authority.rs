//! Authority levels and the permission model.
//!
//! Levels are a fixed total order. Each level carries a default permission
//! set; users may additionally hold explicit grants. The effective set is the
//! union of both.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub mod permissions {
    pub const PROFILE_READ: &str = "profile:read";
    pub const PROFILE_UPDATE: &str = "profile:update";
    pub const VIEW_USERS: &str = "auth:view_users";
    pub const MANAGE_SESSIONS: &str = "auth:manage_sessions";
    pub const MANAGE_USERS: &str = "auth:manage_users";
    pub const APPROVE: &str = "auth:approve";
    pub const AUDIT_READ: &str = "audit:read";
    pub const MANAGE_PERMISSIONS: &str = "auth:manage_permissions";
    pub const MAIL_ADMIN: &str = "mail:admin";
    pub const SYSTEM_DEVELOPER: &str = "system:developer";
}

/// Ordered privilege tier, 0 (lowest) through 6 (highest).
///
/// Serialized as its integer value; OpenAPI schemas reference it as `i16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i16", into = "i16")]
pub enum AuthorityLevel {
    User = 0,
    Moderator = 1,
    SeniorModerator = 2,
    Admin = 3,
    Hr = 4,
    Superuser = 5,
    BotDeveloper = 6,
}

impl AuthorityLevel {
    pub const ALL: [AuthorityLevel; 7] = [
        AuthorityLevel::User,
        AuthorityLevel::Moderator,
        AuthorityLevel::SeniorModerator,
        AuthorityLevel::Admin,
        AuthorityLevel::Hr,
        AuthorityLevel::Superuser,
        AuthorityLevel::BotDeveloper,
    ];

    pub fn as_i16(self) -> i16 {
        self as i16
    }

    /// Role slug carried in token claims.
    pub fn role(self) -> &'static str {
        match self {
            AuthorityLevel::User => "user",
            AuthorityLevel::Moderator => "moderator",
            AuthorityLevel::SeniorModerator => "senior_moderator",
            AuthorityLevel::Admin => "admin",
            AuthorityLevel::Hr => "hr",
            AuthorityLevel::Superuser => "superuser",
            AuthorityLevel::BotDeveloper => "bot_developer",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AuthorityLevel::User => "User",
            AuthorityLevel::Moderator => "Moderator",
            AuthorityLevel::SeniorModerator => "Senior Mod",
            AuthorityLevel::Admin => "Admin",
            AuthorityLevel::Hr => "HR",
            AuthorityLevel::Superuser => "Superuser",
            AuthorityLevel::BotDeveloper => "Bot Developer",
        }
    }

    /// Permissions introduced at exactly this level.
    fn own_permissions(self) -> &'static [&'static str] {
        use permissions::*;
        match self {
            AuthorityLevel::User => &[PROFILE_READ, PROFILE_UPDATE],
            AuthorityLevel::Moderator => &[VIEW_USERS],
            AuthorityLevel::SeniorModerator => &[MANAGE_SESSIONS],
            AuthorityLevel::Admin => &[MANAGE_USERS, APPROVE],
            AuthorityLevel::Hr => &[AUDIT_READ],
            AuthorityLevel::Superuser => &[MANAGE_PERMISSIONS, MAIL_ADMIN],
            AuthorityLevel::BotDeveloper => &[SYSTEM_DEVELOPER],
        }
    }

    /// Default permissions of this level: its own plus every lower level's.
    pub fn default_permissions(self) -> BTreeSet<String> {
        Self::ALL
            .iter()
            .filter(|level| **level <= self)
            .flat_map(|level| level.own_permissions().iter())
            .map(|p| p.to_string())
            .collect()
    }
}

impl TryFrom<i16> for AuthorityLevel {
    type Error = String;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        Self::ALL
            .iter()
            .copied()
            .find(|level| level.as_i16() == value)
            .ok_or_else(|| format!("Invalid authority level: {}", value))
    }
}

impl From<AuthorityLevel> for i16 {
    fn from(level: AuthorityLevel) -> Self {
        level.as_i16()
    }
}

impl fmt::Display for AuthorityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label(), self.as_i16())
    }
}

/// Permission strings are namespaced `area:action` tokens.
pub fn is_valid_permission(permission: &str) -> bool {
    let valid_part = |part: &str| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    };
    match permission.split_once(':') {
        Some((area, action)) => valid_part(area) && valid_part(action),
        None => false,
    }
}

/// Level defaults unioned with explicit grants.
pub fn effective_permissions(level: AuthorityLevel, explicit: &BTreeSet<String>) -> BTreeSet<String> {
    let mut effective = level.default_permissions();
    effective.extend(explicit.iter().cloned());
    effective
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_ordered() {
        assert!(AuthorityLevel::User < AuthorityLevel::Moderator);
        assert!(AuthorityLevel::Admin < AuthorityLevel::Hr);
        assert!(AuthorityLevel::Superuser < AuthorityLevel::BotDeveloper);
        assert_eq!(AuthorityLevel::try_from(3), Ok(AuthorityLevel::Admin));
        assert!(AuthorityLevel::try_from(7).is_err());
        assert!(AuthorityLevel::try_from(-1).is_err());
    }

    #[test]
    fn test_default_permissions_accumulate() {
        let user = AuthorityLevel::User.default_permissions();
        assert!(user.contains(permissions::PROFILE_READ));
        assert!(!user.contains(permissions::MANAGE_USERS));

        let admin = AuthorityLevel::Admin.default_permissions();
        assert!(admin.contains(permissions::PROFILE_READ));
        assert!(admin.contains(permissions::VIEW_USERS));
        assert!(admin.contains(permissions::MANAGE_USERS));
        assert!(admin.contains(permissions::APPROVE));
        assert!(!admin.contains(permissions::MAIL_ADMIN));

        let superuser = AuthorityLevel::Superuser.default_permissions();
        assert!(superuser.is_superset(&admin));
        assert!(superuser.contains(permissions::MAIL_ADMIN));
    }

    #[test]
    fn test_effective_permissions_union_explicit_grants() {
        let explicit: BTreeSet<String> = ["mail:admin".to_string()].into_iter().collect();
        let effective = effective_permissions(AuthorityLevel::Moderator, &explicit);
        assert!(effective.contains("mail:admin"));
        assert!(effective.contains(permissions::VIEW_USERS));
        assert!(!effective.contains(permissions::MANAGE_USERS));
    }

    #[test]
    fn test_permission_format() {
        assert!(is_valid_permission("mail:admin"));
        assert!(is_valid_permission("auth:manage_users"));
        assert!(!is_valid_permission("mail"));
        assert!(!is_valid_permission("mail:"));
        assert!(!is_valid_permission(":admin"));
        assert!(!is_valid_permission("Mail:Admin"));
        assert!(!is_valid_permission("a:b:c"));
    }

    #[test]
    fn test_level_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&AuthorityLevel::Hr).unwrap(), "4");
        let level: AuthorityLevel = serde_json::from_str("6").unwrap();
        assert_eq!(level, AuthorityLevel::BotDeveloper);
        assert!(serde_json::from_str::<AuthorityLevel>("9").is_err());
    }
}
