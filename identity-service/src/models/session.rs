//! Session model - one authenticated device/browser instance.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

/// Session entity. Holds the SHA-256 of the bearer token, never the token.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub device_fingerprint: Option<String>,
    pub device_name: Option<String>,
    pub last_active_utc: DateTime<Utc>,
    pub remembered: bool,
    pub expires_utc: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
}

impl Session {
    /// Valid iff before absolute expiry and, unless remembered, active within
    /// the inactivity window.
    pub fn is_live(&self, now: DateTime<Utc>, inactivity_timeout: Duration) -> bool {
        if now >= self.expires_utc {
            return false;
        }
        self.remembered || now - self.last_active_utc < inactivity_timeout
    }
}

/// Session info for API responses.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub device_name: Option<String>,
    pub remembered: bool,
    pub last_active_utc: DateTime<Utc>,
    pub expires_utc: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
    pub is_current: bool,
}

impl From<Session> for SessionInfo {
    fn from(s: Session) -> Self {
        Self {
            session_id: s.session_id,
            ip_address: s.ip_address,
            user_agent: s.user_agent,
            device_name: s.device_name,
            remembered: s.remembered,
            last_active_utc: s.last_active_utc,
            expires_utc: s.expires_utc,
            created_utc: s.created_utc,
            is_current: false, // Set by caller
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(remembered: bool, idle_minutes: i64, expires_in_minutes: i64) -> Session {
        let now = Utc::now();
        Session {
            session_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            token_hash: "h".to_string(),
            ip_address: None,
            user_agent: None,
            device_fingerprint: None,
            device_name: None,
            last_active_utc: now - Duration::minutes(idle_minutes),
            remembered,
            expires_utc: now + Duration::minutes(expires_in_minutes),
            created_utc: now - Duration::hours(1),
        }
    }

    #[test]
    fn test_idle_session_expires_unless_remembered() {
        let timeout = Duration::minutes(10);
        let now = Utc::now();

        assert!(session(false, 1, 60).is_live(now, timeout));
        assert!(!session(false, 11, 60).is_live(now, timeout));
        assert!(session(true, 11, 60).is_live(now, timeout));
    }

    #[test]
    fn test_absolute_expiry_applies_to_remembered_sessions() {
        let now = Utc::now();
        assert!(!session(true, 0, -1).is_live(now, Duration::minutes(10)));
    }
}
