use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::TokenPolicy;
use crate::models::{AuthorityLevel, User};

/// Token service: signs and verifies HS256 bearer tokens.
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    audience: String,
    ttl: Duration,
    extended_ttl: Duration,
    challenge_ttl: Duration,
}

/// Claims carried by an access token. Decoded once at verification and
/// handed around typed from there on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessClaims {
    pub user_id: Uuid,
    pub email: String,
    pub discord_id: Option<String>,
    pub display_name: String,
    pub authority_level: AuthorityLevel,
    pub roles: Vec<String>,
    /// Effective permissions at issue time.
    pub permissions: Vec<String>,
    pub session_id: Uuid,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

impl AccessClaims {
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Claims of the short-lived token handed out while a second factor is
/// pending. Signed with a distinct audience so it can never pass as an
/// access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeClaims {
    pub sub: Uuid,
    pub remember_me: bool,
    pub device_fingerprint: Option<String>,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl TokenService {
    pub fn new(policy: &TokenPolicy) -> Self {
        let secret = policy.secret.expose_secret().as_bytes();
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            issuer: policy.issuer.clone(),
            audience: policy.audience.clone(),
            ttl: policy.ttl,
            extended_ttl: policy.extended_ttl,
            challenge_ttl: policy.challenge_ttl,
        }
    }

    fn challenge_audience(&self) -> String {
        format!("{}:2fa", self.audience)
    }

    fn validation(&self, audience: &str) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_audience(&[audience]);
        validation.set_required_spec_claims(&["exp", "iat", "iss", "aud"]);
        validation
    }

    /// Issue an access token for `user` bound to `session_id`. Extended
    /// tokens live for the "remember me" lifetime.
    pub fn issue(
        &self,
        user: &User,
        session_id: Uuid,
        extended: bool,
    ) -> Result<IssuedToken, anyhow::Error> {
        self.issue_at(user, session_id, extended, Utc::now())
    }

    pub fn issue_at(
        &self,
        user: &User,
        session_id: Uuid,
        extended: bool,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken, anyhow::Error> {
        let expires_at = now + if extended { self.extended_ttl } else { self.ttl };

        let claims = AccessClaims {
            user_id: user.user_id,
            email: user.email.clone(),
            discord_id: user.discord_id.clone(),
            display_name: user.display_name.clone(),
            authority_level: user.authority_level,
            roles: vec![user.authority_level.role().to_string()],
            permissions: user.effective_permissions().into_iter().collect(),
            session_id,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| anyhow::anyhow!("Failed to encode access token: {}", e))?;

        Ok(IssuedToken { token, expires_at })
    }

    /// Verify signature, issuer, audience and expiry. Says nothing about
    /// whether the session behind the token is still live.
    pub fn verify(&self, token: &str) -> Result<AccessClaims, anyhow::Error> {
        let data = decode::<AccessClaims>(token, &self.decoding_key, &self.validation(&self.audience))
            .map_err(|e| anyhow::anyhow!("Invalid access token: {}", e))?;
        Ok(data.claims)
    }

    pub fn issue_challenge(
        &self,
        user_id: Uuid,
        remember_me: bool,
        device_fingerprint: Option<String>,
    ) -> Result<IssuedToken, anyhow::Error> {
        let now = Utc::now();
        let expires_at = now + self.challenge_ttl;
        let claims = ChallengeClaims {
            sub: user_id,
            remember_me,
            device_fingerprint,
            iss: self.issuer.clone(),
            aud: self.challenge_audience(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| anyhow::anyhow!("Failed to encode challenge token: {}", e))?;

        Ok(IssuedToken { token, expires_at })
    }

    pub fn verify_challenge(&self, token: &str) -> Result<ChallengeClaims, anyhow::Error> {
        let data = decode::<ChallengeClaims>(
            token,
            &self.decoding_key,
            &self.validation(&self.challenge_audience()),
        )
        .map_err(|e| anyhow::anyhow!("Invalid challenge token: {}", e))?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::permissions;

    fn service() -> TokenService {
        TokenService::new(&TokenPolicy::new("0123456789abcdef0123456789abcdef"))
    }

    fn user() -> User {
        let mut user = User::new(
            "a@x.com".to_string(),
            "hash".to_string(),
            "Alice".to_string(),
            AuthorityLevel::Moderator,
        );
        user.permissions.insert(permissions::MAIL_ADMIN.to_string());
        user
    }

    #[test]
    fn test_issue_and_verify() {
        let svc = service();
        let user = user();
        let session_id = Uuid::new_v4();
        let issued = svc.issue(&user, session_id, false).unwrap();

        assert_eq!(issued.token.split('.').count(), 3);

        let claims = svc.verify(&issued.token).unwrap();
        assert_eq!(claims.user_id, user.user_id);
        assert_eq!(claims.session_id, session_id);
        assert_eq!(claims.roles, vec!["moderator".to_string()]);
        assert!(claims.has_permission(permissions::VIEW_USERS));
        assert!(claims.has_permission(permissions::MAIL_ADMIN));
        assert!(!claims.has_permission(permissions::MANAGE_USERS));
    }

    #[test]
    fn test_wire_claim_names() {
        let svc = service();
        let issued = svc.issue(&user(), Uuid::new_v4(), false).unwrap();
        let claims = svc.verify(&issued.token).unwrap();
        let json = serde_json::to_value(&claims).unwrap();
        for key in [
            "userId",
            "email",
            "discordId",
            "displayName",
            "authorityLevel",
            "roles",
            "permissions",
            "sessionId",
            "iss",
            "aud",
            "iat",
            "exp",
        ] {
            assert!(json.get(key).is_some(), "missing claim {}", key);
        }
        assert_eq!(json["authorityLevel"], 1);
    }

    #[test]
    fn test_lifetimes() {
        let svc = service();
        let now = Utc::now();
        let normal = svc.issue_at(&user(), Uuid::new_v4(), false, now).unwrap();
        let extended = svc.issue_at(&user(), Uuid::new_v4(), true, now).unwrap();

        assert_eq!(normal.expires_at - now, Duration::days(7));
        assert_eq!(extended.expires_at - now, Duration::days(30));
    }

    #[test]
    fn test_expired_token_rejected() {
        let svc = service();
        let issued = svc
            .issue_at(&user(), Uuid::new_v4(), false, Utc::now() - Duration::days(8))
            .unwrap();
        assert!(svc.verify(&issued.token).is_err());
    }

    #[test]
    fn test_tampered_token_rejected() {
        let svc = service();
        let issued = svc.issue(&user(), Uuid::new_v4(), false).unwrap();
        let mut parts: Vec<&str> = issued.token.split('.').collect();
        let other = svc.issue(&user(), Uuid::new_v4(), false).unwrap();
        let other_payload = other.token.split('.').nth(1).unwrap().to_string();
        parts[1] = &other_payload;
        assert!(svc.verify(&parts.join(".")).is_err());
        assert!(svc.verify("not.a.token").is_err());
    }

    #[test]
    fn test_wrong_secret_or_audience_rejected() {
        let issued = service().issue(&user(), Uuid::new_v4(), false).unwrap();

        let other = TokenService::new(&TokenPolicy::new("ffffffffffffffffffffffffffffffff"));
        assert!(other.verify(&issued.token).is_err());

        let mut policy = TokenPolicy::new("0123456789abcdef0123456789abcdef");
        policy.audience = "someone-else".to_string();
        assert!(TokenService::new(&policy).verify(&issued.token).is_err());
    }

    #[test]
    fn test_challenge_is_not_an_access_token() {
        let svc = service();
        let challenge = svc
            .issue_challenge(Uuid::new_v4(), true, Some("fp".to_string()))
            .unwrap();
        assert!(svc.verify(&challenge.token).is_err());

        let claims = svc.verify_challenge(&challenge.token).unwrap();
        assert!(claims.remember_me);

        let access = svc.issue(&user(), Uuid::new_v4(), false).unwrap();
        assert!(svc.verify_challenge(&access.token).is_err());
    }
}
