use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

use super::audit::AuditSink;
use super::error::ServiceError;
use super::jwt::{AccessClaims, IssuedToken, TokenService};
use super::sessions::{NewSession, SessionRegistry};
use super::store::Store;
use super::two_factor::{verify_totp, TwoFactorService};
use crate::models::{AuditAction, AuditLogEntry, AuthorityLevel, User, UserProfile};
use crate::utils::{
    hash_password, hash_token, normalize_email, verify_password, Password, PasswordHashString,
};

/// Client context recorded on sessions and audit entries.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientInfo {
    pub fn ip(&self) -> Option<&str> {
        self.ip_address.as_deref()
    }
}

#[derive(Debug, Clone)]
pub struct LoginAttempt {
    pub email: String,
    pub password: Password,
    pub remember_me: bool,
    pub device_fingerprint: Option<String>,
    pub device_name: Option<String>,
    pub client: ClientInfo,
}

#[derive(Debug, Clone)]
pub struct SecondFactorAttempt {
    pub challenge: String,
    pub code: Option<String>,
    pub recovery_code: Option<String>,
    pub remember_device: bool,
    pub device_name: Option<String>,
    pub client: ClientInfo,
}

/// A freshly established session and its bearer token.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub session_id: Uuid,
    pub user: UserProfile,
}

#[derive(Debug, Clone)]
pub enum LoginOutcome {
    Authenticated(AuthSession),
    /// Credentials were good but a second factor is required. No session
    /// exists yet; the challenge token carries the attempt forward.
    SecondFactorRequired { challenge: IssuedToken },
}

/// Identity established from a validated bearer token.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub claims: AccessClaims,
}

impl AuthenticatedUser {
    pub fn user_id(&self) -> Uuid {
        self.claims.user_id
    }

    pub fn session_id(&self) -> Uuid {
        self.claims.session_id
    }

    pub fn authority_level(&self) -> AuthorityLevel {
        self.claims.authority_level
    }

    pub fn require_authority(&self, required: AuthorityLevel) -> Result<(), ServiceError> {
        if self.claims.authority_level >= required {
            Ok(())
        } else {
            Err(ServiceError::Forbidden(format!(
                "Requires authority level {} or higher",
                required
            )))
        }
    }

    pub fn require_permission(&self, permission: &str) -> Result<(), ServiceError> {
        if self.claims.has_permission(permission) {
            Ok(())
        } else {
            Err(ServiceError::Forbidden(format!(
                "Missing permission: {}",
                permission
            )))
        }
    }
}

/// Authentication engine: login, second factor, token validation, logout.
#[derive(Clone)]
pub struct AuthEngine {
    store: Arc<dyn Store>,
    tokens: TokenService,
    sessions: SessionRegistry,
    two_factor: TwoFactorService,
    audit: AuditSink,
}

impl AuthEngine {
    pub fn new(
        store: Arc<dyn Store>,
        tokens: TokenService,
        sessions: SessionRegistry,
        two_factor: TwoFactorService,
        audit: AuditSink,
    ) -> Self {
        Self {
            store,
            tokens,
            sessions,
            two_factor,
            audit,
        }
    }

    pub async fn login(&self, attempt: LoginAttempt) -> Result<LoginOutcome, ServiceError> {
        let email = normalize_email(&attempt.email);
        let ip = attempt.client.ip();

        self.sessions.sweep_opportunistically().await;

        let Some(user) = self.store.find_user_by_email(&email).await? else {
            verify_against_dummy(&attempt.password);
            self.audit
                .record(
                    AuditLogEntry::new(AuditAction::LoginFailed)
                        .target(&email)
                        .details("unknown email")
                        .ip(ip),
                )
                .await;
            return Err(ServiceError::InvalidCredentials);
        };

        if !user.can_authenticate() {
            verify_against_dummy(&attempt.password);
            let reason = if user.is_suspended() {
                "account suspended"
            } else {
                "account disabled"
            };
            self.audit
                .record(
                    AuditLogEntry::new(AuditAction::LoginFailed)
                        .actor(user.user_id)
                        .target(&email)
                        .details(reason)
                        .ip(ip),
                )
                .await;
            return Err(ServiceError::AccountDisabled);
        }

        if !password_matches(&attempt.password, &user) {
            self.audit
                .record(
                    AuditLogEntry::new(AuditAction::LoginFailed)
                        .actor(user.user_id)
                        .target(&email)
                        .details("invalid password")
                        .ip(ip),
                )
                .await;
            return Err(ServiceError::InvalidCredentials);
        }

        if user.two_factor_enabled {
            if let Some(fingerprint) = attempt.device_fingerprint.as_deref() {
                if let Some(device) = self
                    .sessions
                    .recognize_device(user.user_id, fingerprint)
                    .await?
                {
                    self.audit
                        .record(
                            AuditLogEntry::new(AuditAction::Login2faDeviceBypass)
                                .actor(user.user_id)
                                .target(device.device_id)
                                .ip(ip),
                        )
                        .await;
                    let session = self
                        .establish_session(
                            &user,
                            attempt.remember_me,
                            attempt.device_fingerprint.clone(),
                            attempt.device_name.or(device.device_name),
                            &attempt.client,
                        )
                        .await?;
                    return Ok(LoginOutcome::Authenticated(session));
                }
            }

            let challenge = self.tokens.issue_challenge(
                user.user_id,
                attempt.remember_me,
                attempt.device_fingerprint,
            )?;
            self.audit
                .record(
                    AuditLogEntry::new(AuditAction::Login2faRequired)
                        .actor(user.user_id)
                        .ip(ip),
                )
                .await;
            return Ok(LoginOutcome::SecondFactorRequired { challenge });
        }

        let session = self
            .establish_session(
                &user,
                attempt.remember_me,
                attempt.device_fingerprint,
                attempt.device_name,
                &attempt.client,
            )
            .await?;
        Ok(LoginOutcome::Authenticated(session))
    }

    /// Second login step: a TOTP code or a single-use recovery code against
    /// the challenge issued by `login`.
    pub async fn complete_second_factor(
        &self,
        attempt: SecondFactorAttempt,
    ) -> Result<AuthSession, ServiceError> {
        let ip = attempt.client.ip();
        let challenge = self
            .tokens
            .verify_challenge(&attempt.challenge)
            .map_err(|_| ServiceError::InvalidToken)?;

        let user = match self.store.find_user_by_id(challenge.sub).await? {
            Some(user) if user.can_authenticate() => user,
            _ => {
                self.audit
                    .record(
                        AuditLogEntry::new(AuditAction::LoginFailed)
                            .target(challenge.sub)
                            .details("account unavailable at second factor")
                            .ip(ip),
                    )
                    .await;
                return Err(ServiceError::AccountDisabled);
            }
        };
        if !user.two_factor_enabled {
            return Err(ServiceError::InvalidToken);
        }

        match (attempt.code.as_deref(), attempt.recovery_code.as_deref()) {
            (Some(code), None) => {
                let valid = match user.two_factor_secret.as_deref() {
                    Some(secret) => verify_totp(secret, code)?,
                    None => false,
                };
                if !valid {
                    self.audit
                        .record(
                            AuditLogEntry::new(AuditAction::SecondFactorFailed)
                                .actor(user.user_id)
                                .ip(ip),
                        )
                        .await;
                    return Err(ServiceError::InvalidSecondFactor);
                }
            }
            (None, Some(recovery_code)) => {
                if self
                    .two_factor
                    .consume_recovery_code(user.user_id, recovery_code)
                    .await?
                {
                    self.audit
                        .record(
                            AuditLogEntry::new(AuditAction::RecoveryCodeUsed)
                                .actor(user.user_id)
                                .ip(ip),
                        )
                        .await;
                } else {
                    self.audit
                        .record(
                            AuditLogEntry::new(AuditAction::RecoveryCodeFailed)
                                .actor(user.user_id)
                                .ip(ip),
                        )
                        .await;
                    return Err(ServiceError::InvalidSecondFactor);
                }
            }
            _ => {
                return Err(ServiceError::Validation(
                    "Provide exactly one of code or recoveryCode".to_string(),
                ))
            }
        }

        if attempt.remember_device {
            if let Some(fingerprint) = challenge.device_fingerprint.as_deref() {
                let device = self
                    .sessions
                    .remember_device(
                        user.user_id,
                        fingerprint,
                        attempt.device_name.clone(),
                        attempt.client.ip_address.clone(),
                    )
                    .await?;
                self.audit
                    .record(
                        AuditLogEntry::new(AuditAction::DeviceRemembered)
                            .actor(user.user_id)
                            .target(device.device_id)
                            .ip(ip),
                    )
                    .await;
            }
        }

        self.establish_session(
            &user,
            challenge.remember_me,
            challenge.device_fingerprint,
            attempt.device_name,
            &attempt.client,
        )
        .await
    }

    async fn establish_session(
        &self,
        user: &User,
        remember_me: bool,
        device_fingerprint: Option<String>,
        device_name: Option<String>,
        client: &ClientInfo,
    ) -> Result<AuthSession, ServiceError> {
        let session_id = Uuid::new_v4();
        let issued = self.tokens.issue(user, session_id, remember_me)?;

        self.sessions
            .create(NewSession {
                session_id,
                user_id: user.user_id,
                token_hash: hash_token(&issued.token),
                ip_address: client.ip_address.clone(),
                user_agent: client.user_agent.clone(),
                device_fingerprint,
                device_name,
                remembered: remember_me,
                expires_at: issued.expires_at,
            })
            .await?;

        self.audit
            .record(
                AuditLogEntry::new(AuditAction::LoginSuccess)
                    .actor(user.user_id)
                    .target(session_id)
                    .details(if remember_me { "remember_me" } else { "standard" })
                    .ip(client.ip()),
            )
            .await;

        Ok(AuthSession {
            token: issued.token,
            expires_at: issued.expires_at,
            session_id,
            user: user.profile(),
        })
    }

    /// Stateless verification followed by the live-session and account
    /// checks. Does not audit and does not touch.
    async fn authenticate(&self, token: &str) -> Result<(AuthenticatedUser, User), ServiceError> {
        let claims = self
            .tokens
            .verify(token)
            .map_err(|_| ServiceError::InvalidToken)?;

        let session = self
            .sessions
            .find_live(&hash_token(token))
            .await?
            .ok_or(ServiceError::SessionNotFound)?;
        if session.session_id != claims.session_id || session.user_id != claims.user_id {
            return Err(ServiceError::SessionNotFound);
        }

        let user = self
            .store
            .find_user_by_id(claims.user_id)
            .await?
            .filter(User::can_authenticate)
            .ok_or(ServiceError::AccountDisabled)?;

        // A login racing an authority or grant change can mint a session
        // with the old claims; such a token is stale.
        let granted: BTreeSet<String> = claims.permissions.iter().cloned().collect();
        if claims.authority_level != user.authority_level || granted != user.effective_permissions() {
            return Err(ServiceError::SessionNotFound);
        }

        Ok((AuthenticatedUser { claims }, user))
    }

    /// Validate a bearer token against a live session and an enabled
    /// account, refreshing the session's last activity.
    pub async fn validate_token(
        &self,
        token: &str,
        ip: Option<&str>,
    ) -> Result<AuthenticatedUser, ServiceError> {
        match self.authenticate(token).await {
            Ok((auth, _)) => {
                self.sessions.touch(auth.session_id()).await?;
                Ok(auth)
            }
            Err(e @ (ServiceError::Database(_) | ServiceError::Internal(_))) => Err(e),
            Err(e) => {
                self.audit
                    .record(
                        AuditLogEntry::new(AuditAction::TokenRejected)
                            .details(e.to_string())
                            .ip(ip),
                    )
                    .await;
                Err(e)
            }
        }
    }

    /// Revoke the session behind `token`. `Ok(false)` when the token no
    /// longer maps to a live session.
    pub async fn logout(&self, token: &str, ip: Option<&str>) -> Result<bool, ServiceError> {
        let auth = match self.authenticate(token).await {
            Ok((auth, _)) => auth,
            Err(e @ (ServiceError::Database(_) | ServiceError::Internal(_))) => return Err(e),
            Err(_) => return Ok(false),
        };

        if !self.sessions.revoke(auth.session_id()).await? {
            return Ok(false);
        }
        self.audit
            .record(
                AuditLogEntry::new(AuditAction::Logout)
                    .actor(auth.user_id())
                    .target(auth.session_id())
                    .ip(ip),
            )
            .await;
        Ok(true)
    }

    /// Revoke every session of the user. Returns how many were removed.
    pub async fn logout_all(&self, user_id: Uuid, ip: Option<&str>) -> Result<u64, ServiceError> {
        let count = self.sessions.revoke_all_for(user_id, None).await?;
        self.audit
            .record(
                AuditLogEntry::new(AuditAction::LogoutAll)
                    .actor(user_id)
                    .details(format!("{} sessions revoked", count))
                    .ip(ip),
            )
            .await;
        Ok(count)
    }
}

static DUMMY_HASH: OnceLock<Option<PasswordHashString>> = OnceLock::new();

/// Argon2 hash with the same parameters as real ones, checked on login
/// paths that have no usable account so they cost as much as a wrong password.
fn dummy_hash() -> Option<&'static PasswordHashString> {
    DUMMY_HASH
        .get_or_init(|| match hash_password(&Password::new(Uuid::new_v4().to_string())) {
            Ok(hash) => Some(hash),
            Err(e) => {
                tracing::error!(error = %e, "Failed to prepare dummy password hash");
                None
            }
        })
        .as_ref()
}

fn verify_against_dummy(password: &Password) {
    if let Some(hash) = dummy_hash() {
        let _ = verify_password(password, hash);
    }
}

/// A malformed stored hash counts as a failed verification.
fn password_matches(password: &Password, user: &User) -> bool {
    match verify_password(password, &PasswordHashString::new(user.password_hash.clone())) {
        Ok(matches) => matches,
        Err(e) => {
            tracing::warn!(user_id = %user.user_id, error = %e, "Stored password hash is malformed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenPolicy;
    use crate::models::permissions;

    fn authenticated(level: AuthorityLevel, grants: &[&str]) -> AuthenticatedUser {
        let mut user = User::new(
            "mod@example.com".to_string(),
            "hash".to_string(),
            "Mod".to_string(),
            level,
        );
        user.permissions = grants.iter().map(|p| p.to_string()).collect();
        let tokens = TokenService::new(&TokenPolicy::new("0123456789abcdef0123456789abcdef"));
        let issued = tokens.issue(&user, Uuid::new_v4(), false).unwrap();
        AuthenticatedUser {
            claims: tokens.verify(&issued.token).unwrap(),
        }
    }

    #[test]
    fn test_dummy_hash_is_a_real_argon2_hash() {
        let hash = dummy_hash().expect("dummy hash");
        assert!(hash.as_str().starts_with("$argon2id$"));
        assert!(!verify_password(&Password::new("correct-horse-1"), hash).unwrap());
        assert!(std::ptr::eq(hash, dummy_hash().unwrap()));
    }

    #[test]
    fn test_authority_gate_is_inclusive() {
        let moderator = authenticated(AuthorityLevel::Moderator, &[]);
        assert!(moderator.require_authority(AuthorityLevel::User).is_ok());
        assert!(moderator.require_authority(AuthorityLevel::Moderator).is_ok());
        assert!(matches!(
            moderator.require_authority(AuthorityLevel::Admin),
            Err(ServiceError::Forbidden(_))
        ));
    }

    #[test]
    fn test_explicit_grants_extend_level_defaults() {
        let moderator = authenticated(AuthorityLevel::Moderator, &[permissions::MAIL_ADMIN]);
        assert!(moderator.require_permission(permissions::VIEW_USERS).is_ok());
        assert!(moderator.require_permission(permissions::MAIL_ADMIN).is_ok());
        assert!(moderator.require_permission(permissions::MANAGE_USERS).is_err());
    }
}
