//! TOTP second factor and single-use recovery codes.

use std::sync::Arc;
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;

use super::audit::AuditSink;
use super::error::ServiceError;
use super::store::{Store, UserChange};
use crate::models::{AuditAction, AuditLogEntry, User};
use crate::utils::{generate_recovery_code, hash_token, normalize_recovery_code};

pub const RECOVERY_CODE_COUNT: usize = 10;

fn build_totp(secret_base32: &str, issuer: Option<&str>, account: &str) -> Result<TOTP, anyhow::Error> {
    let bytes = Secret::Encoded(secret_base32.to_string())
        .to_bytes()
        .map_err(|e| anyhow::anyhow!("Failed to decode TOTP secret: {}", e))?;
    TOTP::new(
        Algorithm::SHA1,
        6,
        1,
        30,
        bytes,
        issuer.map(|s| s.to_string()),
        account.replace(':', "_"),
    )
    .map_err(|e| anyhow::anyhow!("Failed to create TOTP: {}", e))
}

/// Check a 6-digit code against a base32 secret, allowing one step of skew.
pub fn verify_totp(secret_base32: &str, code: &str) -> Result<bool, anyhow::Error> {
    let totp = build_totp(secret_base32, None, "")?;
    totp.check_current(code.trim())
        .map_err(|e| anyhow::anyhow!("TOTP system time error: {}", e))
}

/// Secret handed to the user while setting up an authenticator.
#[derive(Debug, Clone)]
pub struct TwoFactorSetup {
    pub secret: String,
    pub otpauth_url: String,
}

#[derive(Clone)]
pub struct TwoFactorService {
    store: Arc<dyn Store>,
    audit: AuditSink,
    issuer: String,
}

impl TwoFactorService {
    pub fn new(store: Arc<dyn Store>, audit: AuditSink, issuer: impl Into<String>) -> Self {
        Self {
            store,
            audit,
            issuer: issuer.into(),
        }
    }

    async fn load(&self, user_id: Uuid) -> Result<User, ServiceError> {
        self.store
            .find_user_by_id(user_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("User".to_string()))
    }

    /// Returns the secret the code was checked against.
    fn check_code<'a>(user: &'a User, code: &str) -> Result<&'a str, ServiceError> {
        let secret = user
            .two_factor_secret
            .as_deref()
            .ok_or_else(|| ServiceError::Validation("Two-factor setup has not been started".to_string()))?;
        if verify_totp(secret, code)? {
            Ok(secret)
        } else {
            Err(ServiceError::InvalidSecondFactor)
        }
    }

    /// Start setup: store a fresh, not yet enabled secret.
    pub async fn setup(&self, user_id: Uuid) -> Result<TwoFactorSetup, ServiceError> {
        let user = self.load(user_id).await?;
        if user.two_factor_enabled {
            return Err(ServiceError::Conflict(
                "Two-factor authentication is already enabled".to_string(),
            ));
        }

        let secret = Secret::generate_secret().to_encoded().to_string();
        let totp = build_totp(&secret, Some(&self.issuer), &user.email)?;
        self.store
            .apply_user_change(
                user_id,
                &UserChange::StartTwoFactor {
                    secret: secret.clone(),
                },
                chrono::Utc::now(),
            )
            .await?;

        Ok(TwoFactorSetup {
            secret,
            otpauth_url: totp.get_url(),
        })
    }

    /// Confirm setup with a current code. Returns the plaintext recovery
    /// codes; only their hashes are stored.
    pub async fn enable(
        &self,
        user_id: Uuid,
        code: &str,
        ip: Option<&str>,
    ) -> Result<Vec<String>, ServiceError> {
        let user = self.load(user_id).await?;
        if user.two_factor_enabled {
            return Err(ServiceError::Conflict(
                "Two-factor authentication is already enabled".to_string(),
            ));
        }
        let secret = Self::check_code(&user, code)?;

        let codes = fresh_recovery_codes();
        self.store
            .apply_user_change(
                user_id,
                &UserChange::EnableTwoFactor {
                    secret: secret.to_string(),
                    recovery_codes: codes.iter().map(|c| hash_token(c)).collect(),
                },
                chrono::Utc::now(),
            )
            .await?;

        self.audit
            .record(AuditLogEntry::new(AuditAction::TwoFactorEnabled).actor(user_id).ip(ip))
            .await;
        Ok(codes)
    }

    /// Turn the second factor off. Remembered devices go with it.
    pub async fn disable(
        &self,
        user_id: Uuid,
        code: &str,
        ip: Option<&str>,
    ) -> Result<(), ServiceError> {
        let user = self.load(user_id).await?;
        if !user.two_factor_enabled {
            return Err(ServiceError::Validation(
                "Two-factor authentication is not enabled".to_string(),
            ));
        }
        Self::check_code(&user, code)?;
        self.store
            .apply_user_change(user_id, &UserChange::ClearTwoFactor, chrono::Utc::now())
            .await?;

        self.audit
            .record(AuditLogEntry::new(AuditAction::TwoFactorDisabled).actor(user_id).ip(ip))
            .await;
        Ok(())
    }

    /// Replace every recovery code. Requires a current TOTP code.
    pub async fn regenerate_recovery_codes(
        &self,
        user_id: Uuid,
        code: &str,
        ip: Option<&str>,
    ) -> Result<Vec<String>, ServiceError> {
        let user = self.load(user_id).await?;
        if !user.two_factor_enabled {
            return Err(ServiceError::Validation(
                "Two-factor authentication is not enabled".to_string(),
            ));
        }
        Self::check_code(&user, code)?;

        let codes = fresh_recovery_codes();
        self.store
            .apply_user_change(
                user_id,
                &UserChange::ReplaceRecoveryCodes(codes.iter().map(|c| hash_token(c)).collect()),
                chrono::Utc::now(),
            )
            .await?;

        self.audit
            .record(
                AuditLogEntry::new(AuditAction::RecoveryCodesRegenerated)
                    .actor(user_id)
                    .ip(ip),
            )
            .await;
        Ok(codes)
    }

    /// Atomically consume a recovery code. `false` if it does not match an
    /// unused code.
    pub async fn consume_recovery_code(
        &self,
        user_id: Uuid,
        code: &str,
    ) -> Result<bool, ServiceError> {
        let hash = hash_token(&normalize_recovery_code(code));
        Ok(self.store.consume_recovery_code(user_id, &hash).await?)
    }
}

fn fresh_recovery_codes() -> Vec<String> {
    (0..RECOVERY_CODE_COUNT)
        .map(|_| generate_recovery_code())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_code_verifies() {
        let secret = Secret::generate_secret().to_encoded().to_string();
        let code = build_totp(&secret, None, "")
            .unwrap()
            .generate_current()
            .unwrap();
        assert_eq!(code.len(), 6);
        assert!(verify_totp(&secret, &code).unwrap());
    }

    #[test]
    fn test_malformed_code_rejected() {
        let secret = Secret::generate_secret().to_encoded().to_string();
        assert!(!verify_totp(&secret, "abcdef").unwrap());
        assert!(!verify_totp(&secret, "").unwrap());
    }

    #[test]
    fn test_recovery_codes_are_distinct() {
        let codes = fresh_recovery_codes();
        assert_eq!(codes.len(), RECOVERY_CODE_COUNT);
        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), RECOVERY_CODE_COUNT);
    }
}
