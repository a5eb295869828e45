//! User administration and self-service account changes.

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

use super::approvals::ApprovalWorkflow;
use super::audit::AuditSink;
use super::auth::AuthenticatedUser;
use super::error::ServiceError;
use super::provisioning::ProvisioningClient;
use super::sessions::SessionRegistry;
use super::store::{Store, UserChange, UserChangeApplied};
use crate::config::BootstrapConfig;
use crate::models::{
    is_valid_permission, permissions, ApprovalAction, ApprovalRequest, AuditAction,
    AuditLogEntry, AuthorityLevel, User, UserProfile,
};
use crate::utils::{
    hash_password, normalize_email, validate_display_name, validate_password_strength,
    verify_password, Password, PasswordHashString,
};

/// Either the change was applied, or it was turned into an approval request
/// that a second administrator must decide.
#[derive(Debug, Clone)]
pub enum AdminActionOutcome<T> {
    Applied(T),
    PendingApproval(ApprovalRequest),
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password: Password,
    pub display_name: String,
    pub discord_id: Option<String>,
    pub authority_level: AuthorityLevel,
    pub permissions: BTreeSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProfileChanges {
    pub email: Option<String>,
    pub display_name: Option<String>,
    /// `Some(None)` unlinks the external identity.
    pub discord_id: Option<Option<String>>,
}

#[derive(Clone)]
pub struct UserAdmin {
    store: Arc<dyn Store>,
    sessions: SessionRegistry,
    approvals: ApprovalWorkflow,
    provisioning: Arc<dyn ProvisioningClient>,
    audit: AuditSink,
}

impl UserAdmin {
    pub fn new(
        store: Arc<dyn Store>,
        sessions: SessionRegistry,
        approvals: ApprovalWorkflow,
        provisioning: Arc<dyn ProvisioningClient>,
        audit: AuditSink,
    ) -> Self {
        Self {
            store,
            sessions,
            approvals,
            provisioning,
            audit,
        }
    }

    async fn load(&self, user_id: Uuid) -> Result<User, ServiceError> {
        self.store
            .find_user_by_id(user_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("User".to_string()))
    }

    /// Load a target the actor may administer: not themselves and not of
    /// higher authority.
    async fn load_managed(
        &self,
        actor: &AuthenticatedUser,
        user_id: Uuid,
    ) -> Result<User, ServiceError> {
        if user_id == actor.user_id() {
            return Err(ServiceError::Forbidden(
                "Use the self-service endpoints to change your own account".to_string(),
            ));
        }
        let target = self.load(user_id).await?;
        if target.authority_level > actor.authority_level() {
            return Err(ServiceError::Forbidden(
                "Cannot manage a user with higher authority than yourself".to_string(),
            ));
        }
        Ok(target)
    }

    async fn apply(&self, user_id: Uuid, change: UserChange) -> Result<UserChangeApplied, ServiceError> {
        let applied = self.store.apply_user_change(user_id, &change, Utc::now()).await?;
        if applied.sessions_revoked > 0 {
            tracing::info!(user_id = %user_id, count = applied.sessions_revoked, "Sessions revoked with account change");
        }
        Ok(applied)
    }

    async fn provision<F>(&self, what: &str, user_id: Uuid, call: F) -> bool
    where
        F: std::future::Future<Output = Result<(), anyhow::Error>>,
    {
        match call.await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, user_id = %user_id, operation = %what, "Provisioning failed");
                false
            }
        }
    }

    /// Create a user. Returns the profile and whether provisioning succeeded.
    pub async fn create_user(
        &self,
        actor: &AuthenticatedUser,
        new: NewUser,
        ip: Option<&str>,
    ) -> Result<(UserProfile, bool), ServiceError> {
        let email = normalize_email(&new.email);
        if !email.contains('@') {
            return Err(ServiceError::Validation("Invalid email address".to_string()));
        }
        let display_name = validate_display_name(&new.display_name).map_err(ServiceError::Validation)?;
        validate_password_strength(new.password.as_str()).map_err(ServiceError::Validation)?;

        if new.authority_level > actor.authority_level() {
            return Err(ServiceError::Forbidden(
                "Cannot create user with higher authority than yourself".to_string(),
            ));
        }
        actor.require_permission(permissions::MANAGE_USERS)?;
        check_grantable(actor, new.permissions.iter())?;

        let password_hash = hash_password(&new.password)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Password hashing error: {}", e)))?;

        let mut user = User::new(
            email,
            password_hash.into_string(),
            display_name,
            new.authority_level,
        );
        user.discord_id = new.discord_id.filter(|d| !d.trim().is_empty());
        user.permissions = new.permissions;
        self.store.insert_user(&user).await?;

        tracing::info!(user_id = %user.user_id, level = %user.authority_level, "User created");
        self.audit
            .record(
                AuditLogEntry::new(AuditAction::UserCreated)
                    .actor(actor.user_id())
                    .target(user.user_id)
                    .details(format!("{} at {}", user.email, user.authority_level))
                    .ip(ip),
            )
            .await;

        let provisioned = self
            .provision(
                "create_account",
                user.user_id,
                self.provisioning
                    .create_account(&user.email, &user.display_name, new.password.as_str()),
            )
            .await;

        Ok((user.profile(), provisioned))
    }

    pub async fn get_user(
        &self,
        actor: &AuthenticatedUser,
        user_id: Uuid,
    ) -> Result<UserProfile, ServiceError> {
        actor.require_permission(permissions::VIEW_USERS)?;
        Ok(self.load(user_id).await?.profile())
    }

    pub async fn list_users(&self, actor: &AuthenticatedUser) -> Result<Vec<UserProfile>, ServiceError> {
        actor.require_permission(permissions::VIEW_USERS)?;
        Ok(self
            .store
            .list_users()
            .await?
            .iter()
            .map(User::profile)
            .collect())
    }

    pub async fn update_profile(
        &self,
        actor: &AuthenticatedUser,
        user_id: Uuid,
        changes: ProfileChanges,
        ip: Option<&str>,
    ) -> Result<UserProfile, ServiceError> {
        actor.require_permission(permissions::MANAGE_USERS)?;
        self.load_managed(actor, user_id).await?;
        let applied = self.apply(user_id, profile_change(changes)?).await?;

        self.audit
            .record(
                AuditLogEntry::new(AuditAction::UserUpdated)
                    .actor(actor.user_id())
                    .target(user_id)
                    .details("profile")
                    .ip(ip),
            )
            .await;
        Ok(applied.user.profile())
    }

    /// Enable or disable an account. Disabling revokes every session.
    pub async fn set_enabled(
        &self,
        actor: &AuthenticatedUser,
        user_id: Uuid,
        enabled: bool,
        ip: Option<&str>,
    ) -> Result<UserProfile, ServiceError> {
        actor.require_permission(permissions::MANAGE_USERS)?;
        self.load_managed(actor, user_id).await?;
        let applied = self.apply(user_id, UserChange::SetEnabled(enabled)).await?;

        self.audit
            .record(
                AuditLogEntry::new(AuditAction::UserUpdated)
                    .actor(actor.user_id())
                    .target(user_id)
                    .details(if enabled { "enabled" } else { "disabled" })
                    .ip(ip),
            )
            .await;
        Ok(applied.user.profile())
    }

    /// Change authority. Raising a user to Admin or above needs a second
    /// approver; everything else applies directly. Applied changes revoke
    /// the user's sessions so the next token carries the new claims.
    pub async fn set_authority(
        &self,
        actor: &AuthenticatedUser,
        user_id: Uuid,
        level: AuthorityLevel,
        reason: &str,
        ip: Option<&str>,
    ) -> Result<AdminActionOutcome<UserProfile>, ServiceError> {
        actor.require_permission(permissions::MANAGE_USERS)?;
        let user = self.load_managed(actor, user_id).await?;
        if level > actor.authority_level() {
            return Err(ServiceError::Forbidden(
                "Cannot grant authority higher than your own".to_string(),
            ));
        }
        if level == user.authority_level {
            return Ok(AdminActionOutcome::Applied(user.profile()));
        }

        if level >= AuthorityLevel::Admin && level > user.authority_level {
            let approval = self
                .approvals
                .submit(
                    actor,
                    ApprovalAction::EscalateAuthority {
                        authority_level: level,
                    },
                    user_id,
                    reason,
                    ip,
                )
                .await?;
            return Ok(AdminActionOutcome::PendingApproval(approval));
        }

        let previous = user.authority_level;
        let applied = self.apply(user_id, UserChange::SetAuthority(level)).await?;

        self.audit
            .record(
                AuditLogEntry::new(AuditAction::AuthorityChanged)
                    .actor(actor.user_id())
                    .target(user_id)
                    .details(format!("{} -> {}", previous, level))
                    .ip(ip),
            )
            .await;
        Ok(AdminActionOutcome::Applied(applied.user.profile()))
    }

    /// Replace the explicit grants. Only permissions the actor holds can be
    /// added or removed.
    pub async fn set_permissions(
        &self,
        actor: &AuthenticatedUser,
        user_id: Uuid,
        grants: BTreeSet<String>,
        ip: Option<&str>,
    ) -> Result<UserProfile, ServiceError> {
        actor.require_permission(permissions::MANAGE_USERS)?;
        let user = self.load_managed(actor, user_id).await?;

        let changed: Vec<&String> = grants.symmetric_difference(&user.permissions).collect();
        if changed.is_empty() {
            return Ok(user.profile());
        }
        check_grantable(actor, changed.iter().copied())?;
        let details = changed
            .iter()
            .map(|p| {
                if grants.contains(*p) {
                    format!("+{}", p)
                } else {
                    format!("-{}", p)
                }
            })
            .collect::<Vec<_>>()
            .join(" ");

        let applied = self.apply(user_id, UserChange::SetPermissions(grants)).await?;

        self.audit
            .record(
                AuditLogEntry::new(AuditAction::PermissionsChanged)
                    .actor(actor.user_id())
                    .target(user_id)
                    .details(details)
                    .ip(ip),
            )
            .await;
        Ok(applied.user.profile())
    }

    /// Clear a user's second factor. Admin-or-above targets need approval.
    pub async fn reset_two_factor(
        &self,
        actor: &AuthenticatedUser,
        user_id: Uuid,
        reason: &str,
        ip: Option<&str>,
    ) -> Result<AdminActionOutcome<UserProfile>, ServiceError> {
        actor.require_permission(permissions::MANAGE_USERS)?;
        let user = self.load_managed(actor, user_id).await?;
        if !user.two_factor_enabled {
            return Err(ServiceError::Validation(
                "User does not have two-factor authentication enabled".to_string(),
            ));
        }

        if user.authority_level >= AuthorityLevel::Admin {
            let approval = self
                .approvals
                .submit(actor, ApprovalAction::ResetTwoFactor, user_id, reason, ip)
                .await?;
            return Ok(AdminActionOutcome::PendingApproval(approval));
        }

        let applied = self.apply(user_id, UserChange::ClearTwoFactor).await?;

        self.audit
            .record(
                AuditLogEntry::new(AuditAction::TwoFactorReset)
                    .actor(actor.user_id())
                    .target(user_id)
                    .ip(ip),
            )
            .await;
        Ok(AdminActionOutcome::Applied(applied.user.profile()))
    }

    pub async fn suspend(
        &self,
        actor: &AuthenticatedUser,
        user_id: Uuid,
        reason: &str,
        ip: Option<&str>,
    ) -> Result<ApprovalRequest, ServiceError> {
        let action = ApprovalAction::SuspendUser {
            reason: Some(reason.trim().to_string()).filter(|r| !r.is_empty()),
        };
        self.approvals.submit(actor, action, user_id, reason, ip).await
    }

    pub async fn unsuspend(
        &self,
        actor: &AuthenticatedUser,
        user_id: Uuid,
        reason: &str,
        ip: Option<&str>,
    ) -> Result<ApprovalRequest, ServiceError> {
        self.approvals
            .submit(actor, ApprovalAction::UnsuspendUser, user_id, reason, ip)
            .await
    }

    pub async fn delete(
        &self,
        actor: &AuthenticatedUser,
        user_id: Uuid,
        reason: &str,
        ip: Option<&str>,
    ) -> Result<ApprovalRequest, ServiceError> {
        self.approvals
            .submit(actor, ApprovalAction::DeleteUser, user_id, reason, ip)
            .await
    }

    /// Revoke all sessions of another user.
    pub async fn revoke_sessions(
        &self,
        actor: &AuthenticatedUser,
        user_id: Uuid,
        ip: Option<&str>,
    ) -> Result<u64, ServiceError> {
        actor.require_permission(permissions::MANAGE_SESSIONS)?;
        self.load_managed(actor, user_id).await?;
        let count = self.sessions.revoke_all_for(user_id, None).await?;

        self.audit
            .record(
                AuditLogEntry::new(AuditAction::SessionRevoked)
                    .actor(actor.user_id())
                    .target(user_id)
                    .details(format!("{} sessions revoked", count))
                    .ip(ip),
            )
            .await;
        Ok(count)
    }

    // Self-service

    pub async fn get_own_profile(&self, actor: &AuthenticatedUser) -> Result<UserProfile, ServiceError> {
        actor.require_permission(permissions::PROFILE_READ)?;
        Ok(self.load(actor.user_id()).await?.profile())
    }

    /// Users may change their display name and external identity link.
    /// Email changes are an administrative action.
    pub async fn update_own_profile(
        &self,
        actor: &AuthenticatedUser,
        display_name: Option<String>,
        discord_id: Option<Option<String>>,
        ip: Option<&str>,
    ) -> Result<UserProfile, ServiceError> {
        actor.require_permission(permissions::PROFILE_UPDATE)?;
        let change = profile_change(ProfileChanges {
            email: None,
            display_name,
            discord_id,
        })?;
        let applied = self.apply(actor.user_id(), change).await?;

        self.audit
            .record(
                AuditLogEntry::new(AuditAction::UserUpdated)
                    .actor(actor.user_id())
                    .target(actor.user_id())
                    .details("self-service profile")
                    .ip(ip),
            )
            .await;
        Ok(applied.user.profile())
    }

    /// Change the caller's password and revoke their other sessions.
    /// Returns whether provisioning succeeded.
    pub async fn change_password(
        &self,
        actor: &AuthenticatedUser,
        current: &Password,
        new: &Password,
        ip: Option<&str>,
    ) -> Result<bool, ServiceError> {
        let user = self.load(actor.user_id()).await?;
        let matches = verify_password(current, &PasswordHashString::new(user.password_hash.clone()))
            .unwrap_or(false);
        if !matches {
            return Err(ServiceError::Forbidden(
                "Current password is incorrect".to_string(),
            ));
        }
        validate_password_strength(new.as_str()).map_err(ServiceError::Validation)?;

        let hash = hash_password(new)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Password hashing error: {}", e)))?;
        let applied = self
            .apply(
                user.user_id,
                UserChange::SetPasswordHash {
                    password_hash: hash.into_string(),
                    keep_session: Some(actor.session_id()),
                },
            )
            .await?;

        self.audit
            .record(
                AuditLogEntry::new(AuditAction::PasswordChanged)
                    .actor(user.user_id)
                    .details(format!("{} other sessions revoked", applied.sessions_revoked))
                    .ip(ip),
            )
            .await;

        Ok(self
            .provision(
                "update_password",
                user.user_id,
                self.provisioning.update_password(&user.email, new.as_str()),
            )
            .await)
    }

    /// Create the configured superuser if no account uses that email yet.
    /// Returns `true` when an account was created.
    pub async fn bootstrap(&self, config: &BootstrapConfig) -> Result<bool, ServiceError> {
        use secrecy::ExposeSecret;

        let email = normalize_email(&config.email);
        if self.store.find_user_by_email(&email).await?.is_some() {
            tracing::debug!("Bootstrap account already present");
            return Ok(false);
        }

        let password = Password::new(config.password.expose_secret().as_str());
        validate_password_strength(password.as_str()).map_err(ServiceError::Validation)?;
        let hash = hash_password(&password)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Password hashing error: {}", e)))?;
        let display_name = validate_display_name(&config.display_name).map_err(ServiceError::Validation)?;

        let user = User::new(email, hash.into_string(), display_name, AuthorityLevel::Superuser);
        self.store.insert_user(&user).await?;

        tracing::info!(user_id = %user.user_id, "Bootstrap superuser created");
        self.audit
            .record(
                AuditLogEntry::new(AuditAction::UserCreated)
                    .target(user.user_id)
                    .details("bootstrap superuser"),
            )
            .await;
        Ok(true)
    }
}

fn check_grantable<'a>(
    actor: &AuthenticatedUser,
    grants: impl Iterator<Item = &'a String>,
) -> Result<(), ServiceError> {
    for permission in grants {
        if !is_valid_permission(permission) {
            return Err(ServiceError::Validation(format!(
                "Invalid permission '{}': expected area:action",
                permission
            )));
        }
        if !actor.claims.has_permission(permission) {
            return Err(ServiceError::Forbidden(format!(
                "Cannot grant or revoke a permission you do not hold: {}",
                permission
            )));
        }
    }
    Ok(())
}

/// Validate and normalise an edit into the fields it touches.
fn profile_change(changes: ProfileChanges) -> Result<UserChange, ServiceError> {
    let email = match changes.email {
        Some(email) => {
            let email = normalize_email(&email);
            if !email.contains('@') {
                return Err(ServiceError::Validation("Invalid email address".to_string()));
            }
            Some(email)
        }
        None => None,
    };
    let display_name = changes
        .display_name
        .map(|name| validate_display_name(&name).map_err(ServiceError::Validation))
        .transpose()?;
    let discord_id = changes
        .discord_id
        .map(|id| id.filter(|d| !d.trim().is_empty()));
    Ok(UserChange::Profile {
        email,
        display_name,
        discord_id,
    })
}
