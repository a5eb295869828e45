//! Persistence interface consumed by the identity core.
//!
//! Every multi-step mutation is a single method so that each backend can
//! apply it atomically: a caller never observes a half-applied change.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    ApprovalRequest, ApprovalStatus, AuditLogEntry, AuthorityLevel, RememberedDevice, Session,
    User,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Mutation applied together with an approved decision.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalEffect {
    /// Remove the user; sessions and devices go with it.
    DeleteUser { user_id: Uuid },
    /// Mark suspended and delete every session of the user.
    Suspend {
        user_id: Uuid,
        reason: String,
        actor_id: Uuid,
        at: DateTime<Utc>,
    },
    Unsuspend { user_id: Uuid },
    SetAuthority {
        user_id: Uuid,
        level: AuthorityLevel,
    },
    /// Clear the second factor, recovery codes and remembered devices.
    ResetTwoFactor { user_id: Uuid },
}

impl ApprovalEffect {
    pub fn user_id(&self) -> Uuid {
        match self {
            ApprovalEffect::DeleteUser { user_id }
            | ApprovalEffect::Suspend { user_id, .. }
            | ApprovalEffect::Unsuspend { user_id }
            | ApprovalEffect::SetAuthority { user_id, .. }
            | ApprovalEffect::ResetTwoFactor { user_id } => *user_id,
        }
    }
}

/// Targeted change to one user record. Each variant writes only the columns
/// it owns; recovery codes and suspension are never rewritten wholesale, so a
/// concurrent recovery-code use or approved suspension cannot be undone.
#[derive(Debug, Clone, PartialEq)]
pub enum UserChange {
    /// `None` leaves a field as is. `discord_id: Some(None)` unlinks.
    Profile {
        email: Option<String>,
        display_name: Option<String>,
        discord_id: Option<Option<String>>,
    },
    /// Disabling also deletes every session.
    SetEnabled(bool),
    /// Deletes every session so the next token carries the new level.
    SetAuthority(AuthorityLevel),
    /// Deletes every session so the next token carries the new grants.
    SetPermissions(BTreeSet<String>),
    /// Deletes every session except `keep_session`.
    SetPasswordHash {
        password_hash: String,
        keep_session: Option<Uuid>,
    },
    /// Stores a setup secret. `Conflict` once the factor is enabled.
    StartTwoFactor { secret: String },
    /// Enables the factor if `secret` is still the pending one.
    EnableTwoFactor {
        secret: String,
        recovery_codes: Vec<String>,
    },
    /// `Conflict` unless the factor is enabled.
    ReplaceRecoveryCodes(Vec<String>),
    /// Clears secret and recovery codes and deletes remembered devices.
    ClearTwoFactor,
}

/// Result of `Store::apply_user_change`.
#[derive(Debug, Clone)]
pub struct UserChangeApplied {
    pub user: User,
    pub sessions_revoked: u64,
    pub devices_forgotten: u64,
}

/// A `pending -> approved|denied` transition.
#[derive(Debug, Clone)]
pub struct DecisionCommit {
    pub approval_id: Uuid,
    pub approver_id: Uuid,
    pub status: ApprovalStatus,
    pub comment: Option<String>,
    pub resolved_at: DateTime<Utc>,
    /// Only set for approvals.
    pub effect: Option<ApprovalEffect>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn health_check(&self) -> StoreResult<()>;

    // Users

    /// Fails with `Conflict` when the email or external id is taken.
    async fn insert_user(&self, user: &User) -> StoreResult<()>;
    async fn find_user_by_id(&self, user_id: Uuid) -> StoreResult<Option<User>>;
    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>>;
    async fn list_users(&self) -> StoreResult<Vec<User>>;
    /// Applies `change` together with the session or device revocation it
    /// implies, under a lock on the user. `NotFound` if absent, `Conflict` on
    /// a uniqueness violation or a failed precondition.
    async fn apply_user_change(
        &self,
        user_id: Uuid,
        change: &UserChange,
        at: DateTime<Utc>,
    ) -> StoreResult<UserChangeApplied>;
    /// Removes `code_hash` from the user's recovery codes if present.
    /// Returns `true` for exactly one caller per code.
    async fn consume_recovery_code(&self, user_id: Uuid, code_hash: &str) -> StoreResult<bool>;

    // Sessions

    /// Evicts the user's oldest sessions by last activity until fewer than
    /// `max_sessions` remain, then inserts. Returns the number evicted.
    async fn insert_session_bounded(
        &self,
        session: &Session,
        max_sessions: usize,
    ) -> StoreResult<usize>;
    async fn find_session_by_token_hash(&self, token_hash: &str) -> StoreResult<Option<Session>>;
    async fn find_session(&self, session_id: Uuid) -> StoreResult<Option<Session>>;
    async fn touch_session(&self, session_id: Uuid, at: DateTime<Utc>) -> StoreResult<()>;
    /// Sessions of the user with `expires_utc > now`, most recently active first.
    async fn list_sessions(&self, user_id: Uuid, now: DateTime<Utc>) -> StoreResult<Vec<Session>>;
    async fn delete_session(&self, session_id: Uuid) -> StoreResult<bool>;
    async fn delete_user_sessions(&self, user_id: Uuid, except: Option<Uuid>)
        -> StoreResult<u64>;
    /// Deletes sessions past absolute expiry, plus non-remembered sessions
    /// whose last activity is at or before `idle_cutoff`.
    async fn sweep_sessions(&self, now: DateTime<Utc>, idle_cutoff: DateTime<Utc>)
        -> StoreResult<u64>;

    // Remembered devices

    async fn find_device(&self, user_id: Uuid, fingerprint: &str)
        -> StoreResult<Option<RememberedDevice>>;
    /// Inserts, or refreshes name/ip/last-used of the existing
    /// `(user_id, fingerprint)` record.
    async fn upsert_device(&self, device: &RememberedDevice) -> StoreResult<RememberedDevice>;
    async fn touch_device(&self, device_id: Uuid, at: DateTime<Utc>) -> StoreResult<()>;
    async fn list_devices(&self, user_id: Uuid) -> StoreResult<Vec<RememberedDevice>>;
    async fn delete_device(&self, user_id: Uuid, device_id: Uuid) -> StoreResult<bool>;
    async fn delete_user_devices(&self, user_id: Uuid) -> StoreResult<u64>;

    // Approvals

    /// `Conflict` when a pending request with the same action and target
    /// already exists.
    async fn insert_approval(&self, approval: &ApprovalRequest) -> StoreResult<()>;
    async fn find_approval(&self, approval_id: Uuid) -> StoreResult<Option<ApprovalRequest>>;
    /// Newest first.
    async fn list_approvals(&self, status: Option<ApprovalStatus>)
        -> StoreResult<Vec<ApprovalRequest>>;
    /// Flips every overdue pending request to expired. Returns the count.
    async fn expire_overdue_approvals(&self, now: DateTime<Utc>) -> StoreResult<u64>;
    /// Flips one pending request to expired. `false` if it was not pending.
    async fn expire_approval(&self, approval_id: Uuid, now: DateTime<Utc>) -> StoreResult<bool>;
    /// Conditionally resolves a pending request and applies its effect in
    /// one unit. `Ok(false)` when the request was no longer pending; a
    /// missing effect target is `NotFound` and nothing is applied.
    async fn commit_decision(&self, commit: &DecisionCommit) -> StoreResult<bool>;

    // Audit

    async fn append_audit(&self, entry: &AuditLogEntry) -> StoreResult<()>;
}
