//! PostgreSQL store.
//!
//! Structured columns (permissions, recovery codes, approval payloads) are
//! JSONB and are converted to typed values only here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, Transaction};
use std::collections::BTreeSet;
use tracing::instrument;
use uuid::Uuid;

use super::store::{
    ApprovalEffect, DecisionCommit, Store, StoreError, StoreResult, UserChange, UserChangeApplied,
};
use crate::models::{
    ApprovalAction, ApprovalRequest, ApprovalStatus, AuditLogEntry, AuthorityLevel,
    RememberedDevice, Session, Suspension, User,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self) -> StoreResult<Transaction<'static, Postgres>> {
        self.pool.begin().await.map_err(db_err("Failed to begin transaction"))
    }
}

fn db_err(context: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| match e {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            StoreError::Conflict(match db_err.constraint() {
                Some("users_email_key") => "Email already registered".to_string(),
                Some("users_discord_id_key") => {
                    "External identity already linked to another user".to_string()
                }
                Some("sessions_token_hash_key") => "Session token already registered".to_string(),
                Some("approval_requests_pending_key") => {
                    "A pending request for this action already exists".to_string()
                }
                _ => "Record already exists".to_string(),
            })
        }
        _ => StoreError::Backend(anyhow::anyhow!("{}: {}", context, e)),
    }
}

const USER_COLUMNS: &str = "user_id, email, password_hash, discord_id, display_name, \
    authority_level, permissions, enabled, suspension_reason, suspended_by, suspended_utc, \
    two_factor_secret, two_factor_enabled, recovery_codes, created_utc, updated_utc";

const SESSION_COLUMNS: &str = "session_id, user_id, token_hash, ip_address, user_agent, \
    device_fingerprint, device_name, last_active_utc, remembered, expires_utc, created_utc";

const DEVICE_COLUMNS: &str =
    "device_id, user_id, fingerprint, device_name, ip_address, last_used_utc, created_utc";

const APPROVAL_COLUMNS: &str = "approval_id, requester_id, approver_id, action_type, \
    action_data, target_user_id, reason, status, expires_utc, created_utc, resolved_utc, \
    approver_comment";

#[derive(FromRow)]
struct UserRow {
    user_id: Uuid,
    email: String,
    password_hash: String,
    discord_id: Option<String>,
    display_name: String,
    authority_level: i16,
    permissions: Json<Vec<String>>,
    enabled: bool,
    suspension_reason: Option<String>,
    suspended_by: Option<Uuid>,
    suspended_utc: Option<DateTime<Utc>>,
    two_factor_secret: Option<String>,
    two_factor_enabled: bool,
    recovery_codes: Json<Vec<String>>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        let authority_level = AuthorityLevel::try_from(row.authority_level)
            .map_err(|e| StoreError::Backend(anyhow::anyhow!(e)))?;
        let suspension = match (row.suspension_reason, row.suspended_utc) {
            (Some(reason), Some(suspended_at)) => Some(Suspension {
                reason,
                suspended_by: row.suspended_by,
                suspended_at,
            }),
            _ => None,
        };
        Ok(User {
            user_id: row.user_id,
            email: row.email,
            password_hash: row.password_hash,
            discord_id: row.discord_id,
            display_name: row.display_name,
            authority_level,
            permissions: row.permissions.0.into_iter().collect::<BTreeSet<_>>(),
            enabled: row.enabled,
            suspension,
            two_factor_secret: row.two_factor_secret,
            two_factor_enabled: row.two_factor_enabled,
            recovery_codes: row.recovery_codes.0,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        })
    }
}

#[derive(FromRow)]
struct SessionRow {
    session_id: Uuid,
    user_id: Uuid,
    token_hash: String,
    ip_address: Option<String>,
    user_agent: Option<String>,
    device_fingerprint: Option<String>,
    device_name: Option<String>,
    last_active_utc: DateTime<Utc>,
    remembered: bool,
    expires_utc: DateTime<Utc>,
    created_utc: DateTime<Utc>,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Session {
            session_id: row.session_id,
            user_id: row.user_id,
            token_hash: row.token_hash,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            device_fingerprint: row.device_fingerprint,
            device_name: row.device_name,
            last_active_utc: row.last_active_utc,
            remembered: row.remembered,
            expires_utc: row.expires_utc,
            created_utc: row.created_utc,
        }
    }
}

#[derive(FromRow)]
struct DeviceRow {
    device_id: Uuid,
    user_id: Uuid,
    fingerprint: String,
    device_name: Option<String>,
    ip_address: Option<String>,
    last_used_utc: DateTime<Utc>,
    created_utc: DateTime<Utc>,
}

impl From<DeviceRow> for RememberedDevice {
    fn from(row: DeviceRow) -> Self {
        RememberedDevice {
            device_id: row.device_id,
            user_id: row.user_id,
            fingerprint: row.fingerprint,
            device_name: row.device_name,
            ip_address: row.ip_address,
            last_used_utc: row.last_used_utc,
            created_utc: row.created_utc,
        }
    }
}

#[derive(FromRow)]
struct ApprovalRow {
    approval_id: Uuid,
    requester_id: Uuid,
    approver_id: Option<Uuid>,
    action_type: String,
    action_data: Option<Json<Value>>,
    target_user_id: Option<Uuid>,
    reason: String,
    status: String,
    expires_utc: DateTime<Utc>,
    created_utc: DateTime<Utc>,
    resolved_utc: Option<DateTime<Utc>>,
    approver_comment: Option<String>,
}

impl TryFrom<ApprovalRow> for ApprovalRequest {
    type Error = StoreError;

    fn try_from(row: ApprovalRow) -> Result<Self, Self::Error> {
        let action = ApprovalAction::parse(&row.action_type, row.action_data.as_ref().map(|j| &j.0))
            .map_err(|e| StoreError::Backend(anyhow::anyhow!(e)))?;
        let status: ApprovalStatus = row
            .status
            .parse()
            .map_err(|e: String| StoreError::Backend(anyhow::anyhow!(e)))?;
        Ok(ApprovalRequest {
            approval_id: row.approval_id,
            requester_id: row.requester_id,
            approver_id: row.approver_id,
            action,
            target_user_id: row.target_user_id,
            reason: row.reason,
            status,
            expires_utc: row.expires_utc,
            created_utc: row.created_utc,
            resolved_utc: row.resolved_utc,
            approver_comment: row.approver_comment,
        })
    }
}

async fn apply_effect(
    tx: &mut Transaction<'static, Postgres>,
    effect: &ApprovalEffect,
    now: DateTime<Utc>,
) -> StoreResult<bool> {
    let affected = match effect {
        ApprovalEffect::DeleteUser { user_id } => sqlx::query("DELETE FROM users WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut **tx)
            .await
            .map_err(db_err("Failed to delete user"))?
            .rows_affected(),
        ApprovalEffect::Suspend {
            user_id,
            reason,
            actor_id,
            at,
        } => {
            let affected = sqlx::query(
                "UPDATE users SET suspension_reason = $2, suspended_by = $3, suspended_utc = $4, \
                 updated_utc = $5 WHERE user_id = $1",
            )
            .bind(user_id)
            .bind(reason)
            .bind(actor_id)
            .bind(at)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(db_err("Failed to suspend user"))?
            .rows_affected();
            delete_sessions_in(tx, *user_id).await?;
            affected
        }
        ApprovalEffect::Unsuspend { user_id } => sqlx::query(
            "UPDATE users SET suspension_reason = NULL, suspended_by = NULL, suspended_utc = NULL, \
             updated_utc = $2 WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(db_err("Failed to unsuspend user"))?
        .rows_affected(),
        ApprovalEffect::SetAuthority { user_id, level } => {
            let affected = sqlx::query(
                "UPDATE users SET authority_level = $2, updated_utc = $3 WHERE user_id = $1",
            )
            .bind(user_id)
            .bind(level.as_i16())
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(db_err("Failed to set authority"))?
            .rows_affected();
            delete_sessions_in(tx, *user_id).await?;
            affected
        }
        ApprovalEffect::ResetTwoFactor { user_id } => {
            let affected = sqlx::query(
                "UPDATE users SET two_factor_secret = NULL, two_factor_enabled = FALSE, \
                 recovery_codes = '[]'::jsonb, updated_utc = $2 WHERE user_id = $1",
            )
            .bind(user_id)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(db_err("Failed to reset two-factor"))?
            .rows_affected();
            sqlx::query("DELETE FROM remembered_devices WHERE user_id = $1")
                .bind(user_id)
                .execute(&mut **tx)
                .await
                .map_err(db_err("Failed to delete remembered devices"))?;
            affected
        }
    };
    Ok(affected > 0)
}

/// Writes only the columns `change` owns. `None` when a two-factor
/// precondition no longer holds.
async fn update_user_in(
    tx: &mut Transaction<'static, Postgres>,
    user_id: Uuid,
    change: &UserChange,
    at: DateTime<Utc>,
) -> StoreResult<Option<UserRow>> {
    let returning = format!(" RETURNING {}", USER_COLUMNS);
    let query = match change {
        UserChange::Profile {
            email,
            display_name,
            discord_id,
        } => sqlx::query_as::<_, UserRow>(&format!(
            "UPDATE users SET email = COALESCE($2, email), \
             display_name = COALESCE($3, display_name), \
             discord_id = CASE WHEN $4 THEN $5 ELSE discord_id END, \
             updated_utc = $6 WHERE user_id = $1{}",
            returning
        ))
        .bind(user_id)
        .bind(email)
        .bind(display_name)
        .bind(discord_id.is_some())
        .bind(discord_id.clone().flatten())
        .bind(at)
        .fetch_optional(&mut **tx)
        .await,
        UserChange::SetEnabled(enabled) => sqlx::query_as::<_, UserRow>(&format!(
            "UPDATE users SET enabled = $2, updated_utc = $3 WHERE user_id = $1{}",
            returning
        ))
        .bind(user_id)
        .bind(enabled)
        .bind(at)
        .fetch_optional(&mut **tx)
        .await,
        UserChange::SetAuthority(level) => sqlx::query_as::<_, UserRow>(&format!(
            "UPDATE users SET authority_level = $2, updated_utc = $3 WHERE user_id = $1{}",
            returning
        ))
        .bind(user_id)
        .bind(level.as_i16())
        .bind(at)
        .fetch_optional(&mut **tx)
        .await,
        UserChange::SetPermissions(grants) => sqlx::query_as::<_, UserRow>(&format!(
            "UPDATE users SET permissions = $2, updated_utc = $3 WHERE user_id = $1{}",
            returning
        ))
        .bind(user_id)
        .bind(Json(grants.iter().cloned().collect::<Vec<_>>()))
        .bind(at)
        .fetch_optional(&mut **tx)
        .await,
        UserChange::SetPasswordHash { password_hash, .. } => sqlx::query_as::<_, UserRow>(&format!(
            "UPDATE users SET password_hash = $2, updated_utc = $3 WHERE user_id = $1{}",
            returning
        ))
        .bind(user_id)
        .bind(password_hash)
        .bind(at)
        .fetch_optional(&mut **tx)
        .await,
        UserChange::StartTwoFactor { secret } => sqlx::query_as::<_, UserRow>(&format!(
            "UPDATE users SET two_factor_secret = $2, updated_utc = $3 \
             WHERE user_id = $1 AND two_factor_enabled = FALSE{}",
            returning
        ))
        .bind(user_id)
        .bind(secret)
        .bind(at)
        .fetch_optional(&mut **tx)
        .await,
        UserChange::EnableTwoFactor {
            secret,
            recovery_codes,
        } => sqlx::query_as::<_, UserRow>(&format!(
            "UPDATE users SET two_factor_enabled = TRUE, recovery_codes = $3, updated_utc = $4 \
             WHERE user_id = $1 AND two_factor_enabled = FALSE AND two_factor_secret = $2{}",
            returning
        ))
        .bind(user_id)
        .bind(secret)
        .bind(Json(recovery_codes))
        .bind(at)
        .fetch_optional(&mut **tx)
        .await,
        UserChange::ReplaceRecoveryCodes(codes) => sqlx::query_as::<_, UserRow>(&format!(
            "UPDATE users SET recovery_codes = $2, updated_utc = $3 \
             WHERE user_id = $1 AND two_factor_enabled = TRUE{}",
            returning
        ))
        .bind(user_id)
        .bind(Json(codes))
        .bind(at)
        .fetch_optional(&mut **tx)
        .await,
        UserChange::ClearTwoFactor => sqlx::query_as::<_, UserRow>(&format!(
            "UPDATE users SET two_factor_secret = NULL, two_factor_enabled = FALSE, \
             recovery_codes = '[]'::jsonb, updated_utc = $2 WHERE user_id = $1{}",
            returning
        ))
        .bind(user_id)
        .bind(at)
        .fetch_optional(&mut **tx)
        .await,
    };
    query.map_err(db_err("Failed to update user"))
}

async fn delete_sessions_in(tx: &mut Transaction<'static, Postgres>, user_id: Uuid) -> StoreResult<u64> {
    Ok(sqlx::query("DELETE FROM sessions WHERE user_id = $1")
        .bind(user_id)
        .execute(&mut **tx)
        .await
        .map_err(db_err("Failed to delete sessions"))?
        .rows_affected())
}

#[async_trait]
impl Store for PgStore {
    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err("Health check failed"))?;
        Ok(())
    }

    #[instrument(skip(self, user), fields(user_id = %user.user_id))]
    async fn insert_user(&self, user: &User) -> StoreResult<()> {
        let suspension = user.suspension.as_ref();
        sqlx::query(&format!(
            "INSERT INTO users ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
            USER_COLUMNS
        ))
        .bind(user.user_id)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.discord_id)
        .bind(&user.display_name)
        .bind(user.authority_level.as_i16())
        .bind(Json(user.permissions.iter().cloned().collect::<Vec<_>>()))
        .bind(user.enabled)
        .bind(suspension.map(|s| s.reason.clone()))
        .bind(suspension.and_then(|s| s.suspended_by))
        .bind(suspension.map(|s| s.suspended_at))
        .bind(&user.two_factor_secret)
        .bind(user.two_factor_enabled)
        .bind(Json(&user.recovery_codes))
        .bind(user.created_utc)
        .bind(user.updated_utc)
        .execute(&self.pool)
        .await
        .map_err(db_err("Failed to insert user"))?;
        Ok(())
    }

    async fn find_user_by_id(&self, user_id: Uuid) -> StoreResult<Option<User>> {
        sqlx::query_as::<_, UserRow>(&format!("SELECT {} FROM users WHERE user_id = $1", USER_COLUMNS))
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("Failed to get user"))?
            .map(User::try_from)
            .transpose()
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        sqlx::query_as::<_, UserRow>(&format!("SELECT {} FROM users WHERE email = $1", USER_COLUMNS))
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("Failed to get user by email"))?
            .map(User::try_from)
            .transpose()
    }

    async fn list_users(&self) -> StoreResult<Vec<User>> {
        sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {} FROM users ORDER BY created_utc, email",
            USER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("Failed to list users"))?
        .into_iter()
        .map(User::try_from)
        .collect()
    }

    #[instrument(skip(self, change))]
    async fn apply_user_change(
        &self,
        user_id: Uuid,
        change: &UserChange,
        at: DateTime<Utc>,
    ) -> StoreResult<UserChangeApplied> {
        let mut tx = self.begin().await?;

        // Serializes against logins, decisions and other edits of this user.
        let locked: Option<Uuid> =
            sqlx::query_scalar("SELECT user_id FROM users WHERE user_id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err("Failed to lock user"))?;
        if locked.is_none() {
            tx.rollback().await.ok();
            return Err(StoreError::NotFound("User".to_string()));
        }

        let row = update_user_in(&mut tx, user_id, change, at).await?;
        let Some(row) = row else {
            tx.rollback().await.ok();
            return Err(StoreError::Conflict(match change {
                UserChange::StartTwoFactor { .. } => "Two-factor authentication is already enabled",
                UserChange::EnableTwoFactor { .. } => "Two-factor setup changed; start again",
                _ => "Two-factor authentication is not enabled",
            }
            .to_string()));
        };

        let sessions_revoked = match change {
            UserChange::SetEnabled(false)
            | UserChange::SetAuthority(_)
            | UserChange::SetPermissions(_) => delete_sessions_in(&mut tx, user_id).await?,
            UserChange::SetPasswordHash { keep_session, .. } => sqlx::query(
                "DELETE FROM sessions WHERE user_id = $1 AND ($2::uuid IS NULL OR session_id <> $2)",
            )
            .bind(user_id)
            .bind(keep_session)
            .execute(&mut *tx)
            .await
            .map_err(db_err("Failed to delete sessions"))?
            .rows_affected(),
            _ => 0,
        };
        let devices_forgotten = match change {
            UserChange::ClearTwoFactor => sqlx::query("DELETE FROM remembered_devices WHERE user_id = $1")
                .bind(user_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err("Failed to delete remembered devices"))?
                .rows_affected(),
            _ => 0,
        };

        tx.commit().await.map_err(db_err("Failed to commit user change"))?;
        Ok(UserChangeApplied {
            user: User::try_from(row)?,
            sessions_revoked,
            devices_forgotten,
        })
    }

    async fn consume_recovery_code(&self, user_id: Uuid, code_hash: &str) -> StoreResult<bool> {
        // The row lock taken by UPDATE serializes concurrent attempts; the
        // loser re-evaluates the predicate and matches nothing.
        let affected = sqlx::query(
            "UPDATE users SET recovery_codes = recovery_codes - $2::text, updated_utc = NOW() \
             WHERE user_id = $1 AND recovery_codes ? $2::text",
        )
        .bind(user_id)
        .bind(code_hash)
        .execute(&self.pool)
        .await
        .map_err(db_err("Failed to consume recovery code"))?
        .rows_affected();
        Ok(affected == 1)
    }

    #[instrument(skip(self, session), fields(user_id = %session.user_id))]
    async fn insert_session_bounded(
        &self,
        session: &Session,
        max_sessions: usize,
    ) -> StoreResult<usize> {
        let mut tx = self.begin().await?;

        // Serializes concurrent logins of one user.
        sqlx::query("SELECT user_id FROM users WHERE user_id = $1 FOR UPDATE")
            .bind(session.user_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err("Failed to lock user"))?;

        let existing: Vec<Uuid> = sqlx::query_scalar(
            "SELECT session_id FROM sessions WHERE user_id = $1 \
             ORDER BY last_active_utc ASC, session_id ASC",
        )
        .bind(session.user_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err("Failed to list sessions"))?;

        let keep = max_sessions.saturating_sub(1);
        let evict: Vec<Uuid> = existing
            .iter()
            .take(existing.len().saturating_sub(keep))
            .copied()
            .collect();
        if !evict.is_empty() {
            sqlx::query("DELETE FROM sessions WHERE session_id = ANY($1)")
                .bind(&evict)
                .execute(&mut *tx)
                .await
                .map_err(db_err("Failed to evict sessions"))?;
        }

        sqlx::query(&format!(
            "INSERT INTO sessions ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            SESSION_COLUMNS
        ))
        .bind(session.session_id)
        .bind(session.user_id)
        .bind(&session.token_hash)
        .bind(&session.ip_address)
        .bind(&session.user_agent)
        .bind(&session.device_fingerprint)
        .bind(&session.device_name)
        .bind(session.last_active_utc)
        .bind(session.remembered)
        .bind(session.expires_utc)
        .bind(session.created_utc)
        .execute(&mut *tx)
        .await
        .map_err(db_err("Failed to insert session"))?;

        tx.commit().await.map_err(db_err("Failed to commit session"))?;
        Ok(evict.len())
    }

    async fn find_session_by_token_hash(&self, token_hash: &str) -> StoreResult<Option<Session>> {
        Ok(sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM sessions WHERE token_hash = $1",
            SESSION_COLUMNS
        ))
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("Failed to get session"))?
        .map(Session::from))
    }

    async fn find_session(&self, session_id: Uuid) -> StoreResult<Option<Session>> {
        Ok(sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM sessions WHERE session_id = $1",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("Failed to get session"))?
        .map(Session::from))
    }

    async fn touch_session(&self, session_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE sessions SET last_active_utc = $2 WHERE session_id = $1")
            .bind(session_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(db_err("Failed to touch session"))?;
        Ok(())
    }

    async fn list_sessions(&self, user_id: Uuid, now: DateTime<Utc>) -> StoreResult<Vec<Session>> {
        Ok(sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM sessions WHERE user_id = $1 AND expires_utc > $2 \
             ORDER BY last_active_utc DESC",
            SESSION_COLUMNS
        ))
        .bind(user_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("Failed to list sessions"))?
        .into_iter()
        .map(Session::from)
        .collect())
    }

    async fn delete_session(&self, session_id: Uuid) -> StoreResult<bool> {
        let affected = sqlx::query("DELETE FROM sessions WHERE session_id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(db_err("Failed to delete session"))?
            .rows_affected();
        Ok(affected > 0)
    }

    async fn delete_user_sessions(
        &self,
        user_id: Uuid,
        except: Option<Uuid>,
    ) -> StoreResult<u64> {
        Ok(sqlx::query(
            "DELETE FROM sessions WHERE user_id = $1 AND ($2::uuid IS NULL OR session_id <> $2)",
        )
        .bind(user_id)
        .bind(except)
        .execute(&self.pool)
        .await
        .map_err(db_err("Failed to delete user sessions"))?
        .rows_affected())
    }

    async fn sweep_sessions(
        &self,
        now: DateTime<Utc>,
        idle_cutoff: DateTime<Utc>,
    ) -> StoreResult<u64> {
        Ok(sqlx::query(
            "DELETE FROM sessions WHERE expires_utc <= $1 \
             OR (remembered = FALSE AND last_active_utc <= $2)",
        )
        .bind(now)
        .bind(idle_cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_err("Failed to sweep sessions"))?
        .rows_affected())
    }

    async fn find_device(
        &self,
        user_id: Uuid,
        fingerprint: &str,
    ) -> StoreResult<Option<RememberedDevice>> {
        Ok(sqlx::query_as::<_, DeviceRow>(&format!(
            "SELECT {} FROM remembered_devices WHERE user_id = $1 AND fingerprint = $2",
            DEVICE_COLUMNS
        ))
        .bind(user_id)
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("Failed to get device"))?
        .map(RememberedDevice::from))
    }

    async fn upsert_device(&self, device: &RememberedDevice) -> StoreResult<RememberedDevice> {
        Ok(sqlx::query_as::<_, DeviceRow>(&format!(
            r#"
            INSERT INTO remembered_devices ({cols}) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user_id, fingerprint) DO UPDATE SET
                device_name = COALESCE(EXCLUDED.device_name, remembered_devices.device_name),
                ip_address = EXCLUDED.ip_address,
                last_used_utc = EXCLUDED.last_used_utc
            RETURNING {cols}
            "#,
            cols = DEVICE_COLUMNS
        ))
        .bind(device.device_id)
        .bind(device.user_id)
        .bind(&device.fingerprint)
        .bind(&device.device_name)
        .bind(&device.ip_address)
        .bind(device.last_used_utc)
        .bind(device.created_utc)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("Failed to upsert device"))?
        .into())
    }

    async fn touch_device(&self, device_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE remembered_devices SET last_used_utc = $2 WHERE device_id = $1")
            .bind(device_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(db_err("Failed to touch device"))?;
        Ok(())
    }

    async fn list_devices(&self, user_id: Uuid) -> StoreResult<Vec<RememberedDevice>> {
        Ok(sqlx::query_as::<_, DeviceRow>(&format!(
            "SELECT {} FROM remembered_devices WHERE user_id = $1 ORDER BY last_used_utc DESC",
            DEVICE_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("Failed to list devices"))?
        .into_iter()
        .map(RememberedDevice::from)
        .collect())
    }

    async fn delete_device(&self, user_id: Uuid, device_id: Uuid) -> StoreResult<bool> {
        let affected =
            sqlx::query("DELETE FROM remembered_devices WHERE user_id = $1 AND device_id = $2")
                .bind(user_id)
                .bind(device_id)
                .execute(&self.pool)
                .await
                .map_err(db_err("Failed to delete device"))?
                .rows_affected();
        Ok(affected > 0)
    }

    async fn delete_user_devices(&self, user_id: Uuid) -> StoreResult<u64> {
        Ok(sqlx::query("DELETE FROM remembered_devices WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(db_err("Failed to delete devices"))?
            .rows_affected())
    }

    async fn insert_approval(&self, approval: &ApprovalRequest) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO approval_requests ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            APPROVAL_COLUMNS
        ))
        .bind(approval.approval_id)
        .bind(approval.requester_id)
        .bind(approval.approver_id)
        .bind(approval.action.action_type())
        .bind(approval.action.action_data().map(Json))
        .bind(approval.target_user_id)
        .bind(&approval.reason)
        .bind(approval.status.as_str())
        .bind(approval.expires_utc)
        .bind(approval.created_utc)
        .bind(approval.resolved_utc)
        .bind(&approval.approver_comment)
        .execute(&self.pool)
        .await
        .map_err(db_err("Failed to insert approval request"))?;
        Ok(())
    }

    async fn find_approval(&self, approval_id: Uuid) -> StoreResult<Option<ApprovalRequest>> {
        sqlx::query_as::<_, ApprovalRow>(&format!(
            "SELECT {} FROM approval_requests WHERE approval_id = $1",
            APPROVAL_COLUMNS
        ))
        .bind(approval_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("Failed to get approval request"))?
        .map(ApprovalRequest::try_from)
        .transpose()
    }

    async fn list_approvals(
        &self,
        status: Option<ApprovalStatus>,
    ) -> StoreResult<Vec<ApprovalRequest>> {
        sqlx::query_as::<_, ApprovalRow>(&format!(
            "SELECT {} FROM approval_requests WHERE ($1::text IS NULL OR status = $1) \
             ORDER BY created_utc DESC",
            APPROVAL_COLUMNS
        ))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("Failed to list approval requests"))?
        .into_iter()
        .map(ApprovalRequest::try_from)
        .collect()
    }

    async fn expire_overdue_approvals(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        Ok(sqlx::query(
            "UPDATE approval_requests SET status = 'expired', resolved_utc = $1 \
             WHERE status = 'pending' AND expires_utc < $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err("Failed to expire approval requests"))?
        .rows_affected())
    }

    async fn expire_approval(&self, approval_id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let affected = sqlx::query(
            "UPDATE approval_requests SET status = 'expired', resolved_utc = $2 \
             WHERE approval_id = $1 AND status = 'pending'",
        )
        .bind(approval_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err("Failed to expire approval request"))?
        .rows_affected();
        Ok(affected == 1)
    }

    #[instrument(skip(self, commit), fields(approval_id = %commit.approval_id))]
    async fn commit_decision(&self, commit: &DecisionCommit) -> StoreResult<bool> {
        let mut tx = self.begin().await?;

        let affected = sqlx::query(
            "UPDATE approval_requests SET status = $2, approver_id = $3, approver_comment = $4, \
             resolved_utc = $5 WHERE approval_id = $1 AND status = 'pending'",
        )
        .bind(commit.approval_id)
        .bind(commit.status.as_str())
        .bind(commit.approver_id)
        .bind(&commit.comment)
        .bind(commit.resolved_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err("Failed to resolve approval request"))?
        .rows_affected();

        if affected == 0 {
            let exists: Option<Uuid> =
                sqlx::query_scalar("SELECT approval_id FROM approval_requests WHERE approval_id = $1")
                    .bind(commit.approval_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(db_err("Failed to get approval request"))?;
            tx.rollback().await.ok();
            return match exists {
                Some(_) => Ok(false),
                None => Err(StoreError::NotFound("Approval request".to_string())),
            };
        }

        if let Some(effect) = &commit.effect {
            if !apply_effect(&mut tx, effect, commit.resolved_at).await? {
                tx.rollback().await.ok();
                return Err(StoreError::NotFound("User".to_string()));
            }
        }

        tx.commit().await.map_err(db_err("Failed to commit decision"))?;
        Ok(true)
    }

    async fn append_audit(&self, entry: &AuditLogEntry) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO audit_log (entry_id, actor_user_id, action, target, details, ip_address, created_utc) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(entry.entry_id)
        .bind(entry.actor_user_id)
        .bind(&entry.action)
        .bind(&entry.target)
        .bind(&entry.details)
        .bind(&entry.ip_address)
        .bind(entry.created_utc)
        .execute(&self.pool)
        .await
        .map_err(db_err("Failed to append audit entry"))?;
        Ok(())
    }
}
