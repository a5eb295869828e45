//! In-process store for tests and local development (`DATABASE_URL=memory://`).
//!
//! All state sits behind one mutex, so every trait method is trivially
//! atomic with respect to every other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::store::{
    ApprovalEffect, DecisionCommit, Store, StoreError, StoreResult, UserChange, UserChangeApplied,
};
use crate::models::{
    ApprovalRequest, ApprovalStatus, AuditLogEntry, RememberedDevice, Session, Suspension, User,
};

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    sessions: HashMap<Uuid, Session>,
    devices: HashMap<Uuid, RememberedDevice>,
    approvals: HashMap<Uuid, ApprovalRequest>,
    audit: Vec<AuditLogEntry>,
}

impl Inner {
    fn uniqueness_conflict(&self, user: &User) -> Option<String> {
        self.users
            .values()
            .filter(|u| u.user_id != user.user_id)
            .find_map(|u| {
                if u.email == user.email {
                    Some("Email already registered".to_string())
                } else if user.discord_id.is_some() && u.discord_id == user.discord_id {
                    Some("External identity already linked to another user".to_string())
                } else {
                    None
                }
            })
    }

    fn delete_user_sessions(&mut self, user_id: Uuid, except: Option<Uuid>) -> u64 {
        let before = self.sessions.len();
        self.sessions
            .retain(|id, s| s.user_id != user_id || Some(*id) == except);
        (before - self.sessions.len()) as u64
    }

    fn delete_user_devices(&mut self, user_id: Uuid) -> u64 {
        let before = self.devices.len();
        self.devices.retain(|_, d| d.user_id != user_id);
        (before - self.devices.len()) as u64
    }

    fn has_pending_duplicate(&self, approval: &ApprovalRequest) -> bool {
        self.approvals.values().any(|a| {
            a.status == ApprovalStatus::Pending
                && a.target_user_id == approval.target_user_id
                && a.action.action_type() == approval.action.action_type()
        })
    }

    fn apply_effect(&mut self, effect: &ApprovalEffect, now: DateTime<Utc>) {
        match effect {
            ApprovalEffect::DeleteUser { user_id } => {
                self.users.remove(user_id);
                self.delete_user_sessions(*user_id, None);
                self.delete_user_devices(*user_id);
            }
            ApprovalEffect::Suspend {
                user_id,
                reason,
                actor_id,
                at,
            } => {
                if let Some(user) = self.users.get_mut(user_id) {
                    user.suspension = Some(Suspension {
                        reason: reason.clone(),
                        suspended_by: Some(*actor_id),
                        suspended_at: *at,
                    });
                    user.updated_utc = now;
                }
                self.delete_user_sessions(*user_id, None);
            }
            ApprovalEffect::Unsuspend { user_id } => {
                if let Some(user) = self.users.get_mut(user_id) {
                    user.suspension = None;
                    user.updated_utc = now;
                }
            }
            ApprovalEffect::SetAuthority { user_id, level } => {
                if let Some(user) = self.users.get_mut(user_id) {
                    user.authority_level = *level;
                    user.updated_utc = now;
                }
                self.delete_user_sessions(*user_id, None);
            }
            ApprovalEffect::ResetTwoFactor { user_id } => {
                if let Some(user) = self.users.get_mut(user_id) {
                    user.clear_two_factor();
                    user.updated_utc = now;
                }
                self.delete_user_devices(*user_id);
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("Memory store mutex poisoned: {}", e)))
    }

    /// Snapshot of the audit log, oldest first.
    pub fn audit_entries(&self) -> Vec<AuditLogEntry> {
        self.lock().map(|g| g.audit.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn health_check(&self) -> StoreResult<()> {
        self.lock().map(|_| ())
    }

    async fn insert_user(&self, user: &User) -> StoreResult<()> {
        let mut inner = self.lock()?;
        if inner.users.contains_key(&user.user_id) {
            return Err(StoreError::Conflict("User already exists".to_string()));
        }
        if let Some(conflict) = inner.uniqueness_conflict(user) {
            return Err(StoreError::Conflict(conflict));
        }
        inner.users.insert(user.user_id, user.clone());
        Ok(())
    }

    async fn find_user_by_id(&self, user_id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.lock()?.users.get(&user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        Ok(self
            .lock()?
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn list_users(&self) -> StoreResult<Vec<User>> {
        let mut users: Vec<User> = self.lock()?.users.values().cloned().collect();
        users.sort_by(|a, b| a.created_utc.cmp(&b.created_utc).then(a.email.cmp(&b.email)));
        Ok(users)
    }

    async fn apply_user_change(
        &self,
        user_id: Uuid,
        change: &UserChange,
        at: DateTime<Utc>,
    ) -> StoreResult<UserChangeApplied> {
        let mut inner = self.lock()?;
        let mut user = inner
            .users
            .get(&user_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("User".to_string()))?;

        let mut revoke_sessions = None;
        let mut forget_devices = false;
        match change {
            UserChange::Profile {
                email,
                display_name,
                discord_id,
            } => {
                if let Some(email) = email {
                    user.email = email.clone();
                }
                if let Some(name) = display_name {
                    user.display_name = name.clone();
                }
                if let Some(discord_id) = discord_id {
                    user.discord_id = discord_id.clone();
                }
                if let Some(conflict) = inner.uniqueness_conflict(&user) {
                    return Err(StoreError::Conflict(conflict));
                }
            }
            UserChange::SetEnabled(enabled) => {
                user.enabled = *enabled;
                if !enabled {
                    revoke_sessions = Some(None);
                }
            }
            UserChange::SetAuthority(level) => {
                user.authority_level = *level;
                revoke_sessions = Some(None);
            }
            UserChange::SetPermissions(grants) => {
                user.permissions = grants.clone();
                revoke_sessions = Some(None);
            }
            UserChange::SetPasswordHash {
                password_hash,
                keep_session,
            } => {
                user.password_hash = password_hash.clone();
                revoke_sessions = Some(*keep_session);
            }
            UserChange::StartTwoFactor { secret } => {
                if user.two_factor_enabled {
                    return Err(StoreError::Conflict(
                        "Two-factor authentication is already enabled".to_string(),
                    ));
                }
                user.two_factor_secret = Some(secret.clone());
            }
            UserChange::EnableTwoFactor {
                secret,
                recovery_codes,
            } => {
                if user.two_factor_enabled || user.two_factor_secret.as_ref() != Some(secret) {
                    return Err(StoreError::Conflict(
                        "Two-factor setup changed; start again".to_string(),
                    ));
                }
                user.two_factor_enabled = true;
                user.recovery_codes = recovery_codes.clone();
            }
            UserChange::ReplaceRecoveryCodes(codes) => {
                if !user.two_factor_enabled {
                    return Err(StoreError::Conflict(
                        "Two-factor authentication is not enabled".to_string(),
                    ));
                }
                user.recovery_codes = codes.clone();
            }
            UserChange::ClearTwoFactor => {
                user.clear_two_factor();
                forget_devices = true;
            }
        }
        user.updated_utc = at;
        inner.users.insert(user_id, user.clone());

        let sessions_revoked = match revoke_sessions {
            Some(except) => inner.delete_user_sessions(user_id, except),
            None => 0,
        };
        let devices_forgotten = if forget_devices {
            inner.delete_user_devices(user_id)
        } else {
            0
        };
        Ok(UserChangeApplied {
            user,
            sessions_revoked,
            devices_forgotten,
        })
    }

    async fn consume_recovery_code(&self, user_id: Uuid, code_hash: &str) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        let Some(user) = inner.users.get_mut(&user_id) else {
            return Ok(false);
        };
        let before = user.recovery_codes.len();
        user.recovery_codes.retain(|c| c != code_hash);
        let consumed = user.recovery_codes.len() < before;
        if consumed {
            user.updated_utc = Utc::now();
        }
        Ok(consumed)
    }

    async fn insert_session_bounded(
        &self,
        session: &Session,
        max_sessions: usize,
    ) -> StoreResult<usize> {
        let mut inner = self.lock()?;
        if inner
            .sessions
            .values()
            .any(|s| s.token_hash == session.token_hash)
        {
            return Err(StoreError::Conflict("Session token already registered".to_string()));
        }

        let mut existing: Vec<(DateTime<Utc>, Uuid)> = inner
            .sessions
            .values()
            .filter(|s| s.user_id == session.user_id)
            .map(|s| (s.last_active_utc, s.session_id))
            .collect();
        existing.sort();

        let keep = max_sessions.saturating_sub(1);
        let evict = existing.len().saturating_sub(keep);
        for (_, id) in existing.iter().take(evict) {
            inner.sessions.remove(id);
        }

        inner.sessions.insert(session.session_id, session.clone());
        Ok(evict)
    }

    async fn find_session_by_token_hash(&self, token_hash: &str) -> StoreResult<Option<Session>> {
        Ok(self
            .lock()?
            .sessions
            .values()
            .find(|s| s.token_hash == token_hash)
            .cloned())
    }

    async fn find_session(&self, session_id: Uuid) -> StoreResult<Option<Session>> {
        Ok(self.lock()?.sessions.get(&session_id).cloned())
    }

    async fn touch_session(&self, session_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        if let Some(session) = self.lock()?.sessions.get_mut(&session_id) {
            session.last_active_utc = at;
        }
        Ok(())
    }

    async fn list_sessions(&self, user_id: Uuid, now: DateTime<Utc>) -> StoreResult<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .lock()?
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && s.expires_utc > now)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.last_active_utc.cmp(&a.last_active_utc));
        Ok(sessions)
    }

    async fn delete_session(&self, session_id: Uuid) -> StoreResult<bool> {
        Ok(self.lock()?.sessions.remove(&session_id).is_some())
    }

    async fn delete_user_sessions(
        &self,
        user_id: Uuid,
        except: Option<Uuid>,
    ) -> StoreResult<u64> {
        Ok(self.lock()?.delete_user_sessions(user_id, except))
    }

    async fn sweep_sessions(
        &self,
        now: DateTime<Utc>,
        idle_cutoff: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut inner = self.lock()?;
        let before = inner.sessions.len();
        inner.sessions.retain(|_, s| {
            s.expires_utc > now && (s.remembered || s.last_active_utc > idle_cutoff)
        });
        Ok((before - inner.sessions.len()) as u64)
    }

    async fn find_device(
        &self,
        user_id: Uuid,
        fingerprint: &str,
    ) -> StoreResult<Option<RememberedDevice>> {
        Ok(self
            .lock()?
            .devices
            .values()
            .find(|d| d.user_id == user_id && d.fingerprint == fingerprint)
            .cloned())
    }

    async fn upsert_device(&self, device: &RememberedDevice) -> StoreResult<RememberedDevice> {
        let mut inner = self.lock()?;
        if let Some(existing) = inner
            .devices
            .values_mut()
            .find(|d| d.user_id == device.user_id && d.fingerprint == device.fingerprint)
        {
            existing.device_name = device.device_name.clone().or(existing.device_name.take());
            existing.ip_address = device.ip_address.clone();
            existing.last_used_utc = device.last_used_utc;
            return Ok(existing.clone());
        }
        inner.devices.insert(device.device_id, device.clone());
        Ok(device.clone())
    }

    async fn touch_device(&self, device_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        if let Some(device) = self.lock()?.devices.get_mut(&device_id) {
            device.last_used_utc = at;
        }
        Ok(())
    }

    async fn list_devices(&self, user_id: Uuid) -> StoreResult<Vec<RememberedDevice>> {
        let mut devices: Vec<RememberedDevice> = self
            .lock()?
            .devices
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();
        devices.sort_by(|a, b| b.last_used_utc.cmp(&a.last_used_utc));
        Ok(devices)
    }

    async fn delete_device(&self, user_id: Uuid, device_id: Uuid) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        let owned = inner
            .devices
            .get(&device_id)
            .map_or(false, |d| d.user_id == user_id);
        if owned {
            inner.devices.remove(&device_id);
        }
        Ok(owned)
    }

    async fn delete_user_devices(&self, user_id: Uuid) -> StoreResult<u64> {
        Ok(self.lock()?.delete_user_devices(user_id))
    }

    async fn insert_approval(&self, approval: &ApprovalRequest) -> StoreResult<()> {
        let mut inner = self.lock()?;
        if inner.approvals.contains_key(&approval.approval_id) {
            return Err(StoreError::Conflict("Approval request already exists".to_string()));
        }
        if approval.status == ApprovalStatus::Pending && inner.has_pending_duplicate(approval) {
            return Err(StoreError::Conflict(
                "A pending request for this action already exists".to_string(),
            ));
        }
        inner.approvals.insert(approval.approval_id, approval.clone());
        Ok(())
    }

    async fn find_approval(&self, approval_id: Uuid) -> StoreResult<Option<ApprovalRequest>> {
        Ok(self.lock()?.approvals.get(&approval_id).cloned())
    }

    async fn list_approvals(
        &self,
        status: Option<ApprovalStatus>,
    ) -> StoreResult<Vec<ApprovalRequest>> {
        let mut approvals: Vec<ApprovalRequest> = self
            .lock()?
            .approvals
            .values()
            .filter(|a| status.map_or(true, |s| a.status == s))
            .cloned()
            .collect();
        approvals.sort_by(|a, b| b.created_utc.cmp(&a.created_utc));
        Ok(approvals)
    }

    async fn expire_overdue_approvals(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.lock()?;
        let mut count = 0;
        for approval in inner.approvals.values_mut() {
            if approval.is_overdue(now) {
                approval.status = ApprovalStatus::Expired;
                approval.resolved_utc = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn expire_approval(&self, approval_id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        match inner.approvals.get_mut(&approval_id) {
            Some(a) if a.status == ApprovalStatus::Pending => {
                a.status = ApprovalStatus::Expired;
                a.resolved_utc = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn commit_decision(&self, commit: &DecisionCommit) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        match inner.approvals.get(&commit.approval_id) {
            None => return Err(StoreError::NotFound("Approval request".to_string())),
            Some(a) if a.status != ApprovalStatus::Pending => return Ok(false),
            Some(_) => {}
        }

        if let Some(effect) = &commit.effect {
            if !inner.users.contains_key(&effect.user_id()) {
                return Err(StoreError::NotFound("User".to_string()));
            }
            inner.apply_effect(effect, commit.resolved_at);
        }

        if let Some(approval) = inner.approvals.get_mut(&commit.approval_id) {
            approval.status = commit.status;
            approval.approver_id = Some(commit.approver_id);
            approval.approver_comment = commit.comment.clone();
            approval.resolved_utc = Some(commit.resolved_at);
        }
        Ok(true)
    }

    async fn append_audit(&self, entry: &AuditLogEntry) -> StoreResult<()> {
        self.lock()?.audit.push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ApprovalAction, AuthorityLevel};
    use chrono::Duration;

    fn user(email: &str) -> User {
        User::new(
            email.to_string(),
            "hash".to_string(),
            "Test".to_string(),
            AuthorityLevel::User,
        )
    }

    fn session(user_id: Uuid, token_hash: &str, last_active: DateTime<Utc>) -> Session {
        Session {
            session_id: Uuid::new_v4(),
            user_id,
            token_hash: token_hash.to_string(),
            ip_address: None,
            user_agent: None,
            device_fingerprint: None,
            device_name: None,
            last_active_utc: last_active,
            remembered: false,
            expires_utc: last_active + Duration::days(7),
            created_utc: last_active,
        }
    }

    #[tokio::test]
    async fn test_email_and_external_id_are_unique() {
        let store = MemoryStore::new();
        let mut a = user("a@x.com");
        a.discord_id = Some("42".to_string());
        store.insert_user(&a).await.unwrap();

        let dup_email = user("a@x.com");
        assert!(matches!(
            store.insert_user(&dup_email).await,
            Err(StoreError::Conflict(_))
        ));

        let mut dup_discord = user("b@x.com");
        dup_discord.discord_id = Some("42".to_string());
        assert!(matches!(
            store.insert_user(&dup_discord).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_bounded_insert_evicts_oldest() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        let now = Utc::now();
        let oldest = session(user_id, "t1", now - Duration::minutes(3));
        let middle = session(user_id, "t2", now - Duration::minutes(2));
        store.insert_session_bounded(&oldest, 2).await.unwrap();
        store.insert_session_bounded(&middle, 2).await.unwrap();

        let newest = session(user_id, "t3", now);
        let evicted = store.insert_session_bounded(&newest, 2).await.unwrap();
        assert_eq!(evicted, 1);

        let ids: Vec<Uuid> = store
            .list_sessions(user_id, now)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(ids, vec![newest.session_id, middle.session_id]);
    }

    #[tokio::test]
    async fn test_sweep_keeps_remembered_idle_sessions() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        let now = Utc::now();
        let idle = session(user_id, "idle", now - Duration::minutes(30));
        let mut remembered = session(user_id, "remembered", now - Duration::minutes(30));
        remembered.remembered = true;
        let active = session(user_id, "active", now);
        for s in [&idle, &remembered, &active] {
            store.insert_session_bounded(s, 10).await.unwrap();
        }

        let swept = store
            .sweep_sessions(now, now - Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(swept, 1);
        assert!(store.find_session(idle.session_id).await.unwrap().is_none());
        assert!(store.find_session(remembered.session_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_recovery_code_consumed_once() {
        let store = MemoryStore::new();
        let mut u = user("a@x.com");
        u.recovery_codes = vec!["h1".to_string(), "h2".to_string()];
        store.insert_user(&u).await.unwrap();

        assert!(store.consume_recovery_code(u.user_id, "h1").await.unwrap());
        assert!(!store.consume_recovery_code(u.user_id, "h1").await.unwrap());
        let stored = store.find_user_by_id(u.user_id).await.unwrap().unwrap();
        assert_eq!(stored.recovery_codes, vec!["h2".to_string()]);
    }

    #[tokio::test]
    async fn test_commit_decision_is_single_shot() {
        let store = MemoryStore::new();
        let target = user("t@x.com");
        store.insert_user(&target).await.unwrap();
        let approval = ApprovalRequest::new(
            Uuid::new_v4(),
            ApprovalAction::UnsuspendUser,
            Some(target.user_id),
            "appeal".to_string(),
            Duration::hours(24),
        );
        store.insert_approval(&approval).await.unwrap();

        let commit = DecisionCommit {
            approval_id: approval.approval_id,
            approver_id: Uuid::new_v4(),
            status: ApprovalStatus::Approved,
            comment: None,
            resolved_at: Utc::now(),
            effect: Some(ApprovalEffect::Unsuspend {
                user_id: target.user_id,
            }),
        };
        assert!(store.commit_decision(&commit).await.unwrap());
        assert!(!store.commit_decision(&commit).await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_with_missing_target_changes_nothing() {
        let store = MemoryStore::new();
        let approval = ApprovalRequest::new(
            Uuid::new_v4(),
            ApprovalAction::DeleteUser,
            Some(Uuid::new_v4()),
            "cleanup".to_string(),
            Duration::hours(24),
        );
        store.insert_approval(&approval).await.unwrap();

        let commit = DecisionCommit {
            approval_id: approval.approval_id,
            approver_id: Uuid::new_v4(),
            status: ApprovalStatus::Approved,
            comment: None,
            resolved_at: Utc::now(),
            effect: Some(ApprovalEffect::DeleteUser {
                user_id: approval.target_user_id.unwrap(),
            }),
        };
        assert!(matches!(
            store.commit_decision(&commit).await,
            Err(StoreError::NotFound(_))
        ));
        let stored = store.find_approval(approval.approval_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ApprovalStatus::Pending);
    }

    fn profile_rename(name: &str) -> UserChange {
        UserChange::Profile {
            email: None,
            display_name: Some(name.to_string()),
            discord_id: None,
        }
    }

    #[tokio::test]
    async fn test_profile_edit_after_code_use_keeps_code_spent() {
        let store = MemoryStore::new();
        let mut u = user("a@x.com");
        u.two_factor_enabled = true;
        u.recovery_codes = vec!["h1".to_string(), "h2".to_string()];
        store.insert_user(&u).await.unwrap();

        // An edit prepared from a read taken before the code was used.
        let before = store.find_user_by_id(u.user_id).await.unwrap().unwrap();
        assert!(store.consume_recovery_code(u.user_id, "h1").await.unwrap());
        store
            .apply_user_change(before.user_id, &profile_rename("Renamed"), Utc::now())
            .await
            .unwrap();
        store
            .apply_user_change(
                before.user_id,
                &UserChange::SetPasswordHash {
                    password_hash: "new-hash".to_string(),
                    keep_session: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();

        assert!(!store.consume_recovery_code(u.user_id, "h1").await.unwrap());
        let stored = store.find_user_by_id(u.user_id).await.unwrap().unwrap();
        assert_eq!(stored.recovery_codes, vec!["h2".to_string()]);
        assert_eq!(stored.display_name, "Renamed");
    }

    #[tokio::test]
    async fn test_account_edits_do_not_lift_a_committed_suspension() {
        let store = MemoryStore::new();
        let target = user("t@x.com");
        store.insert_user(&target).await.unwrap();
        let approval = ApprovalRequest::new(
            Uuid::new_v4(),
            ApprovalAction::SuspendUser { reason: None },
            Some(target.user_id),
            "abuse".to_string(),
            Duration::hours(24),
        );
        store.insert_approval(&approval).await.unwrap();

        let before = store.find_user_by_id(target.user_id).await.unwrap().unwrap();
        assert!(before.suspension.is_none());
        let commit = DecisionCommit {
            approval_id: approval.approval_id,
            approver_id: Uuid::new_v4(),
            status: ApprovalStatus::Approved,
            comment: None,
            resolved_at: Utc::now(),
            effect: Some(ApprovalEffect::Suspend {
                user_id: target.user_id,
                reason: "abuse".to_string(),
                actor_id: approval.requester_id,
                at: Utc::now(),
            }),
        };
        assert!(store.commit_decision(&commit).await.unwrap());

        for change in [
            profile_rename("Renamed"),
            UserChange::SetEnabled(true),
            UserChange::SetPermissions(Default::default()),
        ] {
            store
                .apply_user_change(before.user_id, &change, Utc::now())
                .await
                .unwrap();
        }
        let stored = store.find_user_by_id(target.user_id).await.unwrap().unwrap();
        assert!(stored.is_suspended());
        assert!(!stored.can_authenticate());
    }

    #[tokio::test]
    async fn test_claim_changes_revoke_sessions_in_the_same_write() {
        let store = MemoryStore::new();
        let u = user("a@x.com");
        store.insert_user(&u).await.unwrap();
        let now = Utc::now();
        let kept = session(u.user_id, "t1", now);
        store.insert_session_bounded(&kept, 10).await.unwrap();
        store
            .insert_session_bounded(&session(u.user_id, "t2", now), 10)
            .await
            .unwrap();

        let applied = store
            .apply_user_change(
                u.user_id,
                &UserChange::SetPasswordHash {
                    password_hash: "new-hash".to_string(),
                    keep_session: Some(kept.session_id),
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(applied.sessions_revoked, 1);
        assert!(store.find_session(kept.session_id).await.unwrap().is_some());

        let applied = store
            .apply_user_change(u.user_id, &UserChange::SetAuthority(AuthorityLevel::Moderator), now)
            .await
            .unwrap();
        assert_eq!(applied.sessions_revoked, 1);
        assert_eq!(applied.user.authority_level, AuthorityLevel::Moderator);
        assert!(store.list_sessions(u.user_id, now).await.unwrap().is_empty());

        let applied = store
            .apply_user_change(u.user_id, &profile_rename("Quiet"), now)
            .await
            .unwrap();
        assert_eq!(applied.sessions_revoked, 0);
    }

    #[tokio::test]
    async fn test_clearing_two_factor_forgets_devices() {
        let store = MemoryStore::new();
        let mut u = user("a@x.com");
        u.two_factor_secret = Some("SECRET".to_string());
        u.two_factor_enabled = true;
        u.recovery_codes = vec!["h1".to_string()];
        store.insert_user(&u).await.unwrap();
        let now = Utc::now();
        store
            .upsert_device(&RememberedDevice {
                device_id: Uuid::new_v4(),
                user_id: u.user_id,
                fingerprint: "fp".to_string(),
                device_name: None,
                ip_address: None,
                last_used_utc: now,
                created_utc: now,
            })
            .await
            .unwrap();

        let applied = store
            .apply_user_change(u.user_id, &UserChange::ClearTwoFactor, now)
            .await
            .unwrap();
        assert_eq!(applied.devices_forgotten, 1);
        assert!(!applied.user.two_factor_enabled);
        assert!(applied.user.recovery_codes.is_empty());
        assert!(store.list_devices(u.user_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_two_factor_writes_check_current_state() {
        let store = MemoryStore::new();
        let u = user("a@x.com");
        store.insert_user(&u).await.unwrap();
        let now = Utc::now();

        store
            .apply_user_change(u.user_id, &UserChange::StartTwoFactor { secret: "S1".to_string() }, now)
            .await
            .unwrap();
        // A second setup replaced the secret the code was checked against.
        store
            .apply_user_change(u.user_id, &UserChange::StartTwoFactor { secret: "S2".to_string() }, now)
            .await
            .unwrap();
        let stale_enable = UserChange::EnableTwoFactor {
            secret: "S1".to_string(),
            recovery_codes: vec!["h1".to_string()],
        };
        assert!(matches!(
            store.apply_user_change(u.user_id, &stale_enable, now).await,
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            store
                .apply_user_change(u.user_id, &UserChange::ReplaceRecoveryCodes(vec![]), now)
                .await,
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            store
                .apply_user_change(Uuid::new_v4(), &UserChange::SetEnabled(false), now)
                .await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_one_pending_request_per_action_and_target() {
        let store = MemoryStore::new();
        let target = Uuid::new_v4();
        let request = |action| {
            ApprovalRequest::new(
                Uuid::new_v4(),
                action,
                Some(target),
                "reason".to_string(),
                Duration::hours(24),
            )
        };
        let first = request(ApprovalAction::DeleteUser);
        store.insert_approval(&first).await.unwrap();
        assert!(matches!(
            store.insert_approval(&request(ApprovalAction::DeleteUser)).await,
            Err(StoreError::Conflict(_))
        ));
        store
            .insert_approval(&request(ApprovalAction::UnsuspendUser))
            .await
            .unwrap();

        store.expire_approval(first.approval_id, Utc::now()).await.unwrap();
        store
            .insert_approval(&request(ApprovalAction::DeleteUser))
            .await
            .unwrap();
    }
}
