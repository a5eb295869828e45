//! Session registry: live sessions per user plus remembered devices.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::error::ServiceError;
use super::store::Store;
use crate::config::SessionPolicy;
use crate::models::{RememberedDevice, Session};

/// Input for a new session. The raw token never reaches the registry.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub device_fingerprint: Option<String>,
    pub device_name: Option<String>,
    pub remembered: bool,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn Store>,
    policy: SessionPolicy,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn Store>, policy: SessionPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// Persist a session, evicting the user's least recently active
    /// sessions so that at most `max_sessions_per_user` remain.
    pub async fn create(&self, new: NewSession) -> Result<Session, ServiceError> {
        let now = Utc::now();
        let session = Session {
            session_id: new.session_id,
            user_id: new.user_id,
            token_hash: new.token_hash,
            ip_address: new.ip_address,
            user_agent: new.user_agent,
            device_fingerprint: new.device_fingerprint,
            device_name: new.device_name,
            last_active_utc: now,
            remembered: new.remembered,
            expires_utc: new.expires_at,
            created_utc: now,
        };

        let evicted = self
            .store
            .insert_session_bounded(&session, self.policy.max_sessions_per_user)
            .await?;
        if evicted > 0 {
            tracing::info!(
                user_id = %session.user_id,
                evicted,
                "Evicted oldest sessions over the concurrency limit"
            );
        }
        Ok(session)
    }

    /// Find the live session for a token hash. A stale session found on the
    /// way is deleted.
    pub async fn find_live(&self, token_hash: &str) -> Result<Option<Session>, ServiceError> {
        let Some(session) = self.store.find_session_by_token_hash(token_hash).await? else {
            return Ok(None);
        };
        if session.is_live(Utc::now(), self.policy.inactivity_timeout) {
            Ok(Some(session))
        } else {
            self.store.delete_session(session.session_id).await?;
            Ok(None)
        }
    }

    pub async fn touch(&self, session_id: Uuid) -> Result<(), ServiceError> {
        self.store.touch_session(session_id, Utc::now()).await?;
        Ok(())
    }

    /// Sessions of the user not yet past absolute expiry.
    pub async fn list_for(&self, user_id: Uuid) -> Result<Vec<Session>, ServiceError> {
        Ok(self.store.list_sessions(user_id, Utc::now()).await?)
    }

    pub async fn get(&self, session_id: Uuid) -> Result<Option<Session>, ServiceError> {
        Ok(self.store.find_session(session_id).await?)
    }

    pub async fn revoke(&self, session_id: Uuid) -> Result<bool, ServiceError> {
        Ok(self.store.delete_session(session_id).await?)
    }

    pub async fn revoke_all_for(
        &self,
        user_id: Uuid,
        except: Option<Uuid>,
    ) -> Result<u64, ServiceError> {
        Ok(self.store.delete_user_sessions(user_id, except).await?)
    }

    /// Delete sessions past absolute expiry or idle beyond the inactivity
    /// timeout. Remembered sessions only age out by absolute expiry.
    pub async fn sweep_expired(&self) -> Result<u64, ServiceError> {
        let now = Utc::now();
        let swept = self
            .store
            .sweep_sessions(now, now - self.policy.inactivity_timeout)
            .await?;
        if swept > 0 {
            tracing::debug!(swept, "Swept expired sessions");
        }
        Ok(swept)
    }

    /// Sweep, logging instead of failing. Used on hot paths where a sweep
    /// is incidental.
    pub async fn sweep_opportunistically(&self) {
        if let Err(e) = self.sweep_expired().await {
            tracing::warn!(error = %e, "Opportunistic session sweep failed");
        }
    }

    // Remembered devices

    pub async fn remember_device(
        &self,
        user_id: Uuid,
        fingerprint: &str,
        device_name: Option<String>,
        ip_address: Option<String>,
    ) -> Result<RememberedDevice, ServiceError> {
        let device = RememberedDevice::new(
            user_id,
            fingerprint.to_string(),
            device_name,
            ip_address,
        );
        Ok(self.store.upsert_device(&device).await?)
    }

    /// Look up a remembered device and mark it used.
    pub async fn recognize_device(
        &self,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<RememberedDevice>, ServiceError> {
        let device = self.store.find_device(user_id, fingerprint).await?;
        if let Some(device) = &device {
            self.store.touch_device(device.device_id, Utc::now()).await?;
        }
        Ok(device)
    }

    pub async fn list_devices(&self, user_id: Uuid) -> Result<Vec<RememberedDevice>, ServiceError> {
        Ok(self.store.list_devices(user_id).await?)
    }

    pub async fn forget_device(&self, user_id: Uuid, device_id: Uuid) -> Result<bool, ServiceError> {
        Ok(self.store.delete_device(user_id, device_id).await?)
    }

    pub async fn forget_all_devices(&self, user_id: Uuid) -> Result<u64, ServiceError> {
        Ok(self.store.delete_user_devices(user_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::MemoryStore;
    use chrono::Duration;

    fn new_session(user_id: Uuid, hash: &str, remembered: bool) -> NewSession {
        NewSession {
            session_id: Uuid::new_v4(),
            user_id,
            token_hash: hash.to_string(),
            ip_address: Some("127.0.0.1".to_string()),
            user_agent: None,
            device_fingerprint: None,
            device_name: None,
            remembered,
            expires_at: Utc::now() + Duration::days(7),
        }
    }

    #[tokio::test]
    async fn test_find_live_drops_idle_session() {
        let store = Arc::new(MemoryStore::new());
        let policy = SessionPolicy {
            max_sessions_per_user: 2,
            inactivity_timeout: Duration::milliseconds(1),
        };
        let registry = SessionRegistry::new(store.clone(), policy);
        let user_id = Uuid::new_v4();

        let session = registry
            .create(new_session(user_id, "h", false))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        assert!(registry.find_live("h").await.unwrap().is_none());
        assert!(store.find_session(session.session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remembered_session_survives_idle() {
        let store = Arc::new(MemoryStore::new());
        let policy = SessionPolicy {
            max_sessions_per_user: 2,
            inactivity_timeout: Duration::milliseconds(1),
        };
        let registry = SessionRegistry::new(store, policy);

        registry
            .create(new_session(Uuid::new_v4(), "h", true))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        assert!(registry.find_live("h").await.unwrap().is_some());
        assert_eq!(registry.sweep_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_revoke_all_except_current() {
        let registry = SessionRegistry::new(Arc::new(MemoryStore::new()), SessionPolicy::default());
        let user_id = Uuid::new_v4();
        let keep = registry
            .create(new_session(user_id, "a", false))
            .await
            .unwrap();
        registry
            .create(new_session(user_id, "b", false))
            .await
            .unwrap();

        let revoked = registry
            .revoke_all_for(user_id, Some(keep.session_id))
            .await
            .unwrap();
        assert_eq!(revoked, 1);
        let remaining = registry.list_for(user_id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].session_id, keep.session_id);
    }

    #[tokio::test]
    async fn test_remembered_device_upserts_by_fingerprint() {
        let registry = SessionRegistry::new(Arc::new(MemoryStore::new()), SessionPolicy::default());
        let user_id = Uuid::new_v4();

        let first = registry
            .remember_device(user_id, "fp", Some("Laptop".to_string()), None)
            .await
            .unwrap();
        let second = registry
            .remember_device(user_id, "fp", None, Some("10.0.0.1".to_string()))
            .await
            .unwrap();

        assert_eq!(first.device_id, second.device_id);
        assert_eq!(second.device_name.as_deref(), Some("Laptop"));
        assert_eq!(registry.list_devices(user_id).await.unwrap().len(), 1);
        assert!(registry.recognize_device(user_id, "fp").await.unwrap().is_some());
        assert!(registry.recognize_device(Uuid::new_v4(), "fp").await.unwrap().is_none());

        assert!(registry.forget_device(user_id, first.device_id).await.unwrap());
        assert!(registry.list_devices(user_id).await.unwrap().is_empty());
    }
}
