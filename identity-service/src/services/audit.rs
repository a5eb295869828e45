//! Append-only audit sink.

use std::sync::Arc;

use super::store::Store;
use crate::models::AuditLogEntry;

#[derive(Clone)]
pub struct AuditSink {
    store: Arc<dyn Store>,
}

impl AuditSink {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Append an entry. Best-effort: a write failure is logged locally and
    /// never fails the operation being audited.
    pub async fn record(&self, entry: AuditLogEntry) {
        tracing::info!(
            action = %entry.action,
            actor = ?entry.actor_user_id,
            target = ?entry.target,
            "Audit event"
        );
        if let Err(e) = self.store.append_audit(&entry).await {
            tracing::warn!(
                error = %e,
                action = %entry.action,
                "Failed to write audit log entry"
            );
        }
    }
}
