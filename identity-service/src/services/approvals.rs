//! Two-person approval workflow for high-risk administrative actions.
//!
//! `pending` moves exactly once to `approved`, `denied` or `expired`. The
//! transition and the approved action commit together through
//! [`Store::commit_decision`], so concurrent decisions on one request
//! produce exactly one winner and at most one execution.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use super::audit::AuditSink;
use super::auth::AuthenticatedUser;
use super::error::ServiceError;
use super::provisioning::ProvisioningClient;
use super::sessions::SessionRegistry;
use super::store::{ApprovalEffect, DecisionCommit, Store};
use crate::config::ApprovalPolicy;
use crate::models::{
    permissions, ApprovalAction, ApprovalRequest, ApprovalStatus, AuditAction, AuditLogEntry,
    AuthorityLevel, Decision, User,
};

/// Result of a decision that committed.
#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    pub approval: ApprovalRequest,
    /// Set only when an approved deletion had a provisioning side effect.
    pub provisioning_ok: Option<bool>,
}

#[derive(Clone)]
pub struct ApprovalWorkflow {
    store: Arc<dyn Store>,
    sessions: SessionRegistry,
    provisioning: Arc<dyn ProvisioningClient>,
    audit: AuditSink,
    policy: ApprovalPolicy,
}

impl ApprovalWorkflow {
    pub fn new(
        store: Arc<dyn Store>,
        sessions: SessionRegistry,
        provisioning: Arc<dyn ProvisioningClient>,
        audit: AuditSink,
        policy: ApprovalPolicy,
    ) -> Self {
        Self {
            store,
            sessions,
            provisioning,
            audit,
            policy,
        }
    }

    /// Open a request from a raw action type and payload.
    pub async fn request(
        &self,
        requester: &AuthenticatedUser,
        action_type: &str,
        action_data: Option<&Value>,
        target_user_id: Option<Uuid>,
        reason: &str,
        ip: Option<&str>,
    ) -> Result<ApprovalRequest, ServiceError> {
        let action = ApprovalAction::parse(action_type, action_data).map_err(ServiceError::Validation)?;
        let target_user_id = target_user_id
            .ok_or_else(|| ServiceError::Validation("targetUserId is required".to_string()))?;
        self.submit(requester, action, target_user_id, reason, ip).await
    }

    /// Open a request for an already typed action.
    pub async fn submit(
        &self,
        requester: &AuthenticatedUser,
        action: ApprovalAction,
        target_user_id: Uuid,
        reason: &str,
        ip: Option<&str>,
    ) -> Result<ApprovalRequest, ServiceError> {
        requester.require_permission(permissions::MANAGE_USERS)?;

        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ServiceError::Validation("A reason is required".to_string()));
        }

        let target = self
            .store
            .find_user_by_id(target_user_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("User".to_string()))?;
        check_request_rules(requester, &action, &target)?;

        // An overdue request must not block a new one; the store rejects
        // any remaining pending duplicate.
        self.store.expire_overdue_approvals(Utc::now()).await?;

        let approval = ApprovalRequest::new(
            requester.user_id(),
            action,
            Some(target_user_id),
            reason.to_string(),
            self.policy.ttl,
        );
        self.store.insert_approval(&approval).await?;

        tracing::info!(
            approval_id = %approval.approval_id,
            action = %approval.action,
            target_user_id = %target_user_id,
            "Approval requested"
        );
        self.audit
            .record(
                AuditLogEntry::new(AuditAction::ApprovalRequested)
                    .actor(requester.user_id())
                    .target(approval.approval_id)
                    .details(format!("{} on {}", approval.action, target_user_id))
                    .ip(ip),
            )
            .await;

        Ok(approval)
    }

    pub async fn decide(
        &self,
        approver: &AuthenticatedUser,
        approval_id: Uuid,
        decision: Decision,
        comment: Option<String>,
        ip: Option<&str>,
    ) -> Result<DecisionOutcome, ServiceError> {
        let approval = self
            .store
            .find_approval(approval_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Approval request".to_string()))?;

        if approval.status.is_terminal() {
            return Err(ServiceError::AlreadyResolved);
        }

        if approval.requester_id == approver.user_id() {
            self.audit
                .record(
                    AuditLogEntry::new(AuditAction::ApprovalSelfRejected)
                        .actor(approver.user_id())
                        .target(approval_id)
                        .ip(ip),
                )
                .await;
            return Err(ServiceError::SelfApproval);
        }

        approver.require_permission(permissions::APPROVE)?;
        if let ApprovalAction::EscalateAuthority { authority_level } = &approval.action {
            if *authority_level > approver.authority_level() {
                return Err(ServiceError::Forbidden(
                    "Cannot approve an escalation above your own authority".to_string(),
                ));
            }
        }

        let now = Utc::now();
        if now > approval.expires_utc {
            if self.store.expire_approval(approval_id, now).await? {
                self.audit
                    .record(
                        AuditLogEntry::new(AuditAction::ApprovalExpired)
                            .target(approval_id)
                            .ip(ip),
                    )
                    .await;
            }
            return Err(ServiceError::ApprovalExpired);
        }

        // Snapshot of the target before the effect, for the side effects
        // that need it afterwards.
        let target = match approval.target_user_id {
            Some(id) => self.store.find_user_by_id(id).await?,
            None => None,
        };

        let effect = match decision {
            Decision::Approve => Some(effect_for(&approval, target.as_ref())?),
            Decision::Deny => None,
        };

        let commit = DecisionCommit {
            approval_id,
            approver_id: approver.user_id(),
            status: decision.resulting_status(),
            comment: comment.clone(),
            resolved_at: now,
            effect: effect.clone(),
        };
        if !self.store.commit_decision(&commit).await? {
            return Err(ServiceError::AlreadyResolved);
        }

        let audit_action = match decision {
            Decision::Approve => AuditAction::ApprovalApproved,
            Decision::Deny => AuditAction::ApprovalDenied,
        };
        self.audit
            .record(
                AuditLogEntry::new(audit_action)
                    .actor(approver.user_id())
                    .target(approval_id)
                    .details(approval.action.to_string())
                    .ip(ip),
            )
            .await;

        let mut provisioning_ok = None;
        if let Some(effect) = &effect {
            self.audit_effect(approver.user_id(), effect, ip).await;
            if let (ApprovalEffect::DeleteUser { .. }, Some(target)) = (effect, &target) {
                provisioning_ok = Some(match self.provisioning.delete_account(&target.email).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            user_id = %target.user_id,
                            "Provisioning delete failed after user deletion"
                        );
                        false
                    }
                });
            }
        }

        tracing::info!(
            approval_id = %approval_id,
            status = %commit.status.as_str(),
            "Approval resolved"
        );

        let resolved = ApprovalRequest {
            approver_id: Some(approver.user_id()),
            status: commit.status,
            resolved_utc: Some(now),
            approver_comment: comment,
            ..approval
        };
        Ok(DecisionOutcome {
            approval: resolved,
            provisioning_ok,
        })
    }

    async fn audit_effect(&self, actor: Uuid, effect: &ApprovalEffect, ip: Option<&str>) {
        let (action, details) = match effect {
            ApprovalEffect::DeleteUser { .. } => (AuditAction::UserDeleted, None),
            ApprovalEffect::Suspend { reason, .. } => {
                (AuditAction::UserSuspended, Some(reason.clone()))
            }
            ApprovalEffect::Unsuspend { .. } => (AuditAction::UserUnsuspended, None),
            ApprovalEffect::SetAuthority { level, .. } => {
                (AuditAction::AuthorityChanged, Some(level.to_string()))
            }
            ApprovalEffect::ResetTwoFactor { .. } => (AuditAction::TwoFactorReset, None),
        };
        let mut entry = AuditLogEntry::new(action)
            .actor(actor)
            .target(effect.user_id())
            .ip(ip);
        if let Some(details) = details {
            entry = entry.details(details);
        }
        self.audit.record(entry).await;
    }

    /// List requests, newest first. Overdue requests are expired and stale
    /// sessions swept before reading.
    pub async fn list(
        &self,
        viewer: &AuthenticatedUser,
        status: Option<ApprovalStatus>,
    ) -> Result<Vec<ApprovalRequest>, ServiceError> {
        viewer.require_permission(permissions::MANAGE_USERS)?;

        let expired = self.store.expire_overdue_approvals(Utc::now()).await?;
        if expired > 0 {
            tracing::info!(expired, "Expired overdue approval requests");
            self.audit
                .record(
                    AuditLogEntry::new(AuditAction::ApprovalExpired)
                        .details(format!("{} overdue requests expired", expired)),
                )
                .await;
        }
        self.sessions.sweep_opportunistically().await;

        Ok(self.store.list_approvals(status).await?)
    }

    pub async fn get(
        &self,
        viewer: &AuthenticatedUser,
        approval_id: Uuid,
    ) -> Result<ApprovalRequest, ServiceError> {
        viewer.require_permission(permissions::MANAGE_USERS)?;

        let mut approval = self
            .store
            .find_approval(approval_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Approval request".to_string()))?;

        let now = Utc::now();
        if approval.is_overdue(now) && self.store.expire_approval(approval_id, now).await? {
            approval.status = ApprovalStatus::Expired;
            approval.resolved_utc = Some(now);
        }
        Ok(approval)
    }
}

/// Eligibility of `action` against `target` for this requester.
fn check_request_rules(
    requester: &AuthenticatedUser,
    action: &ApprovalAction,
    target: &User,
) -> Result<(), ServiceError> {
    if target.user_id == requester.user_id() {
        return Err(ServiceError::Forbidden(
            "Cannot request this action against your own account".to_string(),
        ));
    }
    if target.authority_level > requester.authority_level() {
        return Err(ServiceError::Forbidden(
            "Cannot act on a user with higher authority than yourself".to_string(),
        ));
    }

    match action {
        ApprovalAction::DeleteUser => Ok(()),
        ApprovalAction::SuspendUser { .. } if target.is_suspended() => Err(
            ServiceError::Validation("User is already suspended".to_string()),
        ),
        ApprovalAction::SuspendUser { .. } => Ok(()),
        ApprovalAction::UnsuspendUser if !target.is_suspended() => Err(
            ServiceError::Validation("User is not suspended".to_string()),
        ),
        ApprovalAction::UnsuspendUser => Ok(()),
        ApprovalAction::EscalateAuthority { authority_level } => {
            if *authority_level < AuthorityLevel::Admin {
                return Err(ServiceError::Validation(
                    "Authority changes below Admin are applied directly".to_string(),
                ));
            }
            if *authority_level <= target.authority_level {
                return Err(ServiceError::Validation(
                    "Escalation must raise the user's authority".to_string(),
                ));
            }
            if *authority_level > requester.authority_level() {
                return Err(ServiceError::Forbidden(
                    "Cannot grant authority higher than your own".to_string(),
                ));
            }
            Ok(())
        }
        ApprovalAction::ResetTwoFactor => {
            if target.authority_level < AuthorityLevel::Admin {
                return Err(ServiceError::Validation(
                    "Two-factor resets for non-admin accounts are applied directly".to_string(),
                ));
            }
            if !target.two_factor_enabled {
                return Err(ServiceError::Validation(
                    "User does not have two-factor authentication enabled".to_string(),
                ));
            }
            Ok(())
        }
    }
}

fn effect_for(approval: &ApprovalRequest, target: Option<&User>) -> Result<ApprovalEffect, ServiceError> {
    let target = target.ok_or_else(|| ServiceError::NotFound("User".to_string()))?;
    let user_id = target.user_id;
    Ok(match &approval.action {
        ApprovalAction::DeleteUser => ApprovalEffect::DeleteUser { user_id },
        ApprovalAction::SuspendUser { reason } => ApprovalEffect::Suspend {
            user_id,
            reason: reason.clone().unwrap_or_else(|| approval.reason.clone()),
            actor_id: approval.requester_id,
            at: Utc::now(),
        },
        ApprovalAction::UnsuspendUser => ApprovalEffect::Unsuspend { user_id },
        ApprovalAction::EscalateAuthority { authority_level } => ApprovalEffect::SetAuthority {
            user_id,
            level: *authority_level,
        },
        ApprovalAction::ResetTwoFactor => ApprovalEffect::ResetTwoFactor { user_id },
    })
}
