use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::{
    dtos::{auth::SessionsRevokedResponse, ErrorResponse},
    middleware::{AuthUser, ClientContext},
    models::{AuditAction, AuditLogEntry, SessionInfo},
    services::ServiceError,
    AppState,
};

/// List the caller's active sessions
#[utoipa::path(
    get,
    path = "/auth/sessions",
    responses(
        (status = 200, description = "Active sessions, most recent first", body = [SessionInfo]),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Sessions"
)]
pub async fn list_sessions(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<Vec<SessionInfo>>, AppError> {
    let current = user.session_id();
    let sessions = state
        .sessions
        .list_for(user.user_id())
        .await?
        .into_iter()
        .map(|session| {
            let is_current = session.session_id == current;
            SessionInfo {
                is_current,
                ..SessionInfo::from(session)
            }
        })
        .collect();
    Ok(Json(sessions))
}

/// Revoke one of the caller's sessions
#[utoipa::path(
    delete,
    path = "/auth/sessions/{id}",
    params(("id" = Uuid, Path, description = "Session id")),
    responses(
        (status = 204, description = "Session revoked"),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Sessions"
)]
pub async fn revoke_session(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ClientContext(client): ClientContext,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    // Other users' sessions are reported as missing.
    let owned = state
        .sessions
        .get(session_id)
        .await?
        .filter(|s| s.user_id == user.user_id());
    if owned.is_none() || !state.sessions.revoke(session_id).await? {
        return Err(ServiceError::NotFound("Session".to_string()).into());
    }

    state
        .audit
        .record(
            AuditLogEntry::new(AuditAction::SessionRevoked)
                .actor(user.user_id())
                .target(session_id)
                .ip(client.ip()),
        )
        .await;
    Ok(StatusCode::NO_CONTENT)
}

/// Revoke every session of the caller except the current one
#[utoipa::path(
    post,
    path = "/auth/sessions/revoke-others",
    responses(
        (status = 200, description = "Other sessions revoked", body = SessionsRevokedResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Sessions"
)]
pub async fn revoke_other_sessions(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ClientContext(client): ClientContext,
) -> Result<Json<SessionsRevokedResponse>, AppError> {
    let sessions_revoked = state
        .sessions
        .revoke_all_for(user.user_id(), Some(user.session_id()))
        .await?;

    state
        .audit
        .record(
            AuditLogEntry::new(AuditAction::SessionRevoked)
                .actor(user.user_id())
                .target(user.user_id())
                .details(format!("{} other sessions revoked", sessions_revoked))
                .ip(client.ip()),
        )
        .await;
    Ok(Json(SessionsRevokedResponse { sessions_revoked }))
}
