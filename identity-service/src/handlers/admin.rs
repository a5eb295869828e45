use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use super::admin_outcome;
use crate::{
    dtos::{
        admin::{
            CreateUserRequest, CreateUserResponse, OptionalReasonRequest, ReasonRequest,
            SetAuthorityRequest, SetEnabledRequest, SetPermissionsRequest, UpdateUserRequest,
        },
        auth::SessionsRevokedResponse,
        ErrorResponse,
    },
    middleware::{AuthUser, ClientContext},
    models::{ApprovalResponse, UserProfile},
    services::{NewUser, ProfileChanges},
    utils::{Password, ValidatedJson},
    AppState,
};

/// Create a user
///
/// The new user's authority level may not exceed the caller's.
#[utoipa::path(
    post,
    path = "/admin/users",
    request_body = CreateUserRequest,
    responses(
        (status = 201, description = "User created", body = CreateUserResponse),
        (status = 403, description = "Insufficient authority", body = ErrorResponse),
        (status = 409, description = "Email or identity already registered", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn create_user(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    ClientContext(client): ClientContext,
    ValidatedJson(req): ValidatedJson<CreateUserRequest>,
) -> Result<impl IntoResponse, AppError> {
    let (user, provisioning_ok) = state
        .users
        .create_user(
            &actor,
            NewUser {
                email: req.email,
                password: Password::new(req.password),
                display_name: req.display_name,
                discord_id: req.discord_id,
                authority_level: req.authority_level,
                permissions: req.permissions.into_iter().collect(),
            },
            client.ip(),
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateUserResponse {
            user,
            provisioning_ok,
        }),
    ))
}

/// List users
#[utoipa::path(
    get,
    path = "/admin/users",
    responses(
        (status = 200, description = "All users", body = [UserProfile]),
        (status = 403, description = "Insufficient permission", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn list_users(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
) -> Result<Json<Vec<UserProfile>>, AppError> {
    Ok(Json(state.users.list_users(&actor).await?))
}

/// Get a user
#[utoipa::path(
    get,
    path = "/admin/users/{id}",
    params(("id" = Uuid, Path, description = "User id")),
    responses(
        (status = 200, description = "User", body = UserProfile),
        (status = 404, description = "User not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn get_user(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(user_id): Path<Uuid>,
) -> Result<Json<UserProfile>, AppError> {
    Ok(Json(state.users.get_user(&actor, user_id).await?))
}

/// Update a user's profile fields
#[utoipa::path(
    patch,
    path = "/admin/users/{id}",
    params(("id" = Uuid, Path, description = "User id")),
    request_body = UpdateUserRequest,
    responses(
        (status = 200, description = "Updated user", body = UserProfile),
        (status = 403, description = "Target outranks caller", body = ErrorResponse),
        (status = 409, description = "Email or identity already registered", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn update_user(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    ClientContext(client): ClientContext,
    Path(user_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<UpdateUserRequest>,
) -> Result<Json<UserProfile>, AppError> {
    let changes = ProfileChanges {
        email: req.email,
        display_name: req.display_name,
        discord_id: req.discord_id,
    };
    let profile = state
        .users
        .update_profile(&actor, user_id, changes, client.ip())
        .await?;
    Ok(Json(profile))
}

/// Request deletion of a user
///
/// Deletion always needs a second administrator's approval.
#[utoipa::path(
    delete,
    path = "/admin/users/{id}",
    params(("id" = Uuid, Path, description = "User id")),
    request_body = ReasonRequest,
    responses(
        (status = 202, description = "Approval request created", body = ApprovalResponse),
        (status = 403, description = "Insufficient authority", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn delete_user(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    ClientContext(client): ClientContext,
    Path(user_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<ReasonRequest>,
) -> Result<impl IntoResponse, AppError> {
    let approval = state
        .users
        .delete(&actor, user_id, &req.reason, client.ip())
        .await?;
    Ok((StatusCode::ACCEPTED, Json(ApprovalResponse::from(&approval))))
}

/// Request suspension of a user
#[utoipa::path(
    post,
    path = "/admin/users/{id}/suspend",
    params(("id" = Uuid, Path, description = "User id")),
    request_body = ReasonRequest,
    responses(
        (status = 202, description = "Approval request created", body = ApprovalResponse),
        (status = 400, description = "User already suspended", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn suspend_user(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    ClientContext(client): ClientContext,
    Path(user_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<ReasonRequest>,
) -> Result<impl IntoResponse, AppError> {
    let approval = state
        .users
        .suspend(&actor, user_id, &req.reason, client.ip())
        .await?;
    Ok((StatusCode::ACCEPTED, Json(ApprovalResponse::from(&approval))))
}

/// Request lifting a user's suspension
#[utoipa::path(
    post,
    path = "/admin/users/{id}/unsuspend",
    params(("id" = Uuid, Path, description = "User id")),
    request_body = ReasonRequest,
    responses(
        (status = 202, description = "Approval request created", body = ApprovalResponse),
        (status = 400, description = "User is not suspended", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn unsuspend_user(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    ClientContext(client): ClientContext,
    Path(user_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<ReasonRequest>,
) -> Result<impl IntoResponse, AppError> {
    let approval = state
        .users
        .unsuspend(&actor, user_id, &req.reason, client.ip())
        .await?;
    Ok((StatusCode::ACCEPTED, Json(ApprovalResponse::from(&approval))))
}

/// Change a user's authority level
///
/// Raising a user to Admin or above needs a second administrator's approval.
#[utoipa::path(
    put,
    path = "/admin/users/{id}/authority",
    params(("id" = Uuid, Path, description = "User id")),
    request_body = SetAuthorityRequest,
    responses(
        (status = 200, description = "Authority changed", body = UserProfile),
        (status = 202, description = "Approval request created", body = ApprovalResponse),
        (status = 403, description = "Insufficient authority", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn set_authority(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    ClientContext(client): ClientContext,
    Path(user_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<SetAuthorityRequest>,
) -> Result<Response, AppError> {
    let outcome = state
        .users
        .set_authority(&actor, user_id, req.authority_level, &req.reason, client.ip())
        .await?;
    Ok(admin_outcome(outcome))
}

/// Replace a user's explicit permission grants
#[utoipa::path(
    put,
    path = "/admin/users/{id}/permissions",
    params(("id" = Uuid, Path, description = "User id")),
    request_body = SetPermissionsRequest,
    responses(
        (status = 200, description = "Permissions updated", body = UserProfile),
        (status = 403, description = "Cannot grant or revoke a permission the caller lacks", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn set_permissions(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    ClientContext(client): ClientContext,
    Path(user_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<SetPermissionsRequest>,
) -> Result<Json<UserProfile>, AppError> {
    let profile = state
        .users
        .set_permissions(
            &actor,
            user_id,
            req.permissions.into_iter().collect(),
            client.ip(),
        )
        .await?;
    Ok(Json(profile))
}

/// Enable or disable a user
#[utoipa::path(
    put,
    path = "/admin/users/{id}/enabled",
    params(("id" = Uuid, Path, description = "User id")),
    request_body = SetEnabledRequest,
    responses(
        (status = 200, description = "Updated user", body = UserProfile),
        (status = 403, description = "Target outranks caller", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn set_enabled(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    ClientContext(client): ClientContext,
    Path(user_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<SetEnabledRequest>,
) -> Result<Json<UserProfile>, AppError> {
    let profile = state
        .users
        .set_enabled(&actor, user_id, req.enabled, client.ip())
        .await?;
    Ok(Json(profile))
}

/// Force-reset a user's second factor
///
/// Resetting an Admin-or-above account needs a second administrator's approval.
#[utoipa::path(
    post,
    path = "/admin/users/{id}/reset-2fa",
    params(("id" = Uuid, Path, description = "User id")),
    request_body = OptionalReasonRequest,
    responses(
        (status = 200, description = "Second factor reset", body = UserProfile),
        (status = 202, description = "Approval request created", body = ApprovalResponse),
        (status = 400, description = "Two-factor not enabled", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn reset_two_factor(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    ClientContext(client): ClientContext,
    Path(user_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<OptionalReasonRequest>,
) -> Result<Response, AppError> {
    let outcome = state
        .users
        .reset_two_factor(&actor, user_id, &req.reason, client.ip())
        .await?;
    Ok(admin_outcome(outcome))
}

/// Revoke all sessions of a user
#[utoipa::path(
    delete,
    path = "/admin/users/{id}/sessions",
    params(("id" = Uuid, Path, description = "User id")),
    responses(
        (status = 200, description = "Sessions revoked", body = SessionsRevokedResponse),
        (status = 403, description = "Insufficient permission", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn revoke_user_sessions(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    ClientContext(client): ClientContext,
    Path(user_id): Path<Uuid>,
) -> Result<Json<SessionsRevokedResponse>, AppError> {
    let sessions_revoked = state
        .users
        .revoke_sessions(&actor, user_id, client.ip())
        .await?;
    Ok(Json(SessionsRevokedResponse { sessions_revoked }))
}
