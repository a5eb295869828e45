use axum::{extract::State, Json};
use service_core::error::AppError;

use crate::{
    dtos::{
        user::{ChangePasswordRequest, ChangePasswordResponse, UpdateOwnProfileRequest},
        ErrorResponse,
    },
    middleware::{AuthUser, ClientContext},
    models::UserProfile,
    utils::{Password, ValidatedJson},
    AppState,
};

/// Get the caller's profile
#[utoipa::path(
    get,
    path = "/users/me",
    responses(
        (status = 200, description = "Current user", body = UserProfile),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "User"
)]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<UserProfile>, AppError> {
    Ok(Json(state.users.get_own_profile(&user).await?))
}

/// Update the caller's display name or linked identity
#[utoipa::path(
    patch,
    path = "/users/me",
    request_body = UpdateOwnProfileRequest,
    responses(
        (status = 200, description = "Updated profile", body = UserProfile),
        (status = 409, description = "Identity already linked to another user", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "User"
)]
pub async fn update_me(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ClientContext(client): ClientContext,
    ValidatedJson(req): ValidatedJson<UpdateOwnProfileRequest>,
) -> Result<Json<UserProfile>, AppError> {
    let profile = state
        .users
        .update_own_profile(&user, req.display_name, req.discord_id, client.ip())
        .await?;
    Ok(Json(profile))
}

/// Change the caller's password
///
/// Other sessions of the caller are revoked.
#[utoipa::path(
    post,
    path = "/users/me/password",
    request_body = ChangePasswordRequest,
    responses(
        (status = 200, description = "Password changed", body = ChangePasswordResponse),
        (status = 400, description = "Password too weak", body = ErrorResponse),
        (status = 403, description = "Current password is incorrect", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "User"
)]
pub async fn change_password(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ClientContext(client): ClientContext,
    ValidatedJson(req): ValidatedJson<ChangePasswordRequest>,
) -> Result<Json<ChangePasswordResponse>, AppError> {
    let provisioning_ok = state
        .users
        .change_password(
            &user,
            &Password::new(req.current_password),
            &Password::new(req.new_password),
            client.ip(),
        )
        .await?;

    Ok(Json(ChangePasswordResponse {
        success: true,
        provisioning_ok,
    }))
}
