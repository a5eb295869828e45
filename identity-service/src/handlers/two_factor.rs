use axum::{extract::State, Json};
use service_core::error::AppError;

use crate::{
    dtos::{
        auth::{RecoveryCodesResponse, TwoFactorCodeRequest, TwoFactorSetupResponse},
        ErrorResponse, MessageResponse,
    },
    middleware::{AuthUser, ClientContext},
    utils::ValidatedJson,
    AppState,
};

/// Generate a TOTP secret to confirm with `/auth/2fa/enable`
#[utoipa::path(
    post,
    path = "/auth/2fa/setup",
    responses(
        (status = 200, description = "Secret and otpauth URL", body = TwoFactorSetupResponse),
        (status = 409, description = "Two-factor already enabled", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Two-Factor"
)]
pub async fn setup(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<TwoFactorSetupResponse>, AppError> {
    let setup = state.two_factor.setup(user.user_id()).await?;
    Ok(Json(TwoFactorSetupResponse {
        secret: setup.secret,
        otpauth_url: setup.otpauth_url,
    }))
}

/// Confirm the pending secret and enable two-factor
#[utoipa::path(
    post,
    path = "/auth/2fa/enable",
    request_body = TwoFactorCodeRequest,
    responses(
        (status = 200, description = "Enabled; recovery codes are shown once", body = RecoveryCodesResponse),
        (status = 401, description = "Invalid code", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Two-Factor"
)]
pub async fn enable(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ClientContext(client): ClientContext,
    ValidatedJson(req): ValidatedJson<TwoFactorCodeRequest>,
) -> Result<Json<RecoveryCodesResponse>, AppError> {
    let recovery_codes = state
        .two_factor
        .enable(user.user_id(), &req.code, client.ip())
        .await?;
    Ok(Json(RecoveryCodesResponse { recovery_codes }))
}

/// Disable two-factor
#[utoipa::path(
    post,
    path = "/auth/2fa/disable",
    request_body = TwoFactorCodeRequest,
    responses(
        (status = 200, description = "Disabled", body = MessageResponse),
        (status = 401, description = "Invalid code", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Two-Factor"
)]
pub async fn disable(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ClientContext(client): ClientContext,
    ValidatedJson(req): ValidatedJson<TwoFactorCodeRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    state
        .two_factor
        .disable(user.user_id(), &req.code, client.ip())
        .await?;
    Ok(Json(MessageResponse::new("Two-factor authentication disabled")))
}

/// Replace all recovery codes
#[utoipa::path(
    post,
    path = "/auth/2fa/recovery-codes",
    request_body = TwoFactorCodeRequest,
    responses(
        (status = 200, description = "New recovery codes", body = RecoveryCodesResponse),
        (status = 401, description = "Invalid code", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Two-Factor"
)]
pub async fn regenerate_recovery_codes(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ClientContext(client): ClientContext,
    ValidatedJson(req): ValidatedJson<TwoFactorCodeRequest>,
) -> Result<Json<RecoveryCodesResponse>, AppError> {
    let recovery_codes = state
        .two_factor
        .regenerate_recovery_codes(user.user_id(), &req.code, client.ip())
        .await?;
    Ok(Json(RecoveryCodesResponse { recovery_codes }))
}
