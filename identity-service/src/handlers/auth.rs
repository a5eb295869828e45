use axum::{extract::State, http::HeaderMap, response::IntoResponse, Json};
use service_core::error::AppError;

use crate::{
    dtos::{
        auth::{
            LoginRequest, LoginResponse, SessionsRevokedResponse, ValidateResponse,
            VerifySecondFactorRequest,
        },
        ErrorResponse, MessageResponse,
    },
    middleware::{bearer_token, AuthUser, ClientContext},
    services::{LoginAttempt, LoginOutcome, SecondFactorAttempt, ServiceError},
    utils::{Password, ValidatedJson},
    AppState,
};

/// Authenticate with email and password
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Authenticated, or a second factor is required", body = LoginResponse),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse),
        (status = 429, description = "Too many login attempts", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn login(
    State(state): State<AppState>,
    ClientContext(client): ClientContext,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    let outcome = state
        .auth
        .login(LoginAttempt {
            email: req.email,
            password: Password::new(req.password),
            remember_me: req.remember_me,
            device_fingerprint: req.device_fingerprint,
            device_name: req.device_name,
            client,
        })
        .await?;

    let response = match outcome {
        LoginOutcome::Authenticated(session) => LoginResponse::authenticated(session),
        LoginOutcome::SecondFactorRequired { challenge } => {
            LoginResponse::second_factor_required(challenge.token, challenge.expires_at)
        }
    };
    Ok(Json(response))
}

/// Complete a login with a TOTP or recovery code
#[utoipa::path(
    post,
    path = "/auth/2fa/verify",
    request_body = VerifySecondFactorRequest,
    responses(
        (status = 200, description = "Authenticated", body = LoginResponse),
        (status = 400, description = "Neither code nor recovery code supplied", body = ErrorResponse),
        (status = 401, description = "Invalid challenge or code", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn verify_second_factor(
    State(state): State<AppState>,
    ClientContext(client): ClientContext,
    ValidatedJson(req): ValidatedJson<VerifySecondFactorRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    let session = state
        .auth
        .complete_second_factor(SecondFactorAttempt {
            challenge: req.challenge_token,
            code: req.code,
            recovery_code: req.recovery_code,
            remember_device: req.remember_device,
            device_name: req.device_name,
            client,
        })
        .await?;

    Ok(Json(LoginResponse::authenticated(session)))
}

/// Revoke the session behind the presented token
#[utoipa::path(
    post,
    path = "/auth/logout",
    responses(
        (status = 200, description = "Logged out", body = MessageResponse),
        (status = 401, description = "Token already invalid", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Authentication"
)]
pub async fn logout(
    State(state): State<AppState>,
    ClientContext(client): ClientContext,
    headers: HeaderMap,
) -> Result<Json<MessageResponse>, AppError> {
    let token = bearer_token(&headers).ok_or_else(|| {
        AppError::Unauthorized(anyhow::anyhow!("Missing or invalid Authorization header"))
    })?;

    if !state.auth.logout(token, client.ip()).await? {
        return Err(ServiceError::SessionNotFound.into());
    }
    Ok(Json(MessageResponse::new("Logged out")))
}

/// Revoke every session of the caller
#[utoipa::path(
    post,
    path = "/auth/logout-all",
    responses(
        (status = 200, description = "All sessions revoked", body = SessionsRevokedResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Authentication"
)]
pub async fn logout_all(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ClientContext(client): ClientContext,
) -> Result<Json<SessionsRevokedResponse>, AppError> {
    let sessions_revoked = state.auth.logout_all(user.user_id(), client.ip()).await?;
    Ok(Json(SessionsRevokedResponse { sessions_revoked }))
}

/// Check a bearer token against its live session
///
/// Downstream applications call this to resolve a token to an identity.
#[utoipa::path(
    post,
    path = "/auth/validate",
    responses(
        (status = 200, description = "Validation result", body = ValidateResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Authentication"
)]
pub async fn validate(
    State(state): State<AppState>,
    ClientContext(client): ClientContext,
    headers: HeaderMap,
) -> Result<Json<ValidateResponse>, AppError> {
    let Some(token) = bearer_token(&headers) else {
        return Ok(Json(ValidateResponse {
            valid: false,
            user: None,
            error: Some("Missing bearer token".to_string()),
        }));
    };

    match state.auth.validate_token(token, client.ip()).await {
        Ok(user) => Ok(Json(ValidateResponse {
            valid: true,
            user: Some(user.claims),
            error: None,
        })),
        Err(e @ (ServiceError::Database(_) | ServiceError::Internal(_))) => Err(e.into()),
        Err(e) => Ok(Json(ValidateResponse {
            valid: false,
            user: None,
            error: Some(e.to_string()),
        })),
    }
}

/// Claims of the current token
#[utoipa::path(
    get,
    path = "/auth/me",
    responses(
        (status = 200, description = "Token claims"),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Authentication"
)]
pub async fn me(AuthUser(user): AuthUser) -> impl IntoResponse {
    Json(user.claims)
}
