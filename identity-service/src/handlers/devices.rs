use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::{
    dtos::{auth::DevicesForgottenResponse, ErrorResponse},
    middleware::{AuthUser, ClientContext},
    models::{AuditAction, AuditLogEntry, DeviceInfo},
    services::ServiceError,
    AppState,
};

/// List devices that skip the second-factor prompt
#[utoipa::path(
    get,
    path = "/auth/devices",
    responses(
        (status = 200, description = "Remembered devices", body = [DeviceInfo]),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Devices"
)]
pub async fn list_devices(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<Vec<DeviceInfo>>, AppError> {
    let devices = state
        .sessions
        .list_devices(user.user_id())
        .await?
        .into_iter()
        .map(DeviceInfo::from)
        .collect();
    Ok(Json(devices))
}

/// Forget one remembered device
#[utoipa::path(
    delete,
    path = "/auth/devices/{id}",
    params(("id" = Uuid, Path, description = "Device id")),
    responses(
        (status = 204, description = "Device forgotten"),
        (status = 404, description = "Device not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Devices"
)]
pub async fn forget_device(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ClientContext(client): ClientContext,
    Path(device_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    if !state.sessions.forget_device(user.user_id(), device_id).await? {
        return Err(ServiceError::NotFound("Device".to_string()).into());
    }

    state
        .audit
        .record(
            AuditLogEntry::new(AuditAction::DeviceForgotten)
                .actor(user.user_id())
                .target(device_id)
                .ip(client.ip()),
        )
        .await;
    Ok(StatusCode::NO_CONTENT)
}

/// Forget every remembered device
#[utoipa::path(
    delete,
    path = "/auth/devices",
    responses(
        (status = 200, description = "Devices forgotten", body = DevicesForgottenResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Devices"
)]
pub async fn forget_all_devices(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ClientContext(client): ClientContext,
) -> Result<Json<DevicesForgottenResponse>, AppError> {
    let devices_forgotten = state.sessions.forget_all_devices(user.user_id()).await?;
    if devices_forgotten > 0 {
        state
            .audit
            .record(
                AuditLogEntry::new(AuditAction::DeviceForgotten)
                    .actor(user.user_id())
                    .details(format!("{} devices forgotten", devices_forgotten))
                    .ip(client.ip()),
            )
            .await;
    }
    Ok(Json(DevicesForgottenResponse { devices_forgotten }))
}
