use service_core::error::AppError;
use thiserror::Error;

use super::store::StoreError;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account disabled")]
    AccountDisabled,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Session not found or expired")]
    SessionNotFound,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Cannot approve or deny your own request")]
    SelfApproval,

    #[error("This action requires approval")]
    ApprovalRequired,

    #[error("Approval request already resolved")]
    AlreadyResolved,

    #[error("Approval request has expired")]
    ApprovalExpired,

    #[error("Invalid verification code")]
    InvalidSecondFactor,

    #[error("{0} not found")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(anyhow::Error),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ServiceError::NotFound(what),
            StoreError::Conflict(what) => ServiceError::Conflict(what),
            StoreError::Backend(e) => ServiceError::Database(e),
        }
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Validation(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            // Credential failures share one message so callers cannot tell
            // an unknown account from a wrong password.
            ServiceError::InvalidCredentials | ServiceError::AccountDisabled => {
                AppError::Unauthorized(anyhow::anyhow!("Invalid credentials"))
            }
            ServiceError::InvalidToken | ServiceError::SessionNotFound => {
                AppError::Unauthorized(anyhow::anyhow!("Invalid or expired token"))
            }
            ServiceError::InvalidSecondFactor => {
                AppError::Unauthorized(anyhow::anyhow!("Invalid verification code"))
            }
            ServiceError::Forbidden(msg) => AppError::Forbidden(anyhow::anyhow!(msg)),
            ServiceError::SelfApproval => AppError::Forbidden(anyhow::anyhow!(
                "Cannot approve or deny your own request"
            )),
            ServiceError::ApprovalRequired => {
                AppError::Forbidden(anyhow::anyhow!("This action requires approval"))
            }
            ServiceError::AlreadyResolved => {
                AppError::Conflict(anyhow::anyhow!("Approval request already resolved"))
            }
            ServiceError::ApprovalExpired => {
                AppError::Conflict(anyhow::anyhow!("Approval request has expired"))
            }
            ServiceError::NotFound(what) => AppError::NotFound(anyhow::anyhow!("{} not found", what)),
            ServiceError::Conflict(msg) => AppError::Conflict(anyhow::anyhow!(msg)),
            ServiceError::Database(e) => AppError::DatabaseError(e),
            ServiceError::Internal(e) => AppError::InternalError(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_auth_failures_are_indistinguishable() {
        let unknown = AppError::from(ServiceError::InvalidCredentials);
        let disabled = AppError::from(ServiceError::AccountDisabled);
        assert_eq!(unknown.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(unknown.to_string(), disabled.to_string());
    }

    #[test]
    fn test_authorization_failures_are_specific() {
        let err = AppError::from(ServiceError::SelfApproval);
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert!(err.to_string().contains("own request"));
    }

    #[test]
    fn test_state_conflicts_map_to_409() {
        assert_eq!(
            AppError::from(ServiceError::AlreadyResolved).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::from(ServiceError::ApprovalExpired).status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_store_errors_convert() {
        let err: ServiceError = StoreError::NotFound("User".to_string()).into();
        assert!(matches!(err, ServiceError::NotFound(_)));
        let err: ServiceError = StoreError::Backend(anyhow::anyhow!("io")).into();
        assert!(matches!(err, ServiceError::Database(_)));
    }
}
