//! HTTP handlers for the identity service.

pub mod admin;
pub mod approvals;
pub mod auth;
pub mod devices;
pub mod sessions;
pub mod two_factor;
pub mod user;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::models::{ApprovalResponse, UserProfile};
use crate::services::AdminActionOutcome;

/// 200 with the updated profile, or 202 with the approval request a second
/// administrator must decide.
pub(crate) fn admin_outcome(outcome: AdminActionOutcome<UserProfile>) -> Response {
    match outcome {
        AdminActionOutcome::Applied(profile) => (StatusCode::OK, Json(profile)).into_response(),
        AdminActionOutcome::PendingApproval(approval) => (
            StatusCode::ACCEPTED,
            Json(ApprovalResponse::from(&approval)),
        )
            .into_response(),
    }
}
