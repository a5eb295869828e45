use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::{
    dtos::{
        admin::{ApprovalListQuery, CreateApprovalRequest, DecideApprovalRequest, DecisionResponse},
        ErrorResponse,
    },
    middleware::{AuthUser, ClientContext},
    models::ApprovalResponse,
    utils::ValidatedJson,
    AppState,
};

/// List approval requests
///
/// Overdue pending requests are expired before the list is returned.
#[utoipa::path(
    get,
    path = "/admin/approvals",
    params(ApprovalListQuery),
    responses(
        (status = 200, description = "Approval requests, newest first", body = [ApprovalResponse]),
        (status = 403, description = "Insufficient permission", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Approvals"
)]
pub async fn list_approvals(
    State(state): State<AppState>,
    AuthUser(viewer): AuthUser,
    Query(query): Query<ApprovalListQuery>,
) -> Result<Json<Vec<ApprovalResponse>>, AppError> {
    let approvals = state.approvals.list(&viewer, query.status).await?;
    Ok(Json(approvals.iter().map(ApprovalResponse::from).collect()))
}

/// Request approval for a high-risk action
#[utoipa::path(
    post,
    path = "/admin/approvals",
    request_body = CreateApprovalRequest,
    responses(
        (status = 201, description = "Approval request created", body = ApprovalResponse),
        (status = 400, description = "Action not eligible for approval", body = ErrorResponse),
        (status = 409, description = "Equivalent request already pending", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Approvals"
)]
pub async fn create_approval(
    State(state): State<AppState>,
    AuthUser(requester): AuthUser,
    ClientContext(client): ClientContext,
    ValidatedJson(req): ValidatedJson<CreateApprovalRequest>,
) -> Result<impl IntoResponse, AppError> {
    let approval = state
        .approvals
        .request(
            &requester,
            &req.action_type,
            req.action_data.as_ref(),
            req.target_user_id,
            &req.reason,
            client.ip(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(ApprovalResponse::from(&approval))))
}

/// Get an approval request
#[utoipa::path(
    get,
    path = "/admin/approvals/{id}",
    params(("id" = Uuid, Path, description = "Approval request id")),
    responses(
        (status = 200, description = "Approval request", body = ApprovalResponse),
        (status = 404, description = "Approval request not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Approvals"
)]
pub async fn get_approval(
    State(state): State<AppState>,
    AuthUser(viewer): AuthUser,
    Path(approval_id): Path<Uuid>,
) -> Result<Json<ApprovalResponse>, AppError> {
    let approval = state.approvals.get(&viewer, approval_id).await?;
    Ok(Json(ApprovalResponse::from(&approval)))
}

/// Approve or deny a pending request
///
/// The requester can never decide their own request.
#[utoipa::path(
    post,
    path = "/admin/approvals/{id}/decision",
    params(("id" = Uuid, Path, description = "Approval request id")),
    request_body = DecideApprovalRequest,
    responses(
        (status = 200, description = "Decision recorded", body = DecisionResponse),
        (status = 403, description = "Self-approval or insufficient authority", body = ErrorResponse),
        (status = 404, description = "Approval request not found", body = ErrorResponse),
        (status = 409, description = "Already resolved or expired", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Approvals"
)]
pub async fn decide_approval(
    State(state): State<AppState>,
    AuthUser(approver): AuthUser,
    ClientContext(client): ClientContext,
    Path(approval_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<DecideApprovalRequest>,
) -> Result<Json<DecisionResponse>, AppError> {
    let outcome = state
        .approvals
        .decide(&approver, approval_id, req.decision, req.comment, client.ip())
        .await?;
    Ok(Json(DecisionResponse {
        approval: ApprovalResponse::from(&outcome.approval),
        provisioning_ok: outcome.provisioning_ok,
    }))
}
