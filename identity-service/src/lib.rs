pub mod config;
pub mod db;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

use axum::{
    http::{header, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post, put},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::{
    create_ip_rate_limiter, ip_rate_limit_middleware, request_id_middleware,
    security_headers_middleware, IpRateLimiter, REQUEST_ID_HEADER,
};
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

use crate::config::{Environment, IdentityConfig};
use crate::services::{
    ApprovalWorkflow, AuditSink, AuthEngine, ProvisioningClient, SessionRegistry, Store,
    TokenService, TwoFactorService, UserAdmin,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        handlers::auth::login,
        handlers::auth::verify_second_factor,
        handlers::auth::logout,
        handlers::auth::logout_all,
        handlers::auth::validate,
        handlers::auth::me,
        handlers::sessions::list_sessions,
        handlers::sessions::revoke_session,
        handlers::sessions::revoke_other_sessions,
        handlers::two_factor::setup,
        handlers::two_factor::enable,
        handlers::two_factor::disable,
        handlers::two_factor::regenerate_recovery_codes,
        handlers::devices::list_devices,
        handlers::devices::forget_device,
        handlers::devices::forget_all_devices,
        handlers::user::get_me,
        handlers::user::update_me,
        handlers::user::change_password,
        handlers::admin::create_user,
        handlers::admin::list_users,
        handlers::admin::get_user,
        handlers::admin::update_user,
        handlers::admin::delete_user,
        handlers::admin::suspend_user,
        handlers::admin::unsuspend_user,
        handlers::admin::set_authority,
        handlers::admin::set_permissions,
        handlers::admin::set_enabled,
        handlers::admin::reset_two_factor,
        handlers::admin::revoke_user_sessions,
        handlers::approvals::list_approvals,
        handlers::approvals::create_approval,
        handlers::approvals::get_approval,
        handlers::approvals::decide_approval,
    ),
    components(
        schemas(
            dtos::ErrorResponse,
            dtos::MessageResponse,
            dtos::auth::LoginRequest,
            dtos::auth::LoginResponse,
            dtos::auth::VerifySecondFactorRequest,
            dtos::auth::ValidateResponse,
            dtos::auth::SessionsRevokedResponse,
            dtos::auth::DevicesForgottenResponse,
            dtos::auth::TwoFactorSetupResponse,
            dtos::auth::TwoFactorCodeRequest,
            dtos::auth::RecoveryCodesResponse,
            dtos::user::UpdateOwnProfileRequest,
            dtos::user::ChangePasswordRequest,
            dtos::user::ChangePasswordResponse,
            dtos::admin::CreateUserRequest,
            dtos::admin::CreateUserResponse,
            dtos::admin::UpdateUserRequest,
            dtos::admin::SetAuthorityRequest,
            dtos::admin::SetPermissionsRequest,
            dtos::admin::SetEnabledRequest,
            dtos::admin::ReasonRequest,
            dtos::admin::OptionalReasonRequest,
            dtos::admin::CreateApprovalRequest,
            dtos::admin::DecideApprovalRequest,
            dtos::admin::DecisionResponse,
            models::UserProfile,
            models::Suspension,
            models::SessionInfo,
            models::DeviceInfo,
            models::ApprovalResponse,
            models::ApprovalStatus,
            models::Decision,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Authentication", description = "Login, second factor, and token validation"),
        (name = "Sessions", description = "Self-service session management"),
        (name = "Two-Factor", description = "TOTP enrollment and recovery codes"),
        (name = "Devices", description = "Remembered devices"),
        (name = "User", description = "Self-service profile management"),
        (name = "Admin", description = "User administration"),
        (name = "Approvals", description = "Two-person approval workflow"),
        (name = "Observability", description = "Service health"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: IdentityConfig,
    pub store: Arc<dyn Store>,
    pub auth: AuthEngine,
    pub sessions: SessionRegistry,
    pub two_factor: TwoFactorService,
    pub approvals: ApprovalWorkflow,
    pub users: UserAdmin,
    pub audit: AuditSink,
    pub login_rate_limiter: IpRateLimiter,
    pub ip_rate_limiter: IpRateLimiter,
}

/// Wire the component graph over an already-opened store.
pub fn build_state(
    config: IdentityConfig,
    store: Arc<dyn Store>,
    provisioning: Arc<dyn ProvisioningClient>,
) -> AppState {
    let audit = AuditSink::new(store.clone());
    let tokens = TokenService::new(&config.token);
    let sessions = SessionRegistry::new(store.clone(), config.sessions.clone());
    let two_factor =
        TwoFactorService::new(store.clone(), audit.clone(), config.token.issuer.clone());
    let auth = AuthEngine::new(
        store.clone(),
        tokens,
        sessions.clone(),
        two_factor.clone(),
        audit.clone(),
    );
    let approvals = ApprovalWorkflow::new(
        store.clone(),
        sessions.clone(),
        provisioning.clone(),
        audit.clone(),
        config.approvals.clone(),
    );
    let users = UserAdmin::new(
        store.clone(),
        sessions.clone(),
        approvals.clone(),
        provisioning,
        audit.clone(),
    );

    let login_rate_limiter = create_ip_rate_limiter(
        config.rate_limit.login_attempts,
        config.rate_limit.login_window_seconds,
    );
    let ip_rate_limiter = create_ip_rate_limiter(
        config.rate_limit.global_ip_limit,
        config.rate_limit.global_ip_window_seconds,
    );

    AppState {
        config,
        store,
        auth,
        sessions,
        two_factor,
        approvals,
        users,
        audit,
        login_rate_limiter,
        ip_rate_limiter,
    }
}

pub fn build_router(state: AppState) -> Result<Router, AppError> {
    // Credential-checking routes share the login limiter
    let login_routes = Router::new()
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/2fa/verify", post(handlers::auth::verify_second_factor))
        .layer(from_fn_with_state(
            state.login_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    let protected_routes = Router::new()
        .route("/auth/logout-all", post(handlers::auth::logout_all))
        .route("/auth/me", get(handlers::auth::me))
        .route("/auth/sessions", get(handlers::sessions::list_sessions))
        .route(
            "/auth/sessions/revoke-others",
            post(handlers::sessions::revoke_other_sessions),
        )
        .route("/auth/sessions/:id", delete(handlers::sessions::revoke_session))
        .route("/auth/2fa/setup", post(handlers::two_factor::setup))
        .route("/auth/2fa/enable", post(handlers::two_factor::enable))
        .route("/auth/2fa/disable", post(handlers::two_factor::disable))
        .route(
            "/auth/2fa/recovery-codes",
            post(handlers::two_factor::regenerate_recovery_codes),
        )
        .route(
            "/auth/devices",
            get(handlers::devices::list_devices).delete(handlers::devices::forget_all_devices),
        )
        .route("/auth/devices/:id", delete(handlers::devices::forget_device))
        .route(
            "/users/me",
            get(handlers::user::get_me).patch(handlers::user::update_me),
        )
        .route("/users/me/password", post(handlers::user::change_password))
        .route(
            "/admin/users",
            get(handlers::admin::list_users).post(handlers::admin::create_user),
        )
        .route(
            "/admin/users/:id",
            get(handlers::admin::get_user)
                .patch(handlers::admin::update_user)
                .delete(handlers::admin::delete_user),
        )
        .route("/admin/users/:id/suspend", post(handlers::admin::suspend_user))
        .route(
            "/admin/users/:id/unsuspend",
            post(handlers::admin::unsuspend_user),
        )
        .route("/admin/users/:id/authority", put(handlers::admin::set_authority))
        .route(
            "/admin/users/:id/permissions",
            put(handlers::admin::set_permissions),
        )
        .route("/admin/users/:id/enabled", put(handlers::admin::set_enabled))
        .route(
            "/admin/users/:id/reset-2fa",
            post(handlers::admin::reset_two_factor),
        )
        .route(
            "/admin/users/:id/sessions",
            delete(handlers::admin::revoke_user_sessions),
        )
        .route(
            "/admin/approvals",
            get(handlers::approvals::list_approvals).post(handlers::approvals::create_approval),
        )
        .route("/admin/approvals/:id", get(handlers::approvals::get_approval))
        .route(
            "/admin/approvals/:id/decision",
            post(handlers::approvals::decide_approval),
        )
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ));

    let mut app = Router::new().route("/health", get(health_check));

    // Swagger UI in dev only; the raw document stays available for tooling
    if state.config.environment == Environment::Dev {
        app = app.merge(SwaggerUi::new("/docs").url("/.well-known/openapi.json", ApiDoc::openapi()));
    } else {
        app = app.route(
            "/.well-known/openapi.json",
            get(|| async { axum::Json(ApiDoc::openapi()) }),
        );
    }

    let cors = cors_layer(&state.config.security.allowed_origins)?;

    let app = app
        .route("/auth/logout", post(handlers::auth::logout))
        .route("/auth/validate", post(handlers::auth::validate))
        .merge(login_routes)
        .merge(protected_routes)
        .with_state(state.clone())
        // Global IP rate limiting
        .layer(from_fn_with_state(
            state.ip_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(cors);

    Ok(app)
}

fn cors_layer(allowed_origins: &[String]) -> Result<CorsLayer, AppError> {
    let allow_origin = if allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let origins = allowed_origins
            .iter()
            .map(|o| {
                o.parse::<HeaderValue>().map_err(|e| {
                    AppError::ConfigError(anyhow::anyhow!("Invalid CORS origin '{}': {}", o, e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        AllowOrigin::list(origins)
    };

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]))
}

/// Service health check
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
        (status = 503, description = "Service is unhealthy")
    ),
    tag = "Observability"
)]
pub async fn health_check(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<axum::Json<serde_json::Value>, AppError> {
    state.store.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Store health check failed");
        AppError::ServiceUnavailable
    })?;

    Ok(axum::Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.service_name,
        "version": state.config.service_version,
    })))
}
