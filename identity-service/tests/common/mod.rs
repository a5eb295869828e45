//! Shared harness for identity-service integration tests.
//!
//! Builds the full component graph on the in-memory store with a
//! recording provisioning client.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, Response},
    Router,
};
use http_body_util::BodyExt;
use identity_service::{
    build_router, build_state,
    config::{
        ApprovalPolicy, DatabaseConfig, Environment, IdentityConfig, ProvisioningConfig,
        RateLimitConfig, SecurityConfig, SessionPolicy, TokenPolicy,
    },
    models::{AuthorityLevel, User},
    services::{
        AuthSession, AuthenticatedUser, ClientInfo, LoginAttempt, LoginOutcome, MemoryStore,
        ProvisioningClient, Store,
    },
    utils::{hash_password, Password},
    AppState,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use totp_rs::{Algorithm, Secret, TOTP};
use tower::ServiceExt;

pub const TEST_SECRET: &str = "test-secret-0123456789abcdef0123456789";
pub const PASSWORD: &str = "correct-horse-1";

/// Code an authenticator app would show for `secret` right now.
pub fn current_totp(secret: &str) -> anyhow::Result<String> {
    let bytes = Secret::Encoded(secret.to_string())
        .to_bytes()
        .map_err(|e| anyhow::anyhow!("{:?}", e))?;
    let totp = TOTP::new(Algorithm::SHA1, 6, 1, 30, bytes, None, String::new())?;
    Ok(totp.generate_current()?)
}

/// Provisioning double that records calls and can be told to fail.
#[derive(Default)]
pub struct MockProvisioning {
    pub fail: AtomicBool,
    pub calls: Mutex<Vec<String>>,
}

impl MockProvisioning {
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) -> Result<(), anyhow::Error> {
        self.calls.lock().unwrap().push(call);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("provisioning unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl ProvisioningClient for MockProvisioning {
    async fn create_account(
        &self,
        email: &str,
        _display_name: &str,
        _password: &str,
    ) -> Result<(), anyhow::Error> {
        self.record(format!("create:{}", email))
    }

    async fn update_password(&self, email: &str, _password: &str) -> Result<(), anyhow::Error> {
        self.record(format!("password:{}", email))
    }

    async fn delete_account(&self, email: &str) -> Result<(), anyhow::Error> {
        self.record(format!("delete:{}", email))
    }
}

pub fn test_config() -> IdentityConfig {
    IdentityConfig {
        common: service_core::config::Config::default(),
        environment: Environment::Dev,
        service_name: "identity-service-test".to_string(),
        service_version: "test".to_string(),
        log_level: "error".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: "memory://".to_string(),
            max_connections: 1,
            min_connections: 1,
        },
        token: TokenPolicy::new(TEST_SECRET),
        sessions: SessionPolicy::default(),
        approvals: ApprovalPolicy::default(),
        security: SecurityConfig {
            allowed_origins: vec!["http://localhost:3000".to_string()],
        },
        rate_limit: RateLimitConfig {
            login_attempts: 1000,
            login_window_seconds: 60,
            global_ip_limit: 10000,
            global_ip_window_seconds: 60,
        },
        provisioning: ProvisioningConfig::default(),
        bootstrap: None,
    }
}

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub provisioning: Arc<MockProvisioning>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: IdentityConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let provisioning = Arc::new(MockProvisioning::default());
        let state = build_state(config, store.clone(), provisioning.clone());
        Self {
            state,
            store,
            provisioning,
        }
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone()).expect("router builds")
    }

    /// Insert a user directly, bypassing administrative checks.
    pub async fn seed_user(&self, email: &str, level: AuthorityLevel) -> User {
        let hash = hash_password(&Password::new(PASSWORD)).expect("hash");
        let user = User::new(
            email.to_string(),
            hash.into_string(),
            email.split('@').next().unwrap_or("user").to_string(),
            level,
        );
        self.store.insert_user(&user).await.expect("insert user");
        user
    }

    pub async fn try_login(
        &self,
        email: &str,
        password: &str,
        remember_me: bool,
    ) -> Result<LoginOutcome, identity_service::services::ServiceError> {
        self.state
            .auth
            .login(LoginAttempt {
                email: email.to_string(),
                password: Password::new(password),
                remember_me,
                device_fingerprint: None,
                device_name: None,
                client: client(),
            })
            .await
    }

    /// Log in and expect an immediately established session.
    pub async fn login(&self, email: &str) -> AuthSession {
        match self.try_login(email, PASSWORD, false).await.expect("login") {
            LoginOutcome::Authenticated(session) => session,
            other => panic!("expected a session, got {:?}", other),
        }
    }

    pub async fn actor(&self, token: &str) -> AuthenticatedUser {
        self.state
            .auth
            .validate_token(token, None)
            .await
            .expect("token validates")
    }

    /// Seed a user, log in, and return their validated identity.
    pub async fn signed_in(&self, email: &str, level: AuthorityLevel) -> (AuthSession, AuthenticatedUser) {
        self.seed_user(email, level).await;
        let session = self.login(email).await;
        let actor = self.actor(&session.token).await;
        (session, actor)
    }

    pub async fn audit_actions(&self) -> Vec<String> {
        self.store
            .audit_entries()
            .into_iter()
            .map(|entry| entry.action)
            .collect()
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router().oneshot(request).await.expect("request completes")
    }
}

pub fn client() -> ClientInfo {
    ClientInfo {
        ip_address: Some("198.51.100.10".to_string()),
        user_agent: Some("integration-test".to_string()),
    }
}

pub fn json_request(method: &str, uri: &str, token: Option<&str>, body: serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::from(body.to_string())).expect("request")
}

pub fn empty_request(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).expect("request")
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}
