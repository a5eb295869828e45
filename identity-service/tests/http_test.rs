mod common;

use axum::http::StatusCode;
use common::{body_json, current_totp, empty_request, json_request, TestApp, PASSWORD};
use identity_service::models::AuthorityLevel;
use serde_json::json;

#[tokio::test]
async fn test_health_check() {
    let app = TestApp::new();
    let response = app.send(empty_request("GET", "/health", None)).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "identity-service-test");
}

#[tokio::test]
async fn test_login_returns_token_and_profile() {
    let app = TestApp::new();
    app.seed_user("alice@example.com", AuthorityLevel::User).await;

    let response = app
        .send(json_request(
            "POST",
            "/auth/login",
            None,
            json!({ "email": "alice@example.com", "password": PASSWORD }),
        ))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["requires2FA"], false);
    assert_eq!(body["user"]["email"], "alice@example.com");
    assert!(body["user"].get("passwordHash").is_none());
    assert!(body["token"].as_str().is_some_and(|t| !t.is_empty()));
}

#[tokio::test]
async fn test_login_failure_is_generic() {
    let app = TestApp::new();
    app.seed_user("bob@example.com", AuthorityLevel::User).await;

    let wrong = app
        .send(json_request(
            "POST",
            "/auth/login",
            None,
            json!({ "email": "bob@example.com", "password": "wrong-password-1" }),
        ))
        .await;
    let unknown = app
        .send(json_request(
            "POST",
            "/auth/login",
            None,
            json!({ "email": "ghost@example.com", "password": PASSWORD }),
        ))
        .await;

    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(unknown.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(wrong).await, body_json(unknown).await);
}

#[tokio::test]
async fn test_two_factor_login_over_http() {
    let app = TestApp::new();
    let user = app.seed_user("carol@example.com", AuthorityLevel::User).await;
    let setup = app.state.two_factor.setup(user.user_id).await.unwrap();
    app.state
        .two_factor
        .enable(user.user_id, &current_totp(&setup.secret).unwrap(), None)
        .await
        .unwrap();

    let response = app
        .send(json_request(
            "POST",
            "/auth/login",
            None,
            json!({ "email": "carol@example.com", "password": PASSWORD }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["requires2FA"], true);
    assert!(body.get("token").is_none());
    let challenge = body["challengeToken"].as_str().unwrap().to_string();

    let response = app
        .send(json_request(
            "POST",
            "/auth/2fa/verify",
            None,
            json!({
                "challengeToken": challenge,
                "code": current_totp(&setup.secret).unwrap(),
            }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert!(body["token"].is_string());
}

#[tokio::test]
async fn test_protected_routes_need_a_live_token() {
    let app = TestApp::new();
    app.seed_user("dave@example.com", AuthorityLevel::User).await;
    let session = app.login("dave@example.com").await;

    let missing = app.send(empty_request("GET", "/auth/me", None)).await;
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let ok = app
        .send(empty_request("GET", "/auth/me", Some(&session.token)))
        .await;
    assert_eq!(ok.status(), StatusCode::OK);

    let logout = app
        .send(empty_request("POST", "/auth/logout", Some(&session.token)))
        .await;
    assert_eq!(logout.status(), StatusCode::OK);

    let after = app
        .send(empty_request("GET", "/auth/me", Some(&session.token)))
        .await;
    assert_eq!(after.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_validate_reports_instead_of_rejecting() {
    let app = TestApp::new();
    app.seed_user("erin@example.com", AuthorityLevel::User).await;
    let session = app.login("erin@example.com").await;

    let response = app
        .send(empty_request("POST", "/auth/validate", Some(&session.token)))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["valid"], true);
    assert!(body["user"].is_object());

    let response = app
        .send(empty_request("POST", "/auth/validate", Some("not-a-token")))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["valid"], false);
}

#[tokio::test]
async fn test_admin_deletion_is_accepted_for_approval() {
    let app = TestApp::new();
    let (admin, _) = app.signed_in("admin@example.com", AuthorityLevel::Admin).await;
    let target = app.seed_user("target@example.com", AuthorityLevel::User).await;

    let response = app
        .send(json_request(
            "DELETE",
            &format!("/admin/users/{}", target.user_id),
            Some(&admin.token),
            json!({ "reason": "inactive account" }),
        ))
        .await;

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["status"], "pending");
    assert_eq!(body["actionType"], "delete_user");
    assert_eq!(body["targetUserId"], target.user_id.to_string());
}

#[tokio::test]
async fn test_regular_user_cannot_list_users() {
    let app = TestApp::new();
    let (session, _) = app.signed_in("plain@example.com", AuthorityLevel::User).await;

    let response = app
        .send(empty_request("GET", "/admin/users", Some(&session.token)))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
