mod common;

use chrono::{Duration, Utc};
use common::{client, current_totp, TestApp, PASSWORD};
use identity_service::{
    models::AuthorityLevel,
    services::{LoginAttempt, LoginOutcome, SecondFactorAttempt, ServiceError, Store},
    utils::Password,
};
use uuid::Uuid;

/// Turn on 2FA for a seeded user and return (secret, recovery codes).
async fn enable_two_factor(app: &TestApp, user_id: Uuid) -> (String, Vec<String>) {
    let setup = app.state.two_factor.setup(user_id).await.unwrap();
    let code = current_totp(&setup.secret).unwrap();
    let codes = app
        .state
        .two_factor
        .enable(user_id, &code, None)
        .await
        .unwrap();
    (setup.secret, codes)
}

async fn challenge_for(app: &TestApp, email: &str, fingerprint: Option<&str>) -> String {
    let outcome = app
        .state
        .auth
        .login(LoginAttempt {
            email: email.to_string(),
            password: Password::new(PASSWORD),
            remember_me: false,
            device_fingerprint: fingerprint.map(str::to_string),
            device_name: None,
            client: client(),
        })
        .await
        .unwrap();
    match outcome {
        LoginOutcome::SecondFactorRequired { challenge } => challenge.token,
        other => panic!("expected a challenge, got {:?}", other),
    }
}

fn second_factor(challenge: String, code: Option<String>, recovery: Option<String>) -> SecondFactorAttempt {
    SecondFactorAttempt {
        challenge,
        code,
        recovery_code: recovery,
        remember_device: false,
        device_name: None,
        client: client(),
    }
}

#[tokio::test]
async fn test_token_lifetime_follows_remember_me() {
    let app = TestApp::new();
    app.seed_user("alice@example.com", AuthorityLevel::User).await;

    let standard = match app.try_login("alice@example.com", PASSWORD, false).await.unwrap() {
        LoginOutcome::Authenticated(s) => s,
        other => panic!("unexpected outcome {:?}", other),
    };
    let remembered = match app.try_login("alice@example.com", PASSWORD, true).await.unwrap() {
        LoginOutcome::Authenticated(s) => s,
        other => panic!("unexpected outcome {:?}", other),
    };

    let now = Utc::now();
    let drift = |expires: chrono::DateTime<Utc>, ttl: Duration| (expires - (now + ttl)).num_seconds().abs();
    assert!(drift(standard.expires_at, Duration::days(7)) < 60);
    assert!(drift(remembered.expires_at, Duration::days(30)) < 60);
}

#[tokio::test]
async fn test_email_is_case_insensitive() {
    let app = TestApp::new();
    app.seed_user("bob@example.com", AuthorityLevel::User).await;

    let outcome = app.try_login("  Bob@Example.COM ", PASSWORD, false).await;
    assert!(matches!(outcome, Ok(LoginOutcome::Authenticated(_))));
}

#[tokio::test]
async fn test_unknown_email_and_wrong_password_look_the_same() {
    let app = TestApp::new();
    app.seed_user("carol@example.com", AuthorityLevel::User).await;

    let unknown = app
        .try_login("nobody@example.com", PASSWORD, false)
        .await
        .unwrap_err();
    let wrong = app
        .try_login("carol@example.com", "wrong-password-9", false)
        .await
        .unwrap_err();

    assert!(matches!(unknown, ServiceError::InvalidCredentials));
    assert!(matches!(wrong, ServiceError::InvalidCredentials));
    assert_eq!(unknown.to_string(), wrong.to_string());

    let failures = app
        .audit_actions()
        .await
        .into_iter()
        .filter(|a| a == "LOGIN_FAILED")
        .count();
    assert_eq!(failures, 2);
}

#[tokio::test]
async fn test_disabled_account_cannot_log_in() {
    let app = TestApp::new();
    let (_, admin) = app.signed_in("admin@example.com", AuthorityLevel::Admin).await;
    let user = app.seed_user("dave@example.com", AuthorityLevel::User).await;

    app.state
        .users
        .set_enabled(&admin, user.user_id, false, None)
        .await
        .unwrap();

    let err = app
        .try_login("dave@example.com", PASSWORD, false)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::AccountDisabled));
}

#[tokio::test]
async fn test_two_factor_login_with_totp() {
    let app = TestApp::new();
    let user = app.seed_user("erin@example.com", AuthorityLevel::User).await;
    let (secret, _) = enable_two_factor(&app, user.user_id).await;

    let challenge = challenge_for(&app, "erin@example.com", None).await;
    // The challenge is not an access token
    assert!(app.state.auth.validate_token(&challenge, None).await.is_err());

    let code = current_totp(&secret).unwrap();
    let session = app
        .state
        .auth
        .complete_second_factor(second_factor(challenge, Some(code), None))
        .await
        .unwrap();

    let actor = app.actor(&session.token).await;
    assert_eq!(actor.user_id(), user.user_id);
    assert!(app.audit_actions().await.contains(&"LOGIN_2FA_REQUIRED".to_string()));
}

#[tokio::test]
async fn test_second_factor_needs_exactly_one_code() {
    let app = TestApp::new();
    let user = app.seed_user("frank@example.com", AuthorityLevel::User).await;
    let (secret, codes) = enable_two_factor(&app, user.user_id).await;

    let challenge = challenge_for(&app, "frank@example.com", None).await;
    let neither = app
        .state
        .auth
        .complete_second_factor(second_factor(challenge.clone(), None, None))
        .await
        .unwrap_err();
    assert!(matches!(neither, ServiceError::Validation(_)));

    let both = app
        .state
        .auth
        .complete_second_factor(second_factor(
            challenge,
            Some(current_totp(&secret).unwrap()),
            Some(codes[0].clone()),
        ))
        .await
        .unwrap_err();
    assert!(matches!(both, ServiceError::Validation(_)));
}

#[tokio::test]
async fn test_remembered_device_skips_second_factor() {
    let app = TestApp::new();
    let user = app.seed_user("gina@example.com", AuthorityLevel::User).await;
    let (secret, _) = enable_two_factor(&app, user.user_id).await;

    let challenge = challenge_for(&app, "gina@example.com", Some("laptop-fp")).await;
    let mut attempt = second_factor(challenge, Some(current_totp(&secret).unwrap()), None);
    attempt.remember_device = true;
    attempt.device_name = Some("Laptop".to_string());
    app.state.auth.complete_second_factor(attempt).await.unwrap();

    let outcome = app
        .state
        .auth
        .login(LoginAttempt {
            email: "gina@example.com".to_string(),
            password: Password::new(PASSWORD),
            remember_me: false,
            device_fingerprint: Some("laptop-fp".to_string()),
            device_name: None,
            client: client(),
        })
        .await
        .unwrap();
    assert!(matches!(outcome, LoginOutcome::Authenticated(_)));
    assert!(app
        .audit_actions()
        .await
        .contains(&"LOGIN_2FA_DEVICE_BYPASS".to_string()));

    // An unknown fingerprint still gets a challenge
    challenge_for(&app, "gina@example.com", Some("phone-fp")).await;
}

#[tokio::test]
async fn test_recovery_code_is_single_use() {
    let app = TestApp::new();
    let user = app.seed_user("hank@example.com", AuthorityLevel::User).await;
    let (_, codes) = enable_two_factor(&app, user.user_id).await;

    let challenge = challenge_for(&app, "hank@example.com", None).await;
    app.state
        .auth
        .complete_second_factor(second_factor(challenge, None, Some(codes[0].clone())))
        .await
        .unwrap();

    let challenge = challenge_for(&app, "hank@example.com", None).await;
    let err = app
        .state
        .auth
        .complete_second_factor(second_factor(challenge, None, Some(codes[0].clone())))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidSecondFactor));

    let actions = app.audit_actions().await;
    assert!(actions.contains(&"RECOVERY_CODE_USED".to_string()));
    assert!(actions.contains(&"RECOVERY_CODE_FAILED".to_string()));
}

#[tokio::test]
async fn test_concurrent_recovery_code_use_succeeds_once() {
    let app = TestApp::new();
    let user = app.seed_user("ivy@example.com", AuthorityLevel::User).await;
    let (_, codes) = enable_two_factor(&app, user.user_id).await;

    let two_factor = &app.state.two_factor;
    let (first, second) = tokio::join!(
        two_factor.consume_recovery_code(user.user_id, &codes[1]),
        two_factor.consume_recovery_code(user.user_id, &codes[1]),
    );
    let successes = [first.unwrap(), second.unwrap()]
        .iter()
        .filter(|ok| **ok)
        .count();
    assert_eq!(successes, 1);
}

#[tokio::test]
async fn test_spent_recovery_code_survives_account_edits() {
    let app = TestApp::new();
    let user = app.seed_user("ivy@example.com", AuthorityLevel::User).await;
    let (_, codes) = enable_two_factor(&app, user.user_id).await;

    let challenge = challenge_for(&app, "ivy@example.com", None).await;
    let session = app
        .state
        .auth
        .complete_second_factor(second_factor(challenge, None, Some(codes[0].clone())))
        .await
        .unwrap();
    let actor = app.actor(&session.token).await;

    app.state
        .users
        .update_own_profile(&actor, Some("Ivy".to_string()), None, None)
        .await
        .unwrap();
    app.state
        .users
        .change_password(&actor, &Password::new(PASSWORD), &Password::new("another-horse-2"), None)
        .await
        .unwrap();

    let stored = app.store.find_user_by_id(user.user_id).await.unwrap().unwrap();
    assert_eq!(stored.display_name, "Ivy");
    assert_eq!(stored.recovery_codes.len(), codes.len() - 1);
    assert!(!app
        .state
        .two_factor
        .consume_recovery_code(user.user_id, &codes[0])
        .await
        .unwrap());
}

