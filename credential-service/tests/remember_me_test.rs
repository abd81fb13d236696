mod common;

use chrono::Duration;
use common::{login_request, TestContext, PASSWORD};
use credential_service::{
    models::SessionSource,
    services::{AuthError, LoginOutcome, SessionOrigin},
};

fn origin() -> SessionOrigin {
    SessionOrigin {
        source: SessionSource::Web,
        ip_address: Some("198.51.100.4".to_string()),
        user_agent: Some("Safari".to_string()),
    }
}

async fn remembered(ctx: &TestContext, email: &str) -> (uuid::Uuid, String) {
    let company = ctx.company(|_| {}).await;
    let user = ctx.user(&company, email).await;
    let mut request = login_request(&user.email, PASSWORD);
    request.remember_me = true;
    match ctx.login().login(ctx.uow(), &request).await.unwrap() {
        LoginOutcome::Authenticated(auth) => (user.id, auth.remember_me_token.unwrap()),
        other => panic!("expected Authenticated, got {:?}", other),
    }
}

#[tokio::test]
async fn test_redeeming_rotates_the_token() {
    let ctx = TestContext::new();
    let (user_id, token) = remembered(&ctx, "rotate@example.com").await;

    let auth = ctx
        .login()
        .login_with_remember_me(ctx.uow(), &token, &origin())
        .await
        .unwrap();
    assert_eq!(auth.user.id, user_id);
    assert!(auth.session.mfa_verified);
    assert_eq!(auth.session.user_agent.as_deref(), Some("Safari"));
    let replacement = auth.remember_me_token.unwrap();
    assert_ne!(replacement, token);

    let err = ctx
        .login()
        .login_with_remember_me(ctx.uow(), &token, &origin())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidCredentials));

    ctx.login()
        .login_with_remember_me(ctx.uow(), &replacement, &origin())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_token_expires_after_thirty_days() {
    let ctx = TestContext::new();
    let (_, token) = remembered(&ctx, "expiring@example.com").await;

    ctx.advance(Duration::days(30));
    let err = ctx
        .login()
        .remember_me()
        .redeem(ctx.uow(), &token)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidCredentials));
}

#[tokio::test]
async fn test_malformed_and_tampered_tokens_are_rejected() {
    let ctx = TestContext::new();
    let (_, token) = remembered(&ctx, "tamper@example.com").await;
    let (prefix, _) = token.split_once('.').unwrap();

    for presented in [
        "no-separator".to_string(),
        format!("{}.forged", prefix),
        String::new(),
    ] {
        let err = ctx
            .login()
            .remember_me()
            .redeem(ctx.uow(), &presented)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    // The genuine token survived the forgeries.
    ctx.login().remember_me().redeem(ctx.uow(), &token).await.unwrap();
}

#[tokio::test]
async fn test_remember_me_respects_lockout() {
    let ctx = TestContext::new();
    let (_, token) = remembered(&ctx, "locked-out@example.com").await;

    for _ in 0..5 {
        ctx.login()
            .login(ctx.uow(), &login_request("locked-out@example.com", "wrong-password"))
            .await
            .unwrap_err();
    }
    let err = ctx
        .login()
        .login_with_remember_me(ctx.uow(), &token, &origin())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::AccountLocked { .. }));
}
