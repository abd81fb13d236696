mod common;

use chrono::Duration;
use common::{login_request, TestContext, PASSWORD};
use credential_service::{
    config::AuthConfig,
    db::UnitOfWork,
    models::{AuditEventType, Session, User},
    services::{AuthError, LoginOutcome, MfaVerification, MockNotifier},
};

async fn pending_session(ctx: &TestContext, user: &User) -> Session {
    match ctx
        .login()
        .login(ctx.uow(), &login_request(&user.email, PASSWORD))
        .await
        .unwrap()
    {
        LoginOutcome::MfaPending { session, .. } => session,
        other => panic!("expected MfaPending, got {:?}", other),
    }
}

fn verification(user: &User, sid: &str, code: &str) -> MfaVerification {
    MfaVerification {
        user_id: user.id,
        code: code.to_string(),
        sid: sid.to_string(),
        ip_address: None,
        user_agent: None,
        trust_device: None,
        remember_me: false,
    }
}

/// A six-digit code guaranteed to differ from `code`.
fn wrong(code: &str) -> String {
    code.chars()
        .map(|c| if c == '9' { '0' } else { char::from(c as u8 + 1) })
        .collect()
}

#[tokio::test]
async fn test_correct_code_completes_pending_session() {
    let ctx = TestContext::new();
    let company = ctx.company(|_| {}).await;
    let (user, _) = ctx.mfa_user(&company, "mfa@example.com").await;
    let session = pending_session(&ctx, &user).await;
    let code = ctx.notifier.last_code_for(user.id).unwrap();
    assert_eq!(code.len(), 6);

    let auth = ctx
        .login()
        .verify_mfa_code(ctx.uow(), &verification(&user, &session.sid, &code))
        .await
        .unwrap();
    assert!(auth.session.mfa_verified);
    ctx.login()
        .sessions()
        .authenticate(ctx.uow(), &session.sid)
        .await
        .unwrap();

    // Consumed on success.
    let err = ctx
        .login()
        .verify_mfa_code(ctx.uow(), &verification(&user, &session.sid, &code))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidCode));

    let events = ctx.audit_types(Some(user.id)).await;
    assert!(events.contains(&AuditEventType::MfaChallengeSent));
    assert!(events.contains(&AuditEventType::MfaVerified));
}

#[tokio::test]
async fn test_wrong_code_is_rejected_and_audited() {
    let ctx = TestContext::new();
    let company = ctx.company(|_| {}).await;
    let (user, _) = ctx.mfa_user(&company, "typo@example.com").await;
    let session = pending_session(&ctx, &user).await;
    let code = ctx.notifier.last_code_for(user.id).unwrap();

    let err = ctx
        .login()
        .verify_mfa_code(ctx.uow(), &verification(&user, &session.sid, &wrong(&code)))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidCode));
    assert!(ctx.audit_types(Some(user.id)).await.contains(&AuditEventType::MfaFailed));

    // One miss does not burn the code.
    ctx.login()
        .verify_mfa_code(ctx.uow(), &verification(&user, &session.sid, &code))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_code_is_discarded_after_too_many_attempts() {
    let ctx = TestContext::new();
    let company = ctx.company(|_| {}).await;
    let (user, _) = ctx.mfa_user(&company, "guess@example.com").await;
    let session = pending_session(&ctx, &user).await;
    let code = ctx.notifier.last_code_for(user.id).unwrap();

    for _ in 0..5 {
        ctx.login()
            .verify_mfa_code(ctx.uow(), &verification(&user, &session.sid, &wrong(&code)))
            .await
            .unwrap_err();
    }
    assert!(ctx.store.get_mfa_code(user.id).await.unwrap().is_none());

    let err = ctx
        .login()
        .verify_mfa_code(ctx.uow(), &verification(&user, &session.sid, &code))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidCode));
}

#[tokio::test]
async fn test_code_expires() {
    let ctx = TestContext::new();
    let company = ctx.company(|_| {}).await;
    let (user, _) = ctx.mfa_user(&company, "late@example.com").await;
    let session = pending_session(&ctx, &user).await;
    let code = ctx.notifier.last_code_for(user.id).unwrap();

    ctx.advance(Duration::minutes(10));
    let err = ctx
        .login()
        .verify_mfa_code(ctx.uow(), &verification(&user, &session.sid, &code))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidCode));
}

#[tokio::test]
async fn test_new_code_replaces_pending_one() {
    let ctx = TestContext::new();
    let company = ctx.company(|_| {}).await;
    let (user, _) = ctx.mfa_user(&company, "resend@example.com").await;
    let session = pending_session(&ctx, &user).await;
    let first = ctx.notifier.last_code_for(user.id).unwrap();

    ctx.login().mfa().send_code(ctx.uow(), &user).await.unwrap();
    let second = ctx.notifier.last_code_for(user.id).unwrap();

    if first != second {
        let err = ctx
            .login()
            .verify_mfa_code(ctx.uow(), &verification(&user, &session.sid, &first))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCode));
    }
    ctx.login()
        .verify_mfa_code(ctx.uow(), &verification(&user, &session.sid, &second))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_code_must_target_own_pending_session() {
    let ctx = TestContext::new();
    let company = ctx.company(|_| {}).await;
    let (alice, _) = ctx.mfa_user(&company, "alice@example.com").await;
    let (bob, _) = ctx.mfa_user(&company, "bob@example.com").await;
    let bobs = pending_session(&ctx, &bob).await;
    pending_session(&ctx, &alice).await;
    let code = ctx.notifier.last_code_for(alice.id).unwrap();

    let err = ctx
        .login()
        .verify_mfa_code(ctx.uow(), &verification(&alice, &bobs.sid, &code))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidSession));
}

#[tokio::test]
async fn test_recovery_code_is_single_use() {
    let ctx = TestContext::new();
    let company = ctx.company(|_| {}).await;
    let (user, codes) = ctx.mfa_user(&company, "recover@example.com").await;
    assert_eq!(codes.len(), 10);

    let session = pending_session(&ctx, &user).await;
    // Case and separators are not significant.
    let presented = codes[3].to_uppercase().replace('-', " ");
    let auth = ctx
        .login()
        .verify_mfa_recovery_code(ctx.uow(), &verification(&user, &session.sid, &presented))
        .await
        .unwrap();
    assert!(auth.session.mfa_verified);
    assert_eq!(
        ctx.login()
            .mfa()
            .remaining_recovery_codes(ctx.uow(), user.id)
            .await
            .unwrap(),
        9
    );

    let session = pending_session(&ctx, &user).await;
    let err = ctx
        .login()
        .verify_mfa_recovery_code(ctx.uow(), &verification(&user, &session.sid, &codes[3]))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidRecoveryCode));

    let events = ctx.audit_types(Some(user.id)).await;
    assert!(events.contains(&AuditEventType::RecoveryCodeUsed));
}

#[tokio::test]
async fn test_regenerating_recovery_codes_invalidates_old_set() {
    let ctx = TestContext::new();
    let company = ctx.company(|_| {}).await;
    let (user, old) = ctx.mfa_user(&company, "regen@example.com").await;

    let fresh = ctx
        .login()
        .mfa()
        .regenerate_recovery_codes(ctx.uow(), &user)
        .await
        .unwrap();
    assert_eq!(fresh.len(), 10);

    let session = pending_session(&ctx, &user).await;
    let err = ctx
        .login()
        .verify_mfa_recovery_code(ctx.uow(), &verification(&user, &session.sid, &old[0]))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidRecoveryCode));

    ctx.login()
        .verify_mfa_recovery_code(ctx.uow(), &verification(&user, &session.sid, &fresh[0]))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_delivery_failure_still_leaves_usable_code() {
    let ctx = TestContext::with_notifier(AuthConfig::local_defaults(), MockNotifier::failing());
    let company = ctx.company(|_| {}).await;
    let (user, _) = ctx.mfa_user(&company, "offline@example.com").await;

    let outcome = ctx
        .login()
        .login(ctx.uow(), &login_request(&user.email, PASSWORD))
        .await
        .unwrap();
    match outcome {
        LoginOutcome::MfaPending { challenge, .. } => assert!(!challenge.sent),
        other => panic!("expected MfaPending, got {:?}", other),
    }
    assert!(ctx.store.get_mfa_code(user.id).await.unwrap().is_some());
    assert_eq!(ctx.notifier.sent_count(), 0);
}

#[tokio::test]
async fn test_disabling_mfa_revokes_trusted_devices_and_codes() {
    let ctx = TestContext::new();
    let company = ctx.company(|_| {}).await;
    let (user, _) = ctx.mfa_user(&company, "disable@example.com").await;

    let devices = ctx.login().mfa().devices();
    devices
        .trust(ctx.uow(), user.id, "tablet-11", None, devices.default_ttl())
        .await
        .unwrap();
    assert!(devices.is_trusted(ctx.uow(), user.id, "tablet-11").await.unwrap());

    ctx.login().mfa().disable_mfa(ctx.uow(), &user).await.unwrap();
    assert!(!devices.is_trusted(ctx.uow(), user.id, "tablet-11").await.unwrap());
    assert_eq!(
        ctx.login()
            .mfa()
            .remaining_recovery_codes(ctx.uow(), user.id)
            .await
            .unwrap(),
        0
    );

    let outcome = ctx
        .login()
        .login(ctx.uow(), &login_request(&user.email, PASSWORD))
        .await
        .unwrap();
    assert!(matches!(outcome, LoginOutcome::Authenticated(_)));
}
