mod common;

use chrono::Duration;
use common::{TestContext, REDIRECT_URI};
use credential_service::{
    config::AuthConfig,
    db::UnitOfWork,
    models::{AuditEventType, AuthorizationCode, ClientType, GrantType},
    services::{
        oauth::{s256_challenge, MAX_TOKEN_LIFETIME_SECONDS},
        AuthError, ClientRegistration, OAuthTokenService,
    },
};
use uuid::Uuid;

const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

fn stored_code(ctx: &TestContext, challenge: Option<&str>, method: Option<&str>) -> AuthorizationCode {
    let now = ctx.clock_now();
    AuthorizationCode {
        id: Uuid::new_v4(),
        code_hash: "unused".to_string(),
        client_id: None,
        user_id: None,
        redirect_uri: REDIRECT_URI.to_string(),
        scope: String::new(),
        code_challenge: challenge.map(str::to_string),
        code_challenge_method: method.map(str::to_string),
        expires_at: now + Duration::minutes(10),
        used_at: None,
        created_at: now,
    }
}

#[tokio::test]
async fn test_code_is_single_use() {
    let ctx = TestContext::new();
    let (client, _) = ctx.confidential_client().await;
    let company = ctx.company(|_| {}).await;
    let user = ctx.user(&company, "code@example.com").await;
    let code = ctx.issue_code(&client, &user, "documents:read", None).await;

    let issued = ctx
        .oauth()
        .exchange_authorization_code(ctx.uow(), &client, &code, Some(REDIRECT_URI), None)
        .await
        .unwrap();
    assert_eq!(issued.scope, "documents:read");

    let err = ctx
        .oauth()
        .exchange_authorization_code(ctx.uow(), &client, &code, Some(REDIRECT_URI), None)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidGrant));

    let events = ctx.audit_types(Some(user.id)).await;
    let minted = events
        .iter()
        .filter(|e| **e == AuditEventType::OAuthTokenIssued)
        .count();
    assert_eq!(minted, 1);
    assert!(events.contains(&AuditEventType::AuthorizationCodeReplay));
}

#[tokio::test]
async fn test_code_replay_revokes_tokens_minted_from_it() {
    let ctx = TestContext::new();
    let (client, _) = ctx.confidential_client().await;
    let company = ctx.company(|_| {}).await;
    let user = ctx.user(&company, "replay@example.com").await;
    let code = ctx.issue_code(&client, &user, "", None).await;

    let issued = ctx
        .oauth()
        .exchange_authorization_code(ctx.uow(), &client, &code, Some(REDIRECT_URI), None)
        .await
        .unwrap();
    ctx.oauth()
        .exchange_authorization_code(ctx.uow(), &client, &code, Some(REDIRECT_URI), None)
        .await
        .unwrap_err();

    let err = ctx
        .oauth()
        .get_access_token(ctx.uow(), &issued.access_token)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidGrant));
    let err = ctx
        .oauth()
        .refresh(ctx.uow(), &client, issued.refresh_token.as_deref().unwrap(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidGrant));
}

#[tokio::test]
async fn test_code_exchange_checks_client_redirect_and_expiry() {
    let ctx = TestContext::new();
    let (client, _) = ctx.confidential_client().await;
    let (other, _) = ctx.confidential_client().await;
    let company = ctx.company(|_| {}).await;
    let user = ctx.user(&company, "checks@example.com").await;
    let code = ctx.issue_code(&client, &user, "", None).await;

    let err = ctx
        .oauth()
        .exchange_authorization_code(ctx.uow(), &other, &code, Some(REDIRECT_URI), None)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidGrant));

    let err = ctx
        .oauth()
        .exchange_authorization_code(
            ctx.uow(),
            &client,
            &code,
            Some("https://evil.example.com/callback"),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidGrant));

    ctx.advance(Duration::seconds(601));
    let err = ctx
        .oauth()
        .exchange_authorization_code(ctx.uow(), &client, &code, Some(REDIRECT_URI), None)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidGrant));
}

#[tokio::test]
async fn test_s256_pkce_round_trip() {
    let ctx = TestContext::new();
    let client = ctx.public_client().await;
    let company = ctx.company(|_| {}).await;
    let user = ctx.user(&company, "pkce@example.com").await;
    let challenge = s256_challenge(VERIFIER);

    let code = ctx
        .issue_code(&client, &user, "profile", Some((challenge.as_str(), "S256")))
        .await;
    let err = ctx
        .oauth()
        .exchange_authorization_code(
            ctx.uow(),
            &client,
            &code,
            Some(REDIRECT_URI),
            Some("not-the-verifier"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidGrant));

    let issued = ctx
        .oauth()
        .exchange_authorization_code(ctx.uow(), &client, &code, Some(REDIRECT_URI), Some(VERIFIER))
        .await
        .unwrap();
    assert_eq!(issued.scope, "profile");
}

#[tokio::test]
async fn test_code_without_challenge_accepts_any_verifier() {
    let ctx = TestContext::new();
    let code = stored_code(&ctx, None, None);
    assert!(ctx.oauth().validate_code_challenge(&code, None));
    assert!(ctx.oauth().validate_code_challenge(&code, Some("anything")));
}

#[tokio::test]
async fn test_unknown_challenge_method_fails_closed() {
    let ctx = TestContext::new();
    let code = stored_code(&ctx, Some(VERIFIER), Some("invalid"));
    assert!(!ctx.oauth().validate_code_challenge(&code, Some(VERIFIER)));

    let challenge = s256_challenge(VERIFIER);
    let code = stored_code(&ctx, Some(&challenge), Some("invalid"));
    assert!(!ctx.oauth().validate_code_challenge(&code, Some(VERIFIER)));

    let code = stored_code(&ctx, Some(&challenge), Some("S256"));
    assert!(!ctx.oauth().validate_code_challenge(&code, None));
}

#[tokio::test]
async fn test_plain_pkce_depends_on_configuration() {
    let ctx = TestContext::new();
    let client = ctx.public_client().await;
    let err = ctx
        .oauth()
        .check_authorization_request(&client, "code", REDIRECT_URI, "", Some(VERIFIER), Some("plain"))
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidRequest(_)));

    let mut config = AuthConfig::local_defaults();
    config.oauth.allow_plain_pkce = true;
    let ctx = TestContext::with_config(config);
    let client = ctx.public_client().await;
    let company = ctx.company(|_| {}).await;
    let user = ctx.user(&company, "plain@example.com").await;
    let code = ctx
        .issue_code(&client, &user, "", Some((VERIFIER, "plain")))
        .await;
    ctx.oauth()
        .exchange_authorization_code(ctx.uow(), &client, &code, Some(REDIRECT_URI), Some(VERIFIER))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_public_client_must_send_challenge() {
    let ctx = TestContext::new();
    let client = ctx.public_client().await;
    let err = ctx
        .oauth()
        .check_authorization_request(&client, "code", REDIRECT_URI, "", None, None)
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_empty_scope_yields_full_allowance() {
    let ctx = TestContext::new();
    let (client, _) = ctx.confidential_client().await;

    let granted = OAuthTokenService::validate_scope(&client, "").unwrap();
    assert_eq!(granted.to_string(), "documents:* profile");

    let granted = OAuthTokenService::validate_scope(&client, "documents:write").unwrap();
    assert_eq!(granted.to_string(), "documents:write");
}

#[tokio::test]
async fn test_scope_outside_allowance_is_rejected_whole() {
    let ctx = TestContext::new();
    let (client, _) = ctx.confidential_client().await;

    for requested in ["billing:read", "profile billing:read", "*", "documents:* admin"] {
        let err = OAuthTokenService::validate_scope(&client, requested).unwrap_err();
        assert!(matches!(err, AuthError::InvalidScope), "{}", requested);
    }
    let err = OAuthTokenService::validate_scope(&client, "docu*ments").unwrap_err();
    assert!(matches!(err, AuthError::InvalidScope));
}

#[tokio::test]
async fn test_client_authentication() {
    let ctx = TestContext::new();
    let public = ctx.public_client().await;
    let (confidential, secret) = ctx.confidential_client().await;

    let found = ctx
        .oauth()
        .get_client(ctx.uow(), &public.client_id, None)
        .await
        .unwrap();
    assert_eq!(found.id, public.id);

    let err = ctx
        .oauth()
        .get_client(ctx.uow(), &confidential.client_id, Some("wrong-secret"))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidClient));

    let err = ctx
        .oauth()
        .get_client(ctx.uow(), &confidential.client_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidClient));

    ctx.oauth()
        .get_client(ctx.uow(), &confidential.client_id, Some(&secret))
        .await
        .unwrap();

    let err = ctx
        .oauth()
        .get_client(ctx.uow(), "unknown-client", None)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidClient));
}

#[tokio::test]
async fn test_redirect_uri_must_match_exactly() {
    let ctx = TestContext::new();
    let (client, _) = ctx.confidential_client().await;

    ctx.oauth()
        .resolve_redirect(ctx.uow(), &client.client_id, REDIRECT_URI)
        .await
        .unwrap();
    for candidate in [
        "https://app.example.com/callback/extra",
        "https://app.example.com/callback?x=1",
        "https://app.example.com",
    ] {
        let err = ctx
            .oauth()
            .resolve_redirect(ctx.uow(), &client.client_id, candidate)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidRequest(_)));
    }
}

#[tokio::test]
async fn test_client_without_code_grant_cannot_authorize() {
    let ctx = TestContext::new();
    let (client, _) = ctx
        .register_client(
            ClientType::Confidential,
            vec![GrantType::RefreshToken],
            &["profile"],
        )
        .await;
    let err = ctx
        .oauth()
        .check_authorization_request(&client, "code", REDIRECT_URI, "", None, None)
        .unwrap_err();
    assert!(matches!(err, AuthError::UnauthorizedClient));
}

#[tokio::test]
async fn test_registration_rejects_out_of_range_lifetimes() {
    let ctx = TestContext::new();

    for (access, refresh) in [
        (-5, -5),
        (0, 86400),
        (3600, 0),
        (3600, i64::MAX),
        (MAX_TOKEN_LIFETIME_SECONDS + 1, 86400),
    ] {
        let err = ctx
            .oauth()
            .register_client(
                ctx.uow(),
                ClientRegistration {
                    name: "Bad Lifetimes".to_string(),
                    client_type: ClientType::Confidential,
                    redirect_uris: vec![REDIRECT_URI.to_string()],
                    grants: vec![GrantType::AuthorizationCode, GrantType::RefreshToken],
                    allowed_scopes: vec!["profile".to_string()],
                    require_pkce: false,
                    access_token_lifetime_seconds: access,
                    refresh_token_lifetime_seconds: refresh,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidRequest(_)), "{} {}", access, refresh);
    }
}

#[tokio::test]
async fn test_stored_client_with_huge_lifetime_fails_issuance_cleanly() {
    let ctx = TestContext::new();
    let (registered, _) = ctx.confidential_client().await;
    let mut client = registered.clone();
    client.id = Uuid::new_v4();
    client.client_id = "legacy-client".to_string();
    client.refresh_token_lifetime_seconds = i64::MAX;
    ctx.store.insert_oauth_client(&client).await.unwrap();

    let company = ctx.company(|_| {}).await;
    let user = ctx.user(&company, "legacy@example.com").await;
    let code = ctx.issue_code(&client, &user, "", None).await;

    let err = ctx
        .oauth()
        .exchange_authorization_code(ctx.uow(), &client, &code, Some(REDIRECT_URI), None)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::Internal(_)));
    assert_eq!(err.oauth_error_code(), "server_error");
}
