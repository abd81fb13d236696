mod common;

use common::{login_from, TestContext};
use credential_service::{
    db::UnitOfWork,
    models::{SessionLimitStrategy, SessionSource},
    services::AuthError,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_refresh_has_single_winner() {
    let ctx = TestContext::new();
    let (client, _) = ctx.confidential_client().await;
    let (_, issued) = ctx.token_pair(&client).await;
    let refresh_token = issued.refresh_token.clone().unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = ctx.store.clone();
            let oauth = ctx.oauth().clone();
            let client = client.clone();
            let token = refresh_token.clone();
            tokio::spawn(async move { oauth.refresh(&store, &client, &token, None).await })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(AuthError::ReuseDetected) | Err(AuthError::InvalidGrant) => {}
            Err(other) => panic!("unexpected error {:?}", other),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_code_exchange_has_single_winner() {
    let ctx = TestContext::new();
    let (client, _) = ctx.confidential_client().await;
    let company = ctx.company(|_| {}).await;
    let user = ctx.user(&company, "race@example.com").await;
    let code = ctx.issue_code(&client, &user, "profile", None).await;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = ctx.store.clone();
            let oauth = ctx.oauth().clone();
            let client = client.clone();
            let code = code.clone();
            tokio::spawn(async move {
                oauth
                    .exchange_authorization_code(
                        &store,
                        &client,
                        &code,
                        Some(common::REDIRECT_URI),
                        None,
                    )
                    .await
            })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_logins_never_exceed_block_limit() {
    let ctx = TestContext::new();
    let company = ctx.limited_company(3, SessionLimitStrategy::BlockNew).await;
    let user = ctx.user(&company, "crowd@example.com").await;

    let handles: Vec<_> = (0..12)
        .map(|_| {
            let store = ctx.store.clone();
            let login = ctx.login().clone();
            let request = login_from(&user.email, SessionSource::Web);
            tokio::spawn(async move { login.login(&store, &request).await })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(AuthError::SessionLimitExceeded) => {}
            Err(other) => panic!("unexpected error {:?}", other),
        }
    }
    assert_eq!(admitted, 3);
    assert_eq!(ctx.store.list_user_sessions(user.id).await.unwrap().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_remember_me_redemption_has_single_winner() {
    let ctx = TestContext::new();
    let company = ctx.company(|_| {}).await;
    let user = ctx.user(&company, "twice@example.com").await;
    let token = ctx
        .login()
        .remember_me()
        .issue(ctx.uow(), user.id)
        .await
        .unwrap();

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let store = ctx.store.clone();
            let remember_me = ctx.login().remember_me().clone();
            let token = token.clone();
            tokio::spawn(async move { remember_me.redeem(&store, &token).await })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}
