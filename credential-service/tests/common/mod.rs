#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use credential_service::{
    config::AuthConfig,
    db::{MemoryStore, UnitOfWork},
    models::{
        AuditEventType, ClientType, Company, GrantType, OAuthClient, SessionLimitStrategy,
        SessionSource, User,
    },
    services::{
        ClientRegistration, IssuedTokens, LoginRequest, LoginService, MockNotifier,
        OAuthTokenService,
    },
    utils::{Clock, ManualClock, Password},
    AppState,
};
use std::sync::Arc;
use uuid::Uuid;

pub const PASSWORD: &str = "Correct-Horse-42";
pub const REDIRECT_URI: &str = "https://app.example.com/callback";

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

/// Services wired over a fresh in-memory store and a manual clock.
pub struct TestContext {
    pub store: MemoryStore,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<MockNotifier>,
    pub state: AppState,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(AuthConfig::local_defaults())
    }

    pub fn with_config(config: AuthConfig) -> Self {
        Self::with_notifier(config, MockNotifier::new())
    }

    pub fn with_notifier(config: AuthConfig, notifier: MockNotifier) -> Self {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(epoch()));
        let notifier = Arc::new(notifier);
        let state = AppState::new(
            config,
            Arc::new(store.clone()),
            clock.clone(),
            notifier.clone(),
        );
        Self {
            store,
            clock,
            notifier,
            state,
        }
    }

    pub fn uow(&self) -> &dyn UnitOfWork {
        &self.store
    }

    pub fn login(&self) -> &LoginService {
        &self.state.login
    }

    pub fn oauth(&self) -> &OAuthTokenService {
        &self.state.oauth
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    pub async fn company(&self, configure: impl FnOnce(&mut Company)) -> Company {
        let mut company = Company::new("Acme", self.clock_now());
        configure(&mut company);
        self.store.insert_company(&company).await.unwrap();
        company
    }

    pub async fn limited_company(&self, max: i32, strategy: SessionLimitStrategy) -> Company {
        self.company(|c| {
            c.max_sessions_per_user = Some(max);
            c.session_limit_strategy = strategy;
        })
        .await
    }

    pub async fn user(&self, company: &Company, email: &str) -> User {
        self.login()
            .provision_user(self.uow(), company, email, &Password::new(PASSWORD))
            .await
            .unwrap()
    }

    /// A user with MFA switched on; returns the recovery codes in clear.
    pub async fn mfa_user(&self, company: &Company, email: &str) -> (User, Vec<String>) {
        let user = self.user(company, email).await;
        let codes = self.login().mfa().enable_mfa(self.uow(), &user).await.unwrap();
        (self.reload_user(user.id).await, codes)
    }

    pub async fn reload_user(&self, user_id: Uuid) -> User {
        self.store.get_user(user_id).await.unwrap().unwrap()
    }

    pub async fn register_client(
        &self,
        client_type: ClientType,
        grants: Vec<GrantType>,
        allowed_scopes: &[&str],
    ) -> (OAuthClient, Option<String>) {
        self.oauth()
            .register_client(
                self.uow(),
                ClientRegistration {
                    name: "Test App".to_string(),
                    client_type,
                    redirect_uris: vec![REDIRECT_URI.to_string()],
                    grants,
                    allowed_scopes: allowed_scopes.iter().map(|s| s.to_string()).collect(),
                    require_pkce: false,
                    access_token_lifetime_seconds: 3600,
                    refresh_token_lifetime_seconds: 86400,
                },
            )
            .await
            .unwrap()
    }

    /// Confidential client allowed both grants on `documents:*` and `profile`.
    pub async fn confidential_client(&self) -> (OAuthClient, String) {
        let (client, secret) = self
            .register_client(
                ClientType::Confidential,
                vec![GrantType::AuthorizationCode, GrantType::RefreshToken],
                &["documents:*", "profile"],
            )
            .await;
        (client, secret.unwrap())
    }

    pub async fn public_client(&self) -> OAuthClient {
        self.register_client(
            ClientType::Public,
            vec![GrantType::AuthorizationCode, GrantType::RefreshToken],
            &["documents:read", "profile"],
        )
        .await
        .0
    }

    /// Approve an authorization request and return the raw code.
    pub async fn issue_code(
        &self,
        client: &OAuthClient,
        user: &User,
        scope: &str,
        challenge: Option<(&str, &str)>,
    ) -> String {
        let request = self
            .oauth()
            .check_authorization_request(
                client,
                "code",
                REDIRECT_URI,
                scope,
                challenge.map(|(c, _)| c),
                challenge.map(|(_, m)| m),
            )
            .unwrap();
        self.oauth()
            .save_authorization_code(self.uow(), client.id, user.id, &request)
            .await
            .unwrap()
            .code
    }

    /// A provisioned user holding a fresh token pair for `client`.
    pub async fn token_pair(&self, client: &OAuthClient) -> (User, IssuedTokens) {
        let company = self.company(|_| {}).await;
        let email = format!("{}@example.com", Uuid::new_v4().simple());
        let user = self.user(&company, &email).await;
        let code = self.issue_code(client, &user, "", None).await;
        let issued = self
            .oauth()
            .exchange_authorization_code(self.uow(), client, &code, Some(REDIRECT_URI), None)
            .await
            .unwrap();
        (user, issued)
    }

    pub async fn audit_types(&self, user_id: Option<Uuid>) -> Vec<AuditEventType> {
        self.store
            .recent_audit_events(user_id, 1000)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

pub fn login_request(email: &str, password: &str) -> LoginRequest {
    LoginRequest {
        email: email.to_string(),
        password: Password::new(password),
        source: SessionSource::Web,
        ip_address: Some("203.0.113.10".to_string()),
        user_agent: Some("integration-test".to_string()),
        device_fingerprint: None,
        remember_me: false,
        replace_session: None,
    }
}

pub fn login_from(email: &str, source: SessionSource) -> LoginRequest {
    LoginRequest {
        source,
        ..login_request(email, PASSWORD)
    }
}
