//! OAuth2 authorization-code and refresh-token lifecycle.
//!
//! Codes and tokens are opaque random strings; only their SHA-256 digests
//! and short prefixes are persisted.
//!
//! Refresh tokens rotate on every use. All tokens descended from one grant
//! share a `refresh_token_family`; presenting a token that was already
//! rotated away revokes the whole family. Family revocation leaves access
//! tokens alone, they run out on their own short lifetime.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use crate::db::UnitOfWork;
use crate::models::{
    AuditEvent, AuditEventType, AuthorizationCode, ClientType, CodeChallengeMethod, GrantType,
    OAuthClient, OAuthToken, RevocationReason, ScopeSet,
};
use crate::utils::Clock;

use super::credential::{constant_time_eq, generate_secure_token, hash_token, token_prefix};
use super::{AuditSink, AuthError};

const CODE_BYTES: usize = 32;
const TOKEN_BYTES: usize = 32;
const CLIENT_ID_BYTES: usize = 16;
const CLIENT_SECRET_BYTES: usize = 32;
/// Upper bound on either token lifetime a client may register: one year.
pub const MAX_TOKEN_LIFETIME_SECONDS: i64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy)]
pub struct OAuthSettings {
    pub code_ttl: Duration,
    pub allow_plain_pkce: bool,
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            code_ttl: Duration::seconds(600),
            allow_plain_pkce: false,
        }
    }
}

/// Validated parameters of an authorization request.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub redirect_uri: String,
    pub scope: ScopeSet,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<CodeChallengeMethod>,
}

/// A freshly minted code, in clear. Only returned once.
#[derive(Debug, Clone)]
pub struct IssuedCode {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

/// A freshly minted token pair, in clear.
#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub access_token: String,
    pub expires_in: i64,
    pub refresh_token: Option<String>,
    pub scope: String,
    pub record: OAuthToken,
}

/// RFC 7662 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, utoipa::ToSchema)]
pub struct TokenIntrospection {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

impl TokenIntrospection {
    pub fn inactive() -> Self {
        Self {
            active: false,
            scope: None,
            client_id: None,
            sub: None,
            exp: None,
            iat: None,
            token_type: None,
        }
    }
}

/// Provisioning input for a client.
#[derive(Debug, Clone)]
pub struct ClientRegistration {
    pub name: String,
    pub client_type: ClientType,
    pub redirect_uris: Vec<String>,
    pub grants: Vec<GrantType>,
    pub allowed_scopes: Vec<String>,
    pub require_pkce: bool,
    pub access_token_lifetime_seconds: i64,
    pub refresh_token_lifetime_seconds: i64,
}

// Client rows written outside `register_client` may carry lifetimes the
// registration check would have refused.
fn lifetime_end(now: DateTime<Utc>, seconds: i64) -> Result<DateTime<Utc>, AuthError> {
    if !(1..=MAX_TOKEN_LIFETIME_SECONDS).contains(&seconds) {
        return Err(AuthError::Internal(anyhow::anyhow!(
            "client token lifetime {}s is out of range",
            seconds
        )));
    }
    Duration::try_seconds(seconds)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| AuthError::Internal(anyhow::anyhow!("token expiry overflows")))
}

/// Derive the S256 challenge for a verifier.
pub fn s256_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

#[derive(Clone)]
pub struct OAuthTokenService {
    settings: OAuthSettings,
    clock: Arc<dyn Clock>,
    audit: AuditSink,
}

impl OAuthTokenService {
    pub fn new(settings: OAuthSettings, clock: Arc<dyn Clock>, audit: AuditSink) -> Self {
        Self {
            settings,
            clock,
            audit,
        }
    }

    // ==================== Clients ====================

    /// Create a client. Confidential clients get a secret, returned in clear
    /// exactly once.
    pub async fn register_client(
        &self,
        uow: &dyn UnitOfWork,
        registration: ClientRegistration,
    ) -> Result<(OAuthClient, Option<String>), AuthError> {
        if registration.redirect_uris.is_empty() {
            return Err(AuthError::InvalidRequest(
                "at least one redirect_uri is required".to_string(),
            ));
        }
        for (name, seconds) in [
            ("access_token_lifetime_seconds", registration.access_token_lifetime_seconds),
            ("refresh_token_lifetime_seconds", registration.refresh_token_lifetime_seconds),
        ] {
            if !(1..=MAX_TOKEN_LIFETIME_SECONDS).contains(&seconds) {
                return Err(AuthError::InvalidRequest(format!(
                    "{} must be between 1 and {}",
                    name, MAX_TOKEN_LIFETIME_SECONDS
                )));
            }
        }
        let allowed = ScopeSet::parse(&registration.allowed_scopes.join(" "))
            .map_err(|_| AuthError::InvalidScope)?;

        let secret = match registration.client_type {
            ClientType::Confidential => Some(generate_secure_token(CLIENT_SECRET_BYTES)),
            ClientType::Public => None,
        };

        let client = OAuthClient {
            id: Uuid::new_v4(),
            client_id: generate_secure_token(CLIENT_ID_BYTES),
            name: registration.name,
            client_secret_hash: secret.as_deref().map(hash_token),
            client_type: registration.client_type,
            redirect_uris: registration.redirect_uris,
            grants: registration.grants,
            allowed_scopes: allowed.iter().map(|s| s.to_string()).collect(),
            require_pkce: registration.require_pkce,
            access_token_lifetime_seconds: registration.access_token_lifetime_seconds,
            refresh_token_lifetime_seconds: registration.refresh_token_lifetime_seconds,
            active: true,
            created_at: self.clock.now(),
        };
        uow.insert_oauth_client(&client).await?;

        tracing::info!(client_id = %client.client_id, client_type = %client.client_type, "OAuth client registered");
        Ok((client, secret))
    }

    /// Authenticate a client. Public clients never present a secret;
    /// confidential ones must. Inactive clients always fail.
    pub async fn get_client(
        &self,
        uow: &dyn UnitOfWork,
        client_id: &str,
        client_secret: Option<&str>,
    ) -> Result<OAuthClient, AuthError> {
        let client = uow
            .find_oauth_client(client_id)
            .await?
            .filter(|c| c.active)
            .ok_or(AuthError::InvalidClient)?;

        if client.client_type == ClientType::Public {
            return Ok(client);
        }

        match (client_secret, client.client_secret_hash.as_deref()) {
            (Some(secret), Some(stored)) if constant_time_eq(&hash_token(secret), stored) => {
                Ok(client)
            }
            _ => {
                tracing::debug!(client_id, "Client authentication failed");
                Err(AuthError::InvalidClient)
            }
        }
    }

    // ==================== Scopes ====================

    /// An empty request yields everything the client may have. Otherwise
    /// every requested scope must fall inside the client's allowance; there
    /// is no partial grant.
    pub fn validate_scope(client: &OAuthClient, requested: &str) -> Result<ScopeSet, AuthError> {
        let allowed = client.allowed_scope_set();
        let requested = ScopeSet::parse(requested).map_err(|_| AuthError::InvalidScope)?;

        if requested.is_empty() {
            return Ok(allowed);
        }
        if allowed.covers(&requested) {
            Ok(requested)
        } else {
            Err(AuthError::InvalidScope)
        }
    }

    /// Subset check of `required` against what the token was granted.
    pub fn verify_scope(token: &OAuthToken, required: &ScopeSet) -> bool {
        ScopeSet::parse_lenient(&token.scope).covers(required)
    }

    // ==================== Authorization codes ====================

    /// Resolve the client and confirm the redirect target before anything
    /// may be sent to it.
    pub async fn resolve_redirect(
        &self,
        uow: &dyn UnitOfWork,
        client_id: &str,
        redirect_uri: &str,
    ) -> Result<OAuthClient, AuthError> {
        let client = uow
            .find_oauth_client(client_id)
            .await?
            .filter(|c| c.active)
            .ok_or(AuthError::InvalidClient)?;

        if !client.has_redirect_uri(redirect_uri) {
            return Err(AuthError::InvalidRequest(
                "redirect_uri is not registered for this client".to_string(),
            ));
        }
        Ok(client)
    }

    /// Validate the remaining authorization parameters for a client whose
    /// redirect URI is already trusted.
    pub fn check_authorization_request(
        &self,
        client: &OAuthClient,
        response_type: &str,
        redirect_uri: &str,
        scope: &str,
        code_challenge: Option<&str>,
        code_challenge_method: Option<&str>,
    ) -> Result<AuthorizationRequest, AuthError> {
        if response_type != "code" {
            return Err(AuthError::InvalidRequest(
                "response_type must be code".to_string(),
            ));
        }
        if !client.allows_grant(GrantType::AuthorizationCode) {
            return Err(AuthError::UnauthorizedClient);
        }

        let scope = Self::validate_scope(client, scope)?;

        let code_challenge = code_challenge.filter(|c| !c.is_empty());
        let code_challenge_method = match (code_challenge, code_challenge_method) {
            (None, _) if client.needs_pkce() => {
                return Err(AuthError::InvalidRequest(
                    "code_challenge is required".to_string(),
                ))
            }
            (None, _) => None,
            (Some(_), raw) => {
                let method = CodeChallengeMethod::parse(raw.unwrap_or("plain")).ok_or_else(|| {
                    AuthError::InvalidRequest("unsupported code_challenge_method".to_string())
                })?;
                if method == CodeChallengeMethod::Plain && !self.settings.allow_plain_pkce {
                    return Err(AuthError::InvalidRequest(
                        "code_challenge_method plain is not allowed".to_string(),
                    ));
                }
                Some(method)
            }
        };

        Ok(AuthorizationRequest {
            redirect_uri: redirect_uri.to_string(),
            scope,
            code_challenge: code_challenge.map(str::to_string),
            code_challenge_method,
        })
    }

    /// Mint a code for `user_id`. Fails closed if either the client or the
    /// user no longer resolves.
    #[tracing::instrument(skip(self, uow, request))]
    pub async fn save_authorization_code(
        &self,
        uow: &dyn UnitOfWork,
        client: Uuid,
        user_id: Uuid,
        request: &AuthorizationRequest,
    ) -> Result<IssuedCode, AuthError> {
        let client = uow
            .get_oauth_client(client)
            .await?
            .filter(|c| c.active)
            .ok_or(AuthError::InvalidClient)?;
        let user = uow
            .get_user(user_id)
            .await?
            .filter(|u| u.active)
            .ok_or(AuthError::InvalidGrant)?;

        let now = self.clock.now();
        let code = generate_secure_token(CODE_BYTES);
        let expires_at = now + self.settings.code_ttl;

        uow.insert_authorization_code(&AuthorizationCode {
            id: Uuid::new_v4(),
            code_hash: hash_token(&code),
            client_id: Some(client.id),
            user_id: Some(user.id),
            redirect_uri: request.redirect_uri.clone(),
            scope: request.scope.to_string(),
            code_challenge: request.code_challenge.clone(),
            code_challenge_method: request
                .code_challenge_method
                .map(|m| m.as_str().to_string()),
            expires_at,
            used_at: None,
            created_at: now,
        })
        .await?;

        self.audit
            .record(
                uow,
                AuditEvent::new(AuditEventType::OAuthCodeIssued, now)
                    .user(Some(user.company_id), Some(user.id))
                    .client(client.client_id.clone())
                    .detail(serde_json::json!({ "scope": request.scope.to_string() })),
            )
            .await;

        Ok(IssuedCode { code, expires_at })
    }

    /// Look up a redeemable code: present, unused and unexpired.
    pub async fn get_authorization_code(
        &self,
        uow: &dyn UnitOfWork,
        code: &str,
    ) -> Result<AuthorizationCode, AuthError> {
        let now = self.clock.now();
        uow.find_authorization_code(&hash_token(code))
            .await?
            .filter(|c| c.used_at.is_none() && now < c.expires_at)
            .ok_or(AuthError::InvalidGrant)
    }

    /// PKCE check. A code issued without a challenge accepts any verifier.
    /// Unknown methods, and `plain` where it is not allowed, fail closed.
    pub fn validate_code_challenge(&self, code: &AuthorizationCode, verifier: Option<&str>) -> bool {
        let Some(challenge) = code.code_challenge.as_deref() else {
            return true;
        };
        let Some(verifier) = verifier else {
            return false;
        };

        let method = code
            .code_challenge_method
            .as_deref()
            .map_or(Some(CodeChallengeMethod::Plain), CodeChallengeMethod::parse);

        match method {
            Some(CodeChallengeMethod::S256) => {
                constant_time_eq(&s256_challenge(verifier), challenge)
            }
            Some(CodeChallengeMethod::Plain) if self.settings.allow_plain_pkce => {
                constant_time_eq(verifier, challenge)
            }
            _ => false,
        }
    }

    /// Redeem a code for a token pair.
    ///
    /// A second redemption fails and revokes everything minted from the
    /// code.
    #[tracing::instrument(skip(self, uow, client, code, code_verifier), fields(client_id = %client.client_id))]
    pub async fn exchange_authorization_code(
        &self,
        uow: &dyn UnitOfWork,
        client: &OAuthClient,
        code: &str,
        redirect_uri: Option<&str>,
        code_verifier: Option<&str>,
    ) -> Result<IssuedTokens, AuthError> {
        if !client.allows_grant(GrantType::AuthorizationCode) {
            return Err(AuthError::UnauthorizedClient);
        }

        let now = self.clock.now();
        let record = uow
            .find_authorization_code(&hash_token(code))
            .await?
            .ok_or(AuthError::InvalidGrant)?;

        if record.used_at.is_some() {
            self.on_code_replay(uow, client, &record).await?;
            return Err(AuthError::InvalidGrant);
        }
        if now >= record.expires_at
            || record.client_id != Some(client.id)
            || redirect_uri != Some(record.redirect_uri.as_str())
            || !self.validate_code_challenge(&record, code_verifier)
        {
            return Err(AuthError::InvalidGrant);
        }

        let user_id = record.user_id.ok_or(AuthError::InvalidGrant)?;
        uow.get_user(user_id)
            .await?
            .filter(|u| u.active)
            .ok_or(AuthError::InvalidGrant)?;

        if !uow.consume_authorization_code(record.id, now).await? {
            self.on_code_replay(uow, client, &record).await?;
            return Err(AuthError::InvalidGrant);
        }

        let scope = ScopeSet::parse_lenient(&record.scope);
        self.save_token(uow, client, Some(user_id), &scope, Some(record.id))
            .await
    }

    async fn on_code_replay(
        &self,
        uow: &dyn UnitOfWork,
        client: &OAuthClient,
        record: &AuthorizationCode,
    ) -> Result<(), AuthError> {
        let now = self.clock.now();
        let revoked = uow
            .revoke_tokens_for_code(record.id, RevocationReason::CodeReplay, now)
            .await?;

        tracing::warn!(code_id = %record.id, revoked, "Authorization code replayed");
        self.audit
            .record(
                uow,
                AuditEvent::new(AuditEventType::AuthorizationCodeReplay, now)
                    .user(None, record.user_id)
                    .client(client.client_id.clone())
                    .detail(serde_json::json!({ "code_id": record.id, "revoked_tokens": revoked })),
            )
            .await;
        Ok(())
    }

    // ==================== Tokens ====================

    fn mint(
        &self,
        client: &OAuthClient,
        user_id: Option<Uuid>,
        scope: &ScopeSet,
        authorization_code_id: Option<Uuid>,
        family: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<IssuedTokens, AuthError> {
        let access_expires_at = lifetime_end(now, client.access_token_lifetime_seconds)?;
        let refresh_expires_at = lifetime_end(now, client.refresh_token_lifetime_seconds)?;

        let id = Uuid::new_v4();
        let access_token = generate_secure_token(TOKEN_BYTES);
        let refresh_token = client
            .allows_grant(GrantType::RefreshToken)
            .then(|| generate_secure_token(TOKEN_BYTES));

        let record = OAuthToken {
            id,
            client_id: Some(client.id),
            user_id,
            authorization_code_id,
            scope: scope.to_string(),
            access_token_hash: hash_token(&access_token),
            access_token_prefix: token_prefix(&access_token),
            access_token_expires_at: access_expires_at,
            access_revoked_at: None,
            refresh_token_hash: refresh_token.as_deref().map(hash_token),
            refresh_token_prefix: refresh_token.as_deref().map(token_prefix),
            refresh_token_expires_at: refresh_token.as_ref().map(|_| refresh_expires_at),
            refresh_token_family: refresh_token.as_ref().map(|_| family.unwrap_or(id)),
            replaced_by_token_id: None,
            revoked_at: None,
            revoked_reason: None,
            created_at: now,
        };

        Ok(IssuedTokens {
            access_token,
            expires_in: client.access_token_lifetime_seconds,
            refresh_token,
            scope: record.scope.clone(),
            record,
        })
    }

    /// Mint and persist a token pair starting a new refresh lineage.
    pub async fn save_token(
        &self,
        uow: &dyn UnitOfWork,
        client: &OAuthClient,
        user_id: Option<Uuid>,
        scope: &ScopeSet,
        authorization_code_id: Option<Uuid>,
    ) -> Result<IssuedTokens, AuthError> {
        let now = self.clock.now();
        let issued = self.mint(client, user_id, scope, authorization_code_id, None, now)?;
        uow.insert_oauth_token(&issued.record).await?;

        self.audit
            .record(
                uow,
                AuditEvent::new(AuditEventType::OAuthTokenIssued, now)
                    .user(None, user_id)
                    .client(client.client_id.clone())
                    .detail(serde_json::json!({
                        "token_id": issued.record.id,
                        "scope": issued.scope,
                        "refresh": issued.refresh_token.is_some(),
                    })),
            )
            .await;

        Ok(issued)
    }

    /// Valid while unexpired and not itself revoked. Revocation of the
    /// refresh lineage does not reach it.
    pub async fn get_access_token(
        &self,
        uow: &dyn UnitOfWork,
        token: &str,
    ) -> Result<OAuthToken, AuthError> {
        let now = self.clock.now();
        uow.find_token_by_access_hash(&hash_token(token))
            .await?
            .filter(|t| t.is_access_active(now))
            .ok_or(AuthError::InvalidGrant)
    }

    /// Locate a redeemable refresh token. A token that was already rotated
    /// away is a replay: its whole family is revoked.
    pub async fn get_refresh_token(
        &self,
        uow: &dyn UnitOfWork,
        token: &str,
    ) -> Result<OAuthToken, AuthError> {
        let now = self.clock.now();
        let record = uow
            .find_token_by_refresh_hash(&hash_token(token))
            .await?
            .ok_or(AuthError::InvalidGrant)?;

        if record.replaced_by_token_id.is_some() {
            self.on_refresh_reuse(uow, &record).await?;
            return Err(AuthError::ReuseDetected);
        }
        if record.revoked_at.is_some() || record.is_refresh_expired(now) {
            return Err(AuthError::InvalidGrant);
        }
        Ok(record)
    }

    /// Rotate a refresh token. Exactly one of several concurrent
    /// redemptions wins; the others poison the family.
    #[tracing::instrument(skip(self, uow, client, refresh_token, requested_scope), fields(client_id = %client.client_id))]
    pub async fn refresh(
        &self,
        uow: &dyn UnitOfWork,
        client: &OAuthClient,
        refresh_token: &str,
        requested_scope: Option<&str>,
    ) -> Result<IssuedTokens, AuthError> {
        if !client.allows_grant(GrantType::RefreshToken) {
            return Err(AuthError::UnauthorizedClient);
        }

        let current = self.get_refresh_token(uow, refresh_token).await?;
        if current.client_id != Some(client.id) {
            return Err(AuthError::InvalidGrant);
        }
        let family = current.refresh_token_family.ok_or(AuthError::InvalidGrant)?;

        let granted = ScopeSet::parse_lenient(&current.scope);
        let scope = match requested_scope.map(ScopeSet::parse) {
            None => granted,
            Some(Err(_)) => return Err(AuthError::InvalidScope),
            Some(Ok(requested)) if requested.is_empty() => granted,
            Some(Ok(requested)) if granted.covers(&requested) => requested,
            Some(Ok(_)) => return Err(AuthError::InvalidScope),
        };

        let now = self.clock.now();
        let issued = self.mint(
            client,
            current.user_id,
            &scope,
            current.authorization_code_id,
            Some(family),
            now,
        )?;

        if !uow.rotate_refresh_token(current.id, &issued.record, now).await? {
            self.on_refresh_reuse(uow, &current).await?;
            return Err(AuthError::ReuseDetected);
        }

        self.audit
            .record(
                uow,
                AuditEvent::new(AuditEventType::OAuthTokenRotated, now)
                    .user(None, current.user_id)
                    .client(client.client_id.clone())
                    .detail(serde_json::json!({
                        "family": family,
                        "replaced": current.id,
                        "token_id": issued.record.id,
                    })),
            )
            .await;

        Ok(issued)
    }

    async fn on_refresh_reuse(&self, uow: &dyn UnitOfWork, record: &OAuthToken) -> Result<(), AuthError> {
        let now = self.clock.now();
        let family = record.refresh_token_family.unwrap_or(record.id);
        let revoked = uow
            .revoke_token_family(family, RevocationReason::ReuseDetected, now)
            .await?;

        tracing::warn!(%family, token_id = %record.id, revoked, "Refresh token reuse detected");
        self.audit
            .record(
                uow,
                AuditEvent::new(AuditEventType::RefreshReuseDetected, now)
                    .user(None, record.user_id)
                    .detail(serde_json::json!({
                        "family": family,
                        "token_id": record.id,
                        "revoked_tokens": revoked,
                    })),
            )
            .await;
        Ok(())
    }

    /// Revoke a token presented by its client. Unknown tokens, tokens of
    /// other clients and already-revoked tokens are silently accepted.
    pub async fn revoke_token(
        &self,
        uow: &dyn UnitOfWork,
        client: &OAuthClient,
        token: &str,
        reason: RevocationReason,
    ) -> Result<(), AuthError> {
        let now = self.clock.now();
        let digest = hash_token(token);

        let (record, is_refresh) = match uow.find_token_by_refresh_hash(&digest).await? {
            Some(record) => (Some(record), true),
            None => (uow.find_token_by_access_hash(&digest).await?, false),
        };

        let Some(record) = record.filter(|r| r.client_id == Some(client.id)) else {
            return Ok(());
        };

        if record.revoked_at.is_none() || record.access_revoked_at.is_none() {
            uow.revoke_token(record.id, reason, now).await?;
        }
        if is_refresh {
            if let Some(family) = record.refresh_token_family {
                uow.revoke_token_family(family, reason, now).await?;
            }
        }

        self.audit
            .record(
                uow,
                AuditEvent::new(AuditEventType::OAuthTokenRevoked, now)
                    .user(None, record.user_id)
                    .client(client.client_id.clone())
                    .detail(serde_json::json!({
                        "token_id": record.id,
                        "reason": reason.as_str(),
                        "refresh": is_refresh,
                    })),
            )
            .await;
        Ok(())
    }

    /// Describe a token to the client it was issued to. Anything else is
    /// reported inactive.
    pub async fn introspect(
        &self,
        uow: &dyn UnitOfWork,
        client: &OAuthClient,
        token: &str,
    ) -> Result<TokenIntrospection, AuthError> {
        let now = self.clock.now();
        let digest = hash_token(token);

        if let Some(record) = uow.find_token_by_access_hash(&digest).await? {
            if record.client_id == Some(client.id) && record.is_access_active(now) {
                return Ok(Self::describe(
                    &record,
                    client,
                    record.access_token_expires_at,
                    "access_token",
                ));
            }
            return Ok(TokenIntrospection::inactive());
        }

        if let Some(record) = uow.find_token_by_refresh_hash(&digest).await? {
            if record.client_id == Some(client.id)
                && record.is_lineage_head()
                && !record.is_refresh_expired(now)
            {
                if let Some(exp) = record.refresh_token_expires_at {
                    return Ok(Self::describe(&record, client, exp, "refresh_token"));
                }
            }
        }

        Ok(TokenIntrospection::inactive())
    }

    fn describe(
        record: &OAuthToken,
        client: &OAuthClient,
        expires_at: DateTime<Utc>,
        token_type: &str,
    ) -> TokenIntrospection {
        TokenIntrospection {
            active: true,
            scope: Some(record.scope.clone()),
            client_id: Some(client.client_id.clone()),
            sub: record.user_id.map(|id| id.to_string()),
            exp: Some(expires_at.timestamp()),
            iat: Some(record.created_at.timestamp()),
            token_type: Some(token_type.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::SystemClock;

    fn service(allow_plain: bool) -> OAuthTokenService {
        OAuthTokenService::new(
            OAuthSettings {
                allow_plain_pkce: allow_plain,
                ..OAuthSettings::default()
            },
            Arc::new(SystemClock),
            AuditSink::new(),
        )
    }

    fn code_with(challenge: Option<&str>, method: Option<&str>) -> AuthorizationCode {
        let now = Utc::now();
        AuthorizationCode {
            id: Uuid::new_v4(),
            code_hash: hash_token("code"),
            client_id: None,
            user_id: None,
            redirect_uri: "https://app.example.com/cb".to_string(),
            scope: String::new(),
            code_challenge: challenge.map(str::to_string),
            code_challenge_method: method.map(str::to_string),
            expires_at: now + Duration::minutes(10),
            used_at: None,
            created_at: now,
        }
    }

    fn client(scopes: &[&str]) -> OAuthClient {
        OAuthClient {
            id: Uuid::new_v4(),
            client_id: "client".to_string(),
            name: "Client".to_string(),
            client_secret_hash: None,
            client_type: ClientType::Public,
            redirect_uris: vec!["https://app.example.com/cb".to_string()],
            grants: vec![GrantType::AuthorizationCode, GrantType::RefreshToken],
            allowed_scopes: scopes.iter().map(|s| s.to_string()).collect(),
            require_pkce: true,
            access_token_lifetime_seconds: 3600,
            refresh_token_lifetime_seconds: 86400,
            active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_s256_known_vector() {
        // RFC 7636 appendix B
        assert_eq!(
            s256_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_no_challenge_accepts_any_verifier() {
        let svc = service(false);
        let code = code_with(None, None);
        assert!(svc.validate_code_challenge(&code, None));
        assert!(svc.validate_code_challenge(&code, Some("anything")));
    }

    #[test]
    fn test_s256_challenge_must_match() {
        let svc = service(false);
        let verifier = "a-verifier-of-reasonable-length-0123456789";
        let code = code_with(Some(&s256_challenge(verifier)), Some("S256"));
        assert!(svc.validate_code_challenge(&code, Some(verifier)));
        assert!(!svc.validate_code_challenge(&code, Some("wrong")));
        assert!(!svc.validate_code_challenge(&code, None));
    }

    #[test]
    fn test_unknown_method_fails_closed() {
        let svc = service(true);
        let code = code_with(Some("verifier"), Some("invalid"));
        assert!(!svc.validate_code_challenge(&code, Some("verifier")));
    }

    #[test]
    fn test_plain_only_when_allowed() {
        let code = code_with(Some("verifier"), Some("plain"));
        assert!(!service(false).validate_code_challenge(&code, Some("verifier")));
        assert!(service(true).validate_code_challenge(&code, Some("verifier")));
    }

    #[test]
    fn test_validate_scope_empty_yields_allowance() {
        let c = client(&["documents:read", "profile"]);
        let granted = OAuthTokenService::validate_scope(&c, "").unwrap();
        assert_eq!(granted.to_string(), "documents:read profile");
    }

    #[test]
    fn test_validate_scope_rejects_partial() {
        let c = client(&["documents:read"]);
        assert!(matches!(
            OAuthTokenService::validate_scope(&c, "documents:read documents:write"),
            Err(AuthError::InvalidScope)
        ));
        assert!(OAuthTokenService::validate_scope(&c, "documents:read").is_ok());
    }

    #[test]
    fn test_validate_scope_resource_wildcard() {
        let c = client(&["documents:*"]);
        assert!(OAuthTokenService::validate_scope(&c, "documents:write").is_ok());
        assert!(OAuthTokenService::validate_scope(&c, "billing:read").is_err());
    }

    #[test]
    fn test_public_client_requires_challenge() {
        let svc = service(false);
        let c = client(&["profile"]);
        let result = svc.check_authorization_request(
            &c,
            "code",
            "https://app.example.com/cb",
            "profile",
            None,
            None,
        );
        assert!(matches!(result, Err(AuthError::InvalidRequest(_))));

        let ok = svc
            .check_authorization_request(
                &c,
                "code",
                "https://app.example.com/cb",
                "profile",
                Some("challenge"),
                Some("S256"),
            )
            .unwrap();
        assert_eq!(ok.code_challenge_method, Some(CodeChallengeMethod::S256));
    }
}
