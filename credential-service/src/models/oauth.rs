//! OAuth 2.0 client, authorization code and token records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::scope::ScopeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    /// Holds a secret and authenticates at the token endpoint.
    Confidential,
    /// Cannot keep a secret; must use PKCE.
    Public,
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClientType::Confidential => write!(f, "confidential"),
            ClientType::Public => write!(f, "public"),
        }
    }
}

impl FromStr for ClientType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confidential" => Ok(ClientType::Confidential),
            "public" => Ok(ClientType::Public),
            _ => Err(format!("Invalid client type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    AuthorizationCode,
    RefreshToken,
}

impl GrantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantType::AuthorizationCode => "authorization_code",
            GrantType::RefreshToken => "refresh_token",
        }
    }
}

impl FromStr for GrantType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "authorization_code" => Ok(GrantType::AuthorizationCode),
            "refresh_token" => Ok(GrantType::RefreshToken),
            _ => Err(format!("Unsupported grant type: {}", s)),
        }
    }
}

/// PKCE transformation. Anything else stored on a code fails verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeChallengeMethod {
    Plain,
    S256,
}

impl CodeChallengeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeChallengeMethod::Plain => "plain",
            CodeChallengeMethod::S256 => "S256",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "plain" => Some(CodeChallengeMethod::Plain),
            "S256" => Some(CodeChallengeMethod::S256),
            _ => None,
        }
    }
}

/// Registered OAuth client.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    pub id: Uuid,
    pub client_id: String,
    pub name: String,
    pub client_secret_hash: Option<String>,
    pub client_type: ClientType,
    /// Exact-match list; no prefix or wildcard matching.
    pub redirect_uris: Vec<String>,
    pub grants: Vec<GrantType>,
    pub allowed_scopes: Vec<String>,
    pub require_pkce: bool,
    pub access_token_lifetime_seconds: i64,
    pub refresh_token_lifetime_seconds: i64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl OAuthClient {
    pub fn allows_grant(&self, grant: GrantType) -> bool {
        self.grants.contains(&grant)
    }

    pub fn has_redirect_uri(&self, redirect_uri: &str) -> bool {
        self.redirect_uris.iter().any(|uri| uri == redirect_uri)
    }

    /// Public clients always need PKCE regardless of the flag.
    pub fn needs_pkce(&self) -> bool {
        self.require_pkce || self.client_type == ClientType::Public
    }

    pub fn allowed_scope_set(&self) -> ScopeSet {
        ScopeSet::parse_lenient(&self.allowed_scopes.join(" "))
    }
}

/// Single-use authorization code. Only the hash of the code is stored.
#[derive(Debug, Clone, FromRow)]
pub struct AuthorizationCode {
    pub id: Uuid,
    pub code_hash: String,
    pub client_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub redirect_uri: String,
    /// Space-separated granted scopes.
    pub scope: String,
    pub code_challenge: Option<String>,
    /// Raw method as submitted.
    pub code_challenge_method: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Why a token or lineage was revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationReason {
    UserLogout,
    ClientRequest,
    ReuseDetected,
    CodeReplay,
}

impl RevocationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevocationReason::UserLogout => "user_logout",
            RevocationReason::ClientRequest => "client_request",
            RevocationReason::ReuseDetected => "reuse_detected",
            RevocationReason::CodeReplay => "code_replay",
        }
    }
}

/// Access/refresh token pair record.
///
/// `revoked_at` marks the refresh lineage dead. `access_revoked_at` is set
/// only by explicit revocation, so a family-wide revocation after reuse
/// leaves outstanding access tokens usable until they expire.
#[derive(Debug, Clone, FromRow)]
pub struct OAuthToken {
    pub id: Uuid,
    pub client_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub authorization_code_id: Option<Uuid>,
    pub scope: String,
    pub access_token_hash: String,
    pub access_token_prefix: String,
    pub access_token_expires_at: DateTime<Utc>,
    pub access_revoked_at: Option<DateTime<Utc>>,
    pub refresh_token_hash: Option<String>,
    pub refresh_token_prefix: Option<String>,
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
    pub refresh_token_family: Option<Uuid>,
    pub replaced_by_token_id: Option<Uuid>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OAuthToken {
    pub fn is_access_active(&self, now: DateTime<Utc>) -> bool {
        self.access_revoked_at.is_none() && now < self.access_token_expires_at
    }

    /// The current head of a refresh lineage.
    pub fn is_lineage_head(&self) -> bool {
        self.replaced_by_token_id.is_none() && self.revoked_at.is_none()
    }

    pub fn is_refresh_expired(&self, now: DateTime<Utc>) -> bool {
        self.refresh_token_expires_at.map_or(true, |exp| now >= exp)
    }
}
