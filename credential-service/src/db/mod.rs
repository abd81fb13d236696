//! Persistence seam.
//!
//! Every core operation receives a [`UnitOfWork`] explicitly. A
//! [`StoreProvider`] forks a fresh one per request; nothing is read from
//! ambient state. The two check-then-act invariants (session admission and
//! refresh rotation) are store primitives so each backend can make them
//! atomic in its own way.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::models::{
    AdmissionOutcome, AuditEvent, AuthorizationCode, Company, LoginAttempt, MfaCode, OAuthClient,
    OAuthToken, PasswordHistoryEntry, RecoveryCode, RememberMeToken, RevocationReason, Session,
    SessionLimit, TrustedDevice, User,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store lock poisoned")]
    Poisoned,

    #[error("Failed to decode {entity}: {reason}")]
    Decode { entity: &'static str, reason: String },
}

impl StoreError {
    pub(crate) fn decode(entity: &'static str, reason: impl Into<String>) -> Self {
        StoreError::Decode {
            entity,
            reason: reason.into(),
        }
    }
}

/// Repository operations for one request.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    // ==================== Companies ====================

    async fn get_company(&self, company_id: Uuid) -> Result<Option<Company>, StoreError>;
    async fn insert_company(&self, company: &Company) -> Result<(), StoreError>;

    // ==================== Users ====================

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, StoreError>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn insert_user(&self, user: &User) -> Result<(), StoreError>;

    /// Atomically bump the failure counter and return the new value.
    async fn increment_failed_logins(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<i32, StoreError>;
    async fn lock_user(&self, user_id: Uuid, until: DateTime<Utc>) -> Result<(), StoreError>;
    /// Zero the counter and clear any lock.
    async fn reset_failed_logins(&self, user_id: Uuid) -> Result<(), StoreError>;
    async fn update_password(
        &self,
        user_id: Uuid,
        password_hash: &str,
        changed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn set_mfa_enabled(
        &self,
        user_id: Uuid,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn set_force_logout(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    // ==================== Password history ====================

    async fn insert_password_history(&self, entry: &PasswordHistoryEntry) -> Result<(), StoreError>;
    /// Newest first.
    async fn recent_password_history(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<PasswordHistoryEntry>, StoreError>;
    /// Keep only the newest `keep` entries.
    async fn trim_password_history(&self, user_id: Uuid, keep: i64) -> Result<(), StoreError>;

    // ==================== Login attempts ====================

    async fn insert_login_attempt(&self, attempt: &LoginAttempt) -> Result<(), StoreError>;
    /// Newest first.
    async fn recent_login_attempts(
        &self,
        email: &str,
        limit: i64,
    ) -> Result<Vec<LoginAttempt>, StoreError>;

    // ==================== Sessions ====================

    /// Count the sessions the candidate competes with, apply the limit and
    /// insert, serialised per user. Sessions created at or before
    /// `valid_after` do not count.
    async fn admit_session(
        &self,
        session: &Session,
        limit: Option<SessionLimit>,
        valid_after: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<AdmissionOutcome, StoreError>;
    async fn get_session(&self, sid: &str) -> Result<Option<Session>, StoreError>;
    /// Returns false if the session no longer exists.
    async fn update_session_activity(
        &self,
        sid: &str,
        last_activity_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    async fn mark_session_mfa_verified(&self, sid: &str) -> Result<bool, StoreError>;
    async fn delete_session(&self, sid: &str) -> Result<bool, StoreError>;
    async fn delete_user_sessions(
        &self,
        user_id: Uuid,
        except_sid: Option<&str>,
    ) -> Result<u64, StoreError>;
    async fn list_user_sessions(&self, user_id: Uuid) -> Result<Vec<Session>, StoreError>;

    // ==================== MFA ====================

    /// Store `code` as the user's only pending code.
    async fn replace_mfa_code(&self, code: &MfaCode) -> Result<(), StoreError>;
    async fn get_mfa_code(&self, user_id: Uuid) -> Result<Option<MfaCode>, StoreError>;
    async fn increment_mfa_code_attempts(&self, code_id: Uuid) -> Result<i32, StoreError>;
    /// Delete one specific code. Returns false if it was already gone.
    async fn consume_mfa_code(&self, code_id: Uuid) -> Result<bool, StoreError>;
    async fn delete_mfa_codes(&self, user_id: Uuid) -> Result<(), StoreError>;

    async fn replace_recovery_codes(
        &self,
        user_id: Uuid,
        codes: &[RecoveryCode],
    ) -> Result<(), StoreError>;
    async fn unused_recovery_codes(&self, user_id: Uuid) -> Result<Vec<RecoveryCode>, StoreError>;
    /// Set `used_at` if still unused. Returns whether this call consumed it.
    async fn consume_recovery_code(
        &self,
        code_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    async fn delete_recovery_codes(&self, user_id: Uuid) -> Result<(), StoreError>;

    // ==================== Trusted devices ====================

    async fn find_trusted_device(
        &self,
        user_id: Uuid,
        fingerprint_hash: &str,
    ) -> Result<Option<TrustedDevice>, StoreError>;
    /// Insert or refresh by `(user_id, fingerprint_hash)`.
    async fn upsert_trusted_device(&self, device: &TrustedDevice) -> Result<(), StoreError>;
    async fn touch_trusted_device(
        &self,
        device_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn delete_trusted_devices(&self, user_id: Uuid) -> Result<u64, StoreError>;

    // ==================== Remember-me ====================

    async fn insert_remember_me_token(&self, token: &RememberMeToken) -> Result<(), StoreError>;
    async fn find_remember_me_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<RememberMeToken>, StoreError>;
    /// Returns whether this call removed it.
    async fn delete_remember_me_token(&self, token_id: Uuid) -> Result<bool, StoreError>;
    async fn delete_user_remember_me_tokens(&self, user_id: Uuid) -> Result<u64, StoreError>;

    // ==================== OAuth ====================

    async fn find_oauth_client(&self, client_id: &str) -> Result<Option<OAuthClient>, StoreError>;
    async fn get_oauth_client(&self, id: Uuid) -> Result<Option<OAuthClient>, StoreError>;
    async fn insert_oauth_client(&self, client: &OAuthClient) -> Result<(), StoreError>;

    async fn insert_authorization_code(&self, code: &AuthorizationCode) -> Result<(), StoreError>;
    async fn find_authorization_code(
        &self,
        code_hash: &str,
    ) -> Result<Option<AuthorizationCode>, StoreError>;
    /// Set `used_at` if still unused. Returns whether this call consumed it.
    async fn consume_authorization_code(
        &self,
        code_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn insert_oauth_token(&self, token: &OAuthToken) -> Result<(), StoreError>;
    async fn find_token_by_access_hash(&self, hash: &str) -> Result<Option<OAuthToken>, StoreError>;
    async fn find_token_by_refresh_hash(&self, hash: &str)
        -> Result<Option<OAuthToken>, StoreError>;
    /// Compare-and-swap: link `old_id` to `replacement` only if `old_id` is
    /// still the live head of its lineage, and insert `replacement`, as one
    /// step. Returns false if another redemption got there first.
    async fn rotate_refresh_token(
        &self,
        old_id: Uuid,
        replacement: &OAuthToken,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    /// Revoke the lineage. Access tokens in it are left alone.
    async fn revoke_token_family(
        &self,
        family: Uuid,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
    /// Revoke one record, refresh and access alike.
    async fn revoke_token(
        &self,
        token_id: Uuid,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    /// Revoke every record minted from an authorization code, access included.
    async fn revoke_tokens_for_code(
        &self,
        code_id: Uuid,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
    async fn list_family_tokens(&self, family: Uuid) -> Result<Vec<OAuthToken>, StoreError>;

    // ==================== Audit ====================

    async fn insert_audit_event(&self, event: &AuditEvent) -> Result<(), StoreError>;
    /// Newest first.
    async fn recent_audit_events(
        &self,
        user_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<AuditEvent>, StoreError>;
}

/// Hands out a unit of work per request.
#[async_trait]
pub trait StoreProvider: Send + Sync {
    fn unit_of_work(&self) -> Box<dyn UnitOfWork>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

/// Create a PostgreSQL connection pool.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    tracing::info!("Connecting to PostgreSQL...");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&config.url)
        .await?;

    tracing::info!("Successfully connected to PostgreSQL");

    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}

/// Check database health.
pub async fn health_check(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
