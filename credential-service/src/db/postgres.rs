//! PostgreSQL store.
//!
//! Plain entities map straight from rows. Entities with enum columns go
//! through a private row struct and are decoded here so a bad value in the
//! database surfaces as [`StoreError::Decode`] instead of a panic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgExecutor, PgPool};
use sqlx::FromRow;
use uuid::Uuid;

use super::{StoreError, StoreProvider, UnitOfWork};
use crate::models::{
    AdmissionOutcome, AdmissionPlan, AuditEvent, AuditEventType, AuditSeverity,
    AuthorizationCode, ClientType, Company, GrantType, LoginAttempt, LoginFailureReason, MfaCode,
    OAuthClient, OAuthToken, PasswordHistoryEntry, PasswordPolicy, RecoveryCode, RememberMeToken,
    RevocationReason, Session, SessionLimit, SessionLimitStrategy, SessionSource, TrustedDevice,
    User,
};

/// PostgreSQL-backed store. Each unit of work shares the pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl StoreProvider for PgStore {
    fn unit_of_work(&self) -> Box<dyn UnitOfWork> {
        Box::new(self.clone())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        super::health_check(&self.pool).await?;
        Ok(())
    }
}

// ==================== Row mapping ====================

#[derive(FromRow)]
struct CompanyRow {
    id: Uuid,
    name: String,
    max_seats: Option<i32>,
    max_sessions_per_user: Option<i32>,
    session_limit_strategy: String,
    pw_min_length: i32,
    pw_require_uppercase: bool,
    pw_require_lowercase: bool,
    pw_require_numbers: bool,
    pw_require_special_chars: bool,
    pw_history_count: i32,
    pw_max_age_days: Option<i32>,
    mfa_required: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CompanyRow> for Company {
    type Error = StoreError;

    fn try_from(row: CompanyRow) -> Result<Self, Self::Error> {
        Ok(Company {
            id: row.id,
            name: row.name,
            max_seats: row.max_seats,
            max_sessions_per_user: row.max_sessions_per_user,
            session_limit_strategy: row
                .session_limit_strategy
                .parse::<SessionLimitStrategy>()
                .map_err(|e| StoreError::decode("company", e))?,
            password_policy: PasswordPolicy {
                min_length: row.pw_min_length,
                require_uppercase: row.pw_require_uppercase,
                require_lowercase: row.pw_require_lowercase,
                require_numbers: row.pw_require_numbers,
                require_special_chars: row.pw_require_special_chars,
                history_count: row.pw_history_count,
                max_age_days: row.pw_max_age_days,
            },
            mfa_required: row.mfa_required,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct LoginAttemptRow {
    id: Uuid,
    user_id: Option<Uuid>,
    email: String,
    success: bool,
    failure_reason: Option<String>,
    source: String,
    ip_address: Option<String>,
    user_agent: Option<String>,
    attempted_at: DateTime<Utc>,
}

impl TryFrom<LoginAttemptRow> for LoginAttempt {
    type Error = StoreError;

    fn try_from(row: LoginAttemptRow) -> Result<Self, Self::Error> {
        let failure_reason = match row.failure_reason {
            Some(raw) => Some(LoginFailureReason::parse(&raw).ok_or_else(|| {
                StoreError::decode("login_attempt", format!("unknown failure reason {}", raw))
            })?),
            None => None,
        };
        Ok(LoginAttempt {
            id: row.id,
            user_id: row.user_id,
            email: row.email,
            success: row.success,
            failure_reason,
            source: row
                .source
                .parse::<SessionSource>()
                .map_err(|e| StoreError::decode("login_attempt", e))?,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            attempted_at: row.attempted_at,
        })
    }
}

#[derive(FromRow)]
struct SessionRow {
    sid: String,
    user_id: Option<Uuid>,
    company_id: Option<Uuid>,
    source: String,
    ip_address: Option<String>,
    user_agent: Option<String>,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    absolute_expires_at: DateTime<Utc>,
    mfa_verified: bool,
}

impl TryFrom<SessionRow> for Session {
    type Error = StoreError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Session {
            sid: row.sid,
            user_id: row.user_id,
            company_id: row.company_id,
            source: row
                .source
                .parse::<SessionSource>()
                .map_err(|e| StoreError::decode("session", e))?,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            created_at: row.created_at,
            last_activity_at: row.last_activity_at,
            expires_at: row.expires_at,
            absolute_expires_at: row.absolute_expires_at,
            mfa_verified: row.mfa_verified,
        })
    }
}

#[derive(FromRow)]
struct OAuthClientRow {
    id: Uuid,
    client_id: String,
    name: String,
    client_secret_hash: Option<String>,
    client_type: String,
    redirect_uris: Vec<String>,
    grants: Vec<String>,
    allowed_scopes: Vec<String>,
    require_pkce: bool,
    access_token_lifetime_seconds: i64,
    refresh_token_lifetime_seconds: i64,
    active: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<OAuthClientRow> for OAuthClient {
    type Error = StoreError;

    fn try_from(row: OAuthClientRow) -> Result<Self, Self::Error> {
        let grants = row
            .grants
            .iter()
            .map(|g| g.parse::<GrantType>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::decode("oauth_client", e))?;
        Ok(OAuthClient {
            id: row.id,
            client_id: row.client_id,
            name: row.name,
            client_secret_hash: row.client_secret_hash,
            client_type: row
                .client_type
                .parse::<ClientType>()
                .map_err(|e| StoreError::decode("oauth_client", e))?,
            redirect_uris: row.redirect_uris,
            grants,
            allowed_scopes: row.allowed_scopes,
            require_pkce: row.require_pkce,
            access_token_lifetime_seconds: row.access_token_lifetime_seconds,
            refresh_token_lifetime_seconds: row.refresh_token_lifetime_seconds,
            active: row.active,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct AuditEventRow {
    id: Uuid,
    event_type: String,
    severity: String,
    company_id: Option<Uuid>,
    user_id: Option<Uuid>,
    session_id: Option<String>,
    client_id: Option<String>,
    ip_address: Option<String>,
    user_agent: Option<String>,
    detail: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AuditEventRow> for AuditEvent {
    type Error = StoreError;

    fn try_from(row: AuditEventRow) -> Result<Self, Self::Error> {
        let event_type: AuditEventType =
            serde_json::from_value(serde_json::Value::String(row.event_type))
                .map_err(|e| StoreError::decode("audit_event", e.to_string()))?;
        let severity: AuditSeverity = serde_json::from_value(serde_json::Value::String(row.severity))
            .map_err(|e| StoreError::decode("audit_event", e.to_string()))?;
        Ok(AuditEvent {
            id: row.id,
            event_type,
            severity,
            company_id: row.company_id,
            user_id: row.user_id,
            session_id: row.session_id,
            client_id: row.client_id,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            detail: row.detail,
            created_at: row.created_at,
        })
    }
}

fn decode_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, StoreError>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

// ==================== Shared statements ====================

async fn insert_session<'e, E: PgExecutor<'e>>(
    executor: E,
    session: &Session,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO sessions (sid, user_id, company_id, source, ip_address, user_agent,
                              created_at, last_activity_at, expires_at, absolute_expires_at, mfa_verified)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(&session.sid)
    .bind(session.user_id)
    .bind(session.company_id)
    .bind(session.source.as_str())
    .bind(&session.ip_address)
    .bind(&session.user_agent)
    .bind(session.created_at)
    .bind(session.last_activity_at)
    .bind(session.expires_at)
    .bind(session.absolute_expires_at)
    .bind(session.mfa_verified)
    .execute(executor)
    .await?;
    Ok(())
}

async fn insert_token<'e, E: PgExecutor<'e>>(
    executor: E,
    token: &OAuthToken,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO oauth_tokens (id, client_id, user_id, authorization_code_id, scope,
                                  access_token_hash, access_token_prefix, access_token_expires_at,
                                  access_revoked_at, refresh_token_hash, refresh_token_prefix,
                                  refresh_token_expires_at, refresh_token_family,
                                  replaced_by_token_id, revoked_at, revoked_reason, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        "#,
    )
    .bind(token.id)
    .bind(token.client_id)
    .bind(token.user_id)
    .bind(token.authorization_code_id)
    .bind(&token.scope)
    .bind(&token.access_token_hash)
    .bind(&token.access_token_prefix)
    .bind(token.access_token_expires_at)
    .bind(token.access_revoked_at)
    .bind(&token.refresh_token_hash)
    .bind(&token.refresh_token_prefix)
    .bind(token.refresh_token_expires_at)
    .bind(token.refresh_token_family)
    .bind(token.replaced_by_token_id)
    .bind(token.revoked_at)
    .bind(&token.revoked_reason)
    .bind(token.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl UnitOfWork for PgStore {
    // ==================== Companies ====================

    async fn get_company(&self, company_id: Uuid) -> Result<Option<Company>, StoreError> {
        sqlx::query_as::<_, CompanyRow>("SELECT * FROM companies WHERE id = $1")
            .bind(company_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Company::try_from)
            .transpose()
    }

    async fn insert_company(&self, company: &Company) -> Result<(), StoreError> {
        let policy = &company.password_policy;
        sqlx::query(
            r#"
            INSERT INTO companies (id, name, max_seats, max_sessions_per_user, session_limit_strategy,
                                   pw_min_length, pw_require_uppercase, pw_require_lowercase,
                                   pw_require_numbers, pw_require_special_chars, pw_history_count,
                                   pw_max_age_days, mfa_required, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(company.id)
        .bind(&company.name)
        .bind(company.max_seats)
        .bind(company.max_sessions_per_user)
        .bind(company.session_limit_strategy.as_str())
        .bind(policy.min_length)
        .bind(policy.require_uppercase)
        .bind(policy.require_lowercase)
        .bind(policy.require_numbers)
        .bind(policy.require_special_chars)
        .bind(policy.history_count)
        .bind(policy.max_age_days)
        .bind(company.mfa_required)
        .bind(company.created_at)
        .bind(company.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== Users ====================

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE LOWER(email) = LOWER($1)")
                .bind(email)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, company_id, email, password_hash, password_changed_at,
                               failed_login_attempts, locked_until, last_failed_login_at,
                               mfa_enabled, force_logout_at, active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(user.id)
        .bind(user.company_id)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.password_changed_at)
        .bind(user.failed_login_attempts)
        .bind(user.locked_until)
        .bind(user.last_failed_login_at)
        .bind(user.mfa_enabled)
        .bind(user.force_logout_at)
        .bind(user.active)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn increment_failed_logins(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<i32, StoreError> {
        let count: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE users
            SET failed_login_attempts = failed_login_attempts + 1,
                last_failed_login_at = $2,
                updated_at = $2
            WHERE id = $1
            RETURNING failed_login_attempts
            "#,
        )
        .bind(user_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(count.unwrap_or(0))
    }

    async fn lock_user(&self, user_id: Uuid, until: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET locked_until = $2 WHERE id = $1")
            .bind(user_id)
            .bind(until)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reset_failed_logins(&self, user_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE users SET failed_login_attempts = 0, locked_until = NULL WHERE id = $1",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_password(
        &self,
        user_id: Uuid,
        password_hash: &str,
        changed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE users
            SET password_hash = $2, password_changed_at = $3, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(password_hash)
        .bind(changed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_mfa_enabled(
        &self,
        user_id: Uuid,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET mfa_enabled = $2, updated_at = $3 WHERE id = $1")
            .bind(user_id)
            .bind(enabled)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_force_logout(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET force_logout_at = $2, updated_at = $2 WHERE id = $1")
            .bind(user_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== Password history ====================

    async fn insert_password_history(&self, entry: &PasswordHistoryEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO password_history (id, user_id, password_hash, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(entry.id)
        .bind(entry.user_id)
        .bind(&entry.password_hash)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_password_history(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<PasswordHistoryEntry>, StoreError> {
        Ok(sqlx::query_as::<_, PasswordHistoryEntry>(
            "SELECT * FROM password_history WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?)
    }

    async fn trim_password_history(&self, user_id: Uuid, keep: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            DELETE FROM password_history
            WHERE user_id = $1
              AND id NOT IN (
                  SELECT id FROM password_history
                  WHERE user_id = $1
                  ORDER BY created_at DESC
                  LIMIT $2
              )
            "#,
        )
        .bind(user_id)
        .bind(keep.max(0))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== Login attempts ====================

    async fn insert_login_attempt(&self, attempt: &LoginAttempt) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO login_attempts (id, user_id, email, success, failure_reason, source,
                                        ip_address, user_agent, attempted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.user_id)
        .bind(&attempt.email)
        .bind(attempt.success)
        .bind(attempt.failure_reason.map(|r| r.as_str()))
        .bind(attempt.source.as_str())
        .bind(&attempt.ip_address)
        .bind(&attempt.user_agent)
        .bind(attempt.attempted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_login_attempts(
        &self,
        email: &str,
        limit: i64,
    ) -> Result<Vec<LoginAttempt>, StoreError> {
        let rows = sqlx::query_as::<_, LoginAttemptRow>(
            r#"
            SELECT * FROM login_attempts
            WHERE LOWER(email) = LOWER($1)
            ORDER BY attempted_at DESC
            LIMIT $2
            "#,
        )
        .bind(email)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        decode_all(rows)
    }

    // ==================== Sessions ====================

    async fn admit_session(
        &self,
        session: &Session,
        limit: Option<SessionLimit>,
        valid_after: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<AdmissionOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut evicted = Vec::new();

        if let (Some(limit), Some(user_id)) = (limit, session.user_id) {
            // Held until commit/rollback; serialises admissions per user.
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(user_id.to_string())
                .execute(&mut *tx)
                .await?;

            let rows = sqlx::query_as::<_, SessionRow>(
                r#"
                SELECT * FROM sessions
                WHERE user_id = $1
                  AND expires_at > $2
                  AND absolute_expires_at > $2
                  AND ($3::timestamptz IS NULL OR created_at > $3)
                "#,
            )
            .bind(user_id)
            .bind(now)
            .bind(valid_after)
            .fetch_all(&mut *tx)
            .await?;
            let valid: Vec<Session> = decode_all(rows)?;

            match limit.plan(&limit.competing(session, &valid)) {
                AdmissionPlan::Admit => {}
                AdmissionPlan::EvictThenAdmit(sids) => {
                    sqlx::query("DELETE FROM sessions WHERE sid = ANY($1)")
                        .bind(&sids)
                        .execute(&mut *tx)
                        .await?;
                    evicted = sids;
                }
                AdmissionPlan::Block => {
                    tx.rollback().await?;
                    return Ok(AdmissionOutcome::Blocked);
                }
                AdmissionPlan::Prompt(live) => {
                    tx.rollback().await?;
                    return Ok(AdmissionOutcome::PromptRequired(live));
                }
            }
        }

        insert_session(&mut *tx, session).await?;
        tx.commit().await?;

        Ok(AdmissionOutcome::Admitted { evicted })
    }

    async fn get_session(&self, sid: &str) -> Result<Option<Session>, StoreError> {
        sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE sid = $1")
            .bind(sid)
            .fetch_optional(&self.pool)
            .await?
            .map(Session::try_from)
            .transpose()
    }

    async fn update_session_activity(
        &self,
        sid: &str,
        last_activity_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET last_activity_at = $2, expires_at = LEAST($3, absolute_expires_at)
            WHERE sid = $1
            "#,
        )
        .bind(sid)
        .bind(last_activity_at)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_session_mfa_verified(&self, sid: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE sessions SET mfa_verified = TRUE WHERE sid = $1")
            .bind(sid)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_session(&self, sid: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM sessions WHERE sid = $1")
            .bind(sid)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_user_sessions(
        &self,
        user_id: Uuid,
        except_sid: Option<&str>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM sessions WHERE user_id = $1 AND ($2::text IS NULL OR sid <> $2)",
        )
        .bind(user_id)
        .bind(except_sid)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_user_sessions(&self, user_id: Uuid) -> Result<Vec<Session>, StoreError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM sessions WHERE user_id = $1 ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        decode_all(rows)
    }

    // ==================== MFA ====================

    async fn replace_mfa_code(&self, code: &MfaCode) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO mfa_codes (id, user_id, code_hash, attempts, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id) DO UPDATE
            SET id = EXCLUDED.id,
                code_hash = EXCLUDED.code_hash,
                attempts = EXCLUDED.attempts,
                expires_at = EXCLUDED.expires_at,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(code.id)
        .bind(code.user_id)
        .bind(&code.code_hash)
        .bind(code.attempts)
        .bind(code.expires_at)
        .bind(code.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_mfa_code(&self, user_id: Uuid) -> Result<Option<MfaCode>, StoreError> {
        Ok(
            sqlx::query_as::<_, MfaCode>("SELECT * FROM mfa_codes WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn increment_mfa_code_attempts(&self, code_id: Uuid) -> Result<i32, StoreError> {
        let attempts: Option<i32> = sqlx::query_scalar(
            "UPDATE mfa_codes SET attempts = attempts + 1 WHERE id = $1 RETURNING attempts",
        )
        .bind(code_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(attempts.unwrap_or(0))
    }

    async fn consume_mfa_code(&self, code_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM mfa_codes WHERE id = $1")
            .bind(code_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_mfa_codes(&self, user_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM mfa_codes WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn replace_recovery_codes(
        &self,
        user_id: Uuid,
        codes: &[RecoveryCode],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM recovery_codes WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        for code in codes {
            sqlx::query(
                "INSERT INTO recovery_codes (id, user_id, code_hash, used_at, created_at) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(code.id)
            .bind(code.user_id)
            .bind(&code.code_hash)
            .bind(code.used_at)
            .bind(code.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn unused_recovery_codes(&self, user_id: Uuid) -> Result<Vec<RecoveryCode>, StoreError> {
        Ok(sqlx::query_as::<_, RecoveryCode>(
            "SELECT * FROM recovery_codes WHERE user_id = $1 AND used_at IS NULL",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn consume_recovery_code(
        &self,
        code_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE recovery_codes SET used_at = $2 WHERE id = $1 AND used_at IS NULL",
        )
        .bind(code_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_recovery_codes(&self, user_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM recovery_codes WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== Trusted devices ====================

    async fn find_trusted_device(
        &self,
        user_id: Uuid,
        fingerprint_hash: &str,
    ) -> Result<Option<TrustedDevice>, StoreError> {
        Ok(sqlx::query_as::<_, TrustedDevice>(
            "SELECT * FROM trusted_devices WHERE user_id = $1 AND fingerprint_hash = $2",
        )
        .bind(user_id)
        .bind(fingerprint_hash)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn upsert_trusted_device(&self, device: &TrustedDevice) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO trusted_devices (id, user_id, fingerprint_hash, label, trusted_at,
                                         trust_expires_at, last_seen_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user_id, fingerprint_hash) DO UPDATE
            SET label = EXCLUDED.label,
                trusted_at = EXCLUDED.trusted_at,
                trust_expires_at = EXCLUDED.trust_expires_at,
                last_seen_at = EXCLUDED.last_seen_at
            "#,
        )
        .bind(device.id)
        .bind(device.user_id)
        .bind(&device.fingerprint_hash)
        .bind(&device.label)
        .bind(device.trusted_at)
        .bind(device.trust_expires_at)
        .bind(device.last_seen_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_trusted_device(
        &self,
        device_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE trusted_devices SET last_seen_at = $2 WHERE id = $1")
            .bind(device_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_trusted_devices(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM trusted_devices WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ==================== Remember-me ====================

    async fn insert_remember_me_token(&self, token: &RememberMeToken) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO remember_me_tokens (id, user_id, token_prefix, token_hash, expires_at,
                                            last_used_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(token.id)
        .bind(token.user_id)
        .bind(&token.token_prefix)
        .bind(&token.token_hash)
        .bind(token.expires_at)
        .bind(token.last_used_at)
        .bind(token.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_remember_me_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<RememberMeToken>, StoreError> {
        Ok(sqlx::query_as::<_, RememberMeToken>(
            "SELECT * FROM remember_me_tokens WHERE token_prefix = $1",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn delete_remember_me_token(&self, token_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM remember_me_tokens WHERE id = $1")
            .bind(token_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_user_remember_me_tokens(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM remember_me_tokens WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ==================== OAuth ====================

    async fn find_oauth_client(&self, client_id: &str) -> Result<Option<OAuthClient>, StoreError> {
        sqlx::query_as::<_, OAuthClientRow>("SELECT * FROM oauth_clients WHERE client_id = $1")
            .bind(client_id)
            .fetch_optional(&self.pool)
            .await?
            .map(OAuthClient::try_from)
            .transpose()
    }

    async fn get_oauth_client(&self, id: Uuid) -> Result<Option<OAuthClient>, StoreError> {
        sqlx::query_as::<_, OAuthClientRow>("SELECT * FROM oauth_clients WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(OAuthClient::try_from)
            .transpose()
    }

    async fn insert_oauth_client(&self, client: &OAuthClient) -> Result<(), StoreError> {
        let grants: Vec<String> = client.grants.iter().map(|g| g.as_str().to_string()).collect();
        sqlx::query(
            r#"
            INSERT INTO oauth_clients (id, client_id, name, client_secret_hash, client_type,
                                       redirect_uris, grants, allowed_scopes, require_pkce,
                                       access_token_lifetime_seconds, refresh_token_lifetime_seconds,
                                       active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(client.id)
        .bind(&client.client_id)
        .bind(&client.name)
        .bind(&client.client_secret_hash)
        .bind(client.client_type.to_string())
        .bind(&client.redirect_uris)
        .bind(&grants)
        .bind(&client.allowed_scopes)
        .bind(client.require_pkce)
        .bind(client.access_token_lifetime_seconds)
        .bind(client.refresh_token_lifetime_seconds)
        .bind(client.active)
        .bind(client.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_authorization_code(&self, code: &AuthorizationCode) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO oauth_authorization_codes (id, code_hash, client_id, user_id, redirect_uri,
                                                   scope, code_challenge, code_challenge_method,
                                                   expires_at, used_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(code.id)
        .bind(&code.code_hash)
        .bind(code.client_id)
        .bind(code.user_id)
        .bind(&code.redirect_uri)
        .bind(&code.scope)
        .bind(&code.code_challenge)
        .bind(&code.code_challenge_method)
        .bind(code.expires_at)
        .bind(code.used_at)
        .bind(code.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_authorization_code(
        &self,
        code_hash: &str,
    ) -> Result<Option<AuthorizationCode>, StoreError> {
        Ok(sqlx::query_as::<_, AuthorizationCode>(
            "SELECT * FROM oauth_authorization_codes WHERE code_hash = $1",
        )
        .bind(code_hash)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn consume_authorization_code(
        &self,
        code_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE oauth_authorization_codes SET used_at = $2 WHERE id = $1 AND used_at IS NULL",
        )
        .bind(code_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_oauth_token(&self, token: &OAuthToken) -> Result<(), StoreError> {
        insert_token(&self.pool, token).await
    }

    async fn find_token_by_access_hash(&self, hash: &str) -> Result<Option<OAuthToken>, StoreError> {
        Ok(
            sqlx::query_as::<_, OAuthToken>("SELECT * FROM oauth_tokens WHERE access_token_hash = $1")
                .bind(hash)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn find_token_by_refresh_hash(
        &self,
        hash: &str,
    ) -> Result<Option<OAuthToken>, StoreError> {
        Ok(
            sqlx::query_as::<_, OAuthToken>("SELECT * FROM oauth_tokens WHERE refresh_token_hash = $1")
                .bind(hash)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn rotate_refresh_token(
        &self,
        old_id: Uuid,
        replacement: &OAuthToken,
        _now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let swapped = sqlx::query(
            r#"
            UPDATE oauth_tokens
            SET replaced_by_token_id = $2
            WHERE id = $1 AND replaced_by_token_id IS NULL AND revoked_at IS NULL
            "#,
        )
        .bind(old_id)
        .bind(replacement.id)
        .execute(&mut *tx)
        .await?;

        if swapped.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        insert_token(&mut *tx, replacement).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn revoke_token_family(
        &self,
        family: Uuid,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE oauth_tokens
            SET revoked_at = $2, revoked_reason = $3
            WHERE refresh_token_family = $1 AND revoked_at IS NULL
            "#,
        )
        .bind(family)
        .bind(now)
        .bind(reason.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn revoke_token(
        &self,
        token_id: Uuid,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE oauth_tokens
            SET revoked_reason = CASE WHEN revoked_at IS NULL THEN $3 ELSE revoked_reason END,
                revoked_at = COALESCE(revoked_at, $2),
                access_revoked_at = COALESCE(access_revoked_at, $2)
            WHERE id = $1
            "#,
        )
        .bind(token_id)
        .bind(now)
        .bind(reason.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn revoke_tokens_for_code(
        &self,
        code_id: Uuid,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE oauth_tokens
            SET revoked_reason = CASE WHEN revoked_at IS NULL THEN $3 ELSE revoked_reason END,
                revoked_at = COALESCE(revoked_at, $2),
                access_revoked_at = COALESCE(access_revoked_at, $2)
            WHERE authorization_code_id = $1
            "#,
        )
        .bind(code_id)
        .bind(now)
        .bind(reason.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_family_tokens(&self, family: Uuid) -> Result<Vec<OAuthToken>, StoreError> {
        Ok(sqlx::query_as::<_, OAuthToken>(
            "SELECT * FROM oauth_tokens WHERE refresh_token_family = $1 ORDER BY created_at",
        )
        .bind(family)
        .fetch_all(&self.pool)
        .await?)
    }

    // ==================== Audit ====================

    async fn insert_audit_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO audit_events (id, event_type, severity, company_id, user_id, session_id,
                                      client_id, ip_address, user_agent, detail, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(event.id)
        .bind(event.event_type.as_str())
        .bind(event.severity.as_str())
        .bind(event.company_id)
        .bind(event.user_id)
        .bind(&event.session_id)
        .bind(&event.client_id)
        .bind(&event.ip_address)
        .bind(&event.user_agent)
        .bind(&event.detail)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_audit_events(
        &self,
        user_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<AuditEvent>, StoreError> {
        let rows = sqlx::query_as::<_, AuditEventRow>(
            r#"
            SELECT * FROM audit_events
            WHERE ($1::uuid IS NULL OR user_id = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        decode_all(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use chrono::Duration;

    async fn store() -> PgStore {
        let config = DatabaseConfig {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/credential_test".to_string()),
            max_connections: 5,
            min_connections: 1,
        };
        let pool = crate::db::create_pool(&config).await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        PgStore::new(pool)
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_concurrent_admissions_respect_limit() {
        let store = store().await;
        let now = Utc::now();
        let company = Company::new("Concurrency Co", now);
        store.insert_company(&company).await.unwrap();
        let user = User::new(company.id, format!("{}@example.com", Uuid::new_v4()), "x", now);
        store.insert_user(&user).await.unwrap();

        let limit = SessionLimit {
            max_sessions: 1,
            strategy: SessionLimitStrategy::BlockNew,
        };

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let user_id = user.id;
            handles.push(tokio::spawn(async move {
                let session = Session {
                    sid: format!("{}-{}", user_id, i),
                    user_id: Some(user_id),
                    company_id: None,
                    source: SessionSource::Web,
                    ip_address: None,
                    user_agent: None,
                    created_at: now,
                    last_activity_at: now,
                    expires_at: now + Duration::minutes(30),
                    absolute_expires_at: now + Duration::hours(12),
                    mfa_verified: true,
                };
                store.admit_session(&session, Some(limit), None, now).await
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if let AdmissionOutcome::Admitted { .. } = handle.await.unwrap().unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(store.list_user_sessions(user.id).await.unwrap().len(), 1);
    }

    async fn user_and_client(store: &PgStore, now: DateTime<Utc>) -> (User, OAuthClient) {
        let company = Company::new("Token Co", now);
        store.insert_company(&company).await.unwrap();
        let user = User::new(company.id, format!("{}@example.com", Uuid::new_v4()), "x", now);
        store.insert_user(&user).await.unwrap();

        let client = OAuthClient {
            id: Uuid::new_v4(),
            client_id: Uuid::new_v4().simple().to_string(),
            name: "Rotation Test".to_string(),
            client_secret_hash: None,
            client_type: ClientType::Public,
            redirect_uris: vec!["https://app.example.com/callback".to_string()],
            grants: vec![GrantType::AuthorizationCode, GrantType::RefreshToken],
            allowed_scopes: vec!["profile".to_string()],
            require_pkce: true,
            access_token_lifetime_seconds: 3600,
            refresh_token_lifetime_seconds: 86400,
            active: true,
            created_at: now,
        };
        store.insert_oauth_client(&client).await.unwrap();
        (user, client)
    }

    fn family_token(
        client: &OAuthClient,
        user: &User,
        family: Uuid,
        now: DateTime<Utc>,
    ) -> OAuthToken {
        let id = Uuid::new_v4();
        OAuthToken {
            id,
            client_id: Some(client.id),
            user_id: Some(user.id),
            authorization_code_id: None,
            scope: "profile".to_string(),
            access_token_hash: format!("at-{}", id),
            access_token_prefix: id.simple().to_string()[..8].to_string(),
            access_token_expires_at: now + Duration::hours(1),
            access_revoked_at: None,
            refresh_token_hash: Some(format!("rt-{}", id)),
            refresh_token_prefix: Some(id.simple().to_string()[..8].to_string()),
            refresh_token_expires_at: Some(now + Duration::days(1)),
            refresh_token_family: Some(family),
            replaced_by_token_id: None,
            revoked_at: None,
            revoked_reason: None,
            created_at: now,
        }
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_concurrent_rotations_have_one_winner() {
        let store = store().await;
        let now = Utc::now();
        let (user, client) = user_and_client(&store, now).await;
        let family = Uuid::new_v4();
        let mut head = family_token(&client, &user, family, now);
        head.id = family;
        store.insert_oauth_token(&head).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let replacement = family_token(&client, &user, family, now);
            handles.push(tokio::spawn(async move {
                store.rotate_refresh_token(family, &replacement, now).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            // A losing rotation must report false, never a unique-index error.
            if handle.await.unwrap().unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        let lineage = store.list_family_tokens(family).await.unwrap();
        assert_eq!(lineage.len(), 2);
        let heads: Vec<_> = lineage
            .iter()
            .filter(|t| t.replaced_by_token_id.is_none())
            .collect();
        assert_eq!(heads.len(), 1);
        let old = lineage.iter().find(|t| t.id == family).unwrap();
        assert_eq!(old.replaced_by_token_id, Some(heads[0].id));
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_family_revocation_marks_every_member() {
        let store = store().await;
        let now = Utc::now();
        let (user, client) = user_and_client(&store, now).await;
        let family = Uuid::new_v4();
        let mut head = family_token(&client, &user, family, now);
        head.id = family;
        store.insert_oauth_token(&head).await.unwrap();
        let next = family_token(&client, &user, family, now);
        assert!(store.rotate_refresh_token(family, &next, now).await.unwrap());

        let revoked = store
            .revoke_token_family(family, RevocationReason::ReuseDetected, now)
            .await
            .unwrap();
        assert_eq!(revoked, 2);

        let lineage = store.list_family_tokens(family).await.unwrap();
        assert!(lineage.iter().all(|t| t.revoked_at.is_some()
            && t.revoked_reason.as_deref() == Some(RevocationReason::ReuseDetected.as_str())));

        let again = store
            .revoke_token_family(family, RevocationReason::ReuseDetected, now)
            .await
            .unwrap();
        assert_eq!(again, 0);
        let late = family_token(&client, &user, family, now);
        assert!(!store.rotate_refresh_token(next.id, &late, now).await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_authorization_code_is_consumed_once_under_contention() {
        let store = store().await;
        let now = Utc::now();
        let (user, client) = user_and_client(&store, now).await;
        let code = AuthorizationCode {
            id: Uuid::new_v4(),
            code_hash: format!("code-{}", Uuid::new_v4()),
            client_id: Some(client.id),
            user_id: Some(user.id),
            redirect_uri: "https://app.example.com/callback".to_string(),
            scope: "profile".to_string(),
            code_challenge: None,
            code_challenge_method: None,
            expires_at: now + Duration::minutes(10),
            used_at: None,
            created_at: now,
        };
        store.insert_authorization_code(&code).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let code_id = code.id;
            handles.push(tokio::spawn(async move {
                store.consume_authorization_code(code_id, now).await
            }));
        }

        let mut consumed = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                consumed += 1;
            }
        }
        assert_eq!(consumed, 1);
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_recovery_code_is_consumed_once_under_contention() {
        let store = store().await;
        let now = Utc::now();
        let (user, _) = user_and_client(&store, now).await;
        let code = RecoveryCode::new(user.id, format!("rc-{}", Uuid::new_v4()), now);
        store
            .replace_recovery_codes(user.id, std::slice::from_ref(&code))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let code_id = code.id;
            handles.push(tokio::spawn(async move {
                store.consume_recovery_code(code_id, now).await
            }));
        }

        let mut consumed = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                consumed += 1;
            }
        }
        assert_eq!(consumed, 1);
        assert!(store.unused_recovery_codes(user.id).await.unwrap().is_empty());
    }
}
