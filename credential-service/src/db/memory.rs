//! In-process store for tests and local runs.
//!
//! All state sits behind one mutex, which makes every repository call
//! (including session admission and refresh rotation) trivially atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use super::{StoreError, StoreProvider, UnitOfWork};
use crate::models::{
    AdmissionOutcome, AdmissionPlan, AuditEvent, AuthorizationCode, Company, LoginAttempt,
    MfaCode, OAuthClient, OAuthToken, PasswordHistoryEntry, RecoveryCode, RememberMeToken,
    RevocationReason, Session, SessionLimit, TrustedDevice, User,
};

#[derive(Default)]
struct MemoryState {
    companies: HashMap<Uuid, Company>,
    users: HashMap<Uuid, User>,
    password_history: Vec<PasswordHistoryEntry>,
    login_attempts: Vec<LoginAttempt>,
    sessions: HashMap<String, Session>,
    mfa_codes: HashMap<Uuid, MfaCode>,
    recovery_codes: Vec<RecoveryCode>,
    trusted_devices: Vec<TrustedDevice>,
    remember_me_tokens: HashMap<Uuid, RememberMeToken>,
    oauth_clients: HashMap<Uuid, OAuthClient>,
    authorization_codes: HashMap<Uuid, AuthorizationCode>,
    oauth_tokens: HashMap<Uuid, OAuthToken>,
    audit_events: Vec<AuditEvent>,
}

/// Shared in-memory store. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl StoreProvider for MemoryStore {
    fn unit_of_work(&self) -> Box<dyn UnitOfWork> {
        Box::new(self.clone())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }
}

fn newest_first<T, F>(items: &mut [T], key: F)
where
    F: Fn(&T) -> DateTime<Utc>,
{
    items.sort_by(|a, b| key(b).cmp(&key(a)));
}

fn take_limit<T>(mut items: Vec<T>, limit: i64) -> Vec<T> {
    items.truncate(limit.max(0) as usize);
    items
}

#[async_trait]
impl UnitOfWork for MemoryStore {
    async fn get_company(&self, company_id: Uuid) -> Result<Option<Company>, StoreError> {
        Ok(self.lock()?.companies.get(&company_id).cloned())
    }

    async fn insert_company(&self, company: &Company) -> Result<(), StoreError> {
        self.lock()?.companies.insert(company.id, company.clone());
        Ok(())
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.lock()?.users.get(&user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .lock()?
            .users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        self.lock()?.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn increment_failed_logins(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<i32, StoreError> {
        let mut state = self.lock()?;
        match state.users.get_mut(&user_id) {
            Some(user) => {
                user.failed_login_attempts += 1;
                user.last_failed_login_at = Some(now);
                user.updated_at = now;
                Ok(user.failed_login_attempts)
            }
            None => Ok(0),
        }
    }

    async fn lock_user(&self, user_id: Uuid, until: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(user) = self.lock()?.users.get_mut(&user_id) {
            user.locked_until = Some(until);
        }
        Ok(())
    }

    async fn reset_failed_logins(&self, user_id: Uuid) -> Result<(), StoreError> {
        if let Some(user) = self.lock()?.users.get_mut(&user_id) {
            user.failed_login_attempts = 0;
            user.locked_until = None;
        }
        Ok(())
    }

    async fn update_password(
        &self,
        user_id: Uuid,
        password_hash: &str,
        changed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(user) = self.lock()?.users.get_mut(&user_id) {
            user.password_hash = password_hash.to_string();
            user.password_changed_at = changed_at;
            user.updated_at = changed_at;
        }
        Ok(())
    }

    async fn set_mfa_enabled(
        &self,
        user_id: Uuid,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(user) = self.lock()?.users.get_mut(&user_id) {
            user.mfa_enabled = enabled;
            user.updated_at = now;
        }
        Ok(())
    }

    async fn set_force_logout(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(user) = self.lock()?.users.get_mut(&user_id) {
            user.force_logout_at = Some(at);
            user.updated_at = at;
        }
        Ok(())
    }

    async fn insert_password_history(&self, entry: &PasswordHistoryEntry) -> Result<(), StoreError> {
        self.lock()?.password_history.push(entry.clone());
        Ok(())
    }

    async fn recent_password_history(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<PasswordHistoryEntry>, StoreError> {
        let mut entries: Vec<_> = self
            .lock()?
            .password_history
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        newest_first(&mut entries, |e| e.created_at);
        Ok(take_limit(entries, limit))
    }

    async fn trim_password_history(&self, user_id: Uuid, keep: i64) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let mut mine: Vec<_> = state
            .password_history
            .iter()
            .filter(|e| e.user_id == user_id)
            .map(|e| (e.id, e.created_at))
            .collect();
        mine.sort_by(|a, b| b.1.cmp(&a.1));
        let kept: Vec<Uuid> = mine
            .into_iter()
            .take(keep.max(0) as usize)
            .map(|(id, _)| id)
            .collect();
        state
            .password_history
            .retain(|e| e.user_id != user_id || kept.contains(&e.id));
        Ok(())
    }

    async fn insert_login_attempt(&self, attempt: &LoginAttempt) -> Result<(), StoreError> {
        self.lock()?.login_attempts.push(attempt.clone());
        Ok(())
    }

    async fn recent_login_attempts(
        &self,
        email: &str,
        limit: i64,
    ) -> Result<Vec<LoginAttempt>, StoreError> {
        let mut attempts: Vec<_> = self
            .lock()?
            .login_attempts
            .iter()
            .filter(|a| a.email.eq_ignore_ascii_case(email))
            .cloned()
            .collect();
        newest_first(&mut attempts, |a| a.attempted_at);
        Ok(take_limit(attempts, limit))
    }

    async fn admit_session(
        &self,
        session: &Session,
        limit: Option<SessionLimit>,
        valid_after: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<AdmissionOutcome, StoreError> {
        let mut state = self.lock()?;
        let mut evicted = Vec::new();

        if let (Some(limit), Some(user_id)) = (limit, session.user_id) {
            let valid: Vec<Session> = state
                .sessions
                .values()
                .filter(|s| s.user_id == Some(user_id) && s.is_valid(valid_after, now))
                .cloned()
                .collect();

            match limit.plan(&limit.competing(session, &valid)) {
                AdmissionPlan::Admit => {}
                AdmissionPlan::EvictThenAdmit(sids) => {
                    for sid in &sids {
                        state.sessions.remove(sid);
                    }
                    evicted = sids;
                }
                AdmissionPlan::Block => return Ok(AdmissionOutcome::Blocked),
                AdmissionPlan::Prompt(live) => return Ok(AdmissionOutcome::PromptRequired(live)),
            }
        }

        state.sessions.insert(session.sid.clone(), session.clone());
        Ok(AdmissionOutcome::Admitted { evicted })
    }

    async fn get_session(&self, sid: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.lock()?.sessions.get(sid).cloned())
    }

    async fn update_session_activity(
        &self,
        sid: &str,
        last_activity_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        match self.lock()?.sessions.get_mut(sid) {
            Some(session) => {
                session.last_activity_at = last_activity_at;
                session.expires_at = expires_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_session_mfa_verified(&self, sid: &str) -> Result<bool, StoreError> {
        match self.lock()?.sessions.get_mut(sid) {
            Some(session) => {
                session.mfa_verified = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_session(&self, sid: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.sessions.remove(sid).is_some())
    }

    async fn delete_user_sessions(
        &self,
        user_id: Uuid,
        except_sid: Option<&str>,
    ) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let before = state.sessions.len();
        state
            .sessions
            .retain(|sid, s| s.user_id != Some(user_id) || Some(sid.as_str()) == except_sid);
        Ok((before - state.sessions.len()) as u64)
    }

    async fn list_user_sessions(&self, user_id: Uuid) -> Result<Vec<Session>, StoreError> {
        let mut sessions: Vec<_> = self
            .lock()?
            .sessions
            .values()
            .filter(|s| s.user_id == Some(user_id))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    async fn replace_mfa_code(&self, code: &MfaCode) -> Result<(), StoreError> {
        self.lock()?.mfa_codes.insert(code.user_id, code.clone());
        Ok(())
    }

    async fn get_mfa_code(&self, user_id: Uuid) -> Result<Option<MfaCode>, StoreError> {
        Ok(self.lock()?.mfa_codes.get(&user_id).cloned())
    }

    async fn increment_mfa_code_attempts(&self, code_id: Uuid) -> Result<i32, StoreError> {
        let mut state = self.lock()?;
        match state.mfa_codes.values_mut().find(|c| c.id == code_id) {
            Some(code) => {
                code.attempts += 1;
                Ok(code.attempts)
            }
            None => Ok(0),
        }
    }

    async fn consume_mfa_code(&self, code_id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let before = state.mfa_codes.len();
        state.mfa_codes.retain(|_, c| c.id != code_id);
        Ok(state.mfa_codes.len() < before)
    }

    async fn delete_mfa_codes(&self, user_id: Uuid) -> Result<(), StoreError> {
        self.lock()?.mfa_codes.remove(&user_id);
        Ok(())
    }

    async fn replace_recovery_codes(
        &self,
        user_id: Uuid,
        codes: &[RecoveryCode],
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.recovery_codes.retain(|c| c.user_id != user_id);
        state.recovery_codes.extend(codes.iter().cloned());
        Ok(())
    }

    async fn unused_recovery_codes(&self, user_id: Uuid) -> Result<Vec<RecoveryCode>, StoreError> {
        Ok(self
            .lock()?
            .recovery_codes
            .iter()
            .filter(|c| c.user_id == user_id && c.used_at.is_none())
            .cloned()
            .collect())
    }

    async fn consume_recovery_code(
        &self,
        code_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        match state
            .recovery_codes
            .iter_mut()
            .find(|c| c.id == code_id && c.used_at.is_none())
        {
            Some(code) => {
                code.used_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_recovery_codes(&self, user_id: Uuid) -> Result<(), StoreError> {
        self.lock()?.recovery_codes.retain(|c| c.user_id != user_id);
        Ok(())
    }

    async fn find_trusted_device(
        &self,
        user_id: Uuid,
        fingerprint_hash: &str,
    ) -> Result<Option<TrustedDevice>, StoreError> {
        Ok(self
            .lock()?
            .trusted_devices
            .iter()
            .find(|d| d.user_id == user_id && d.fingerprint_hash == fingerprint_hash)
            .cloned())
    }

    async fn upsert_trusted_device(&self, device: &TrustedDevice) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        match state
            .trusted_devices
            .iter_mut()
            .find(|d| d.user_id == device.user_id && d.fingerprint_hash == device.fingerprint_hash)
        {
            Some(existing) => {
                existing.label = device.label.clone();
                existing.trusted_at = device.trusted_at;
                existing.trust_expires_at = device.trust_expires_at;
                existing.last_seen_at = device.last_seen_at;
            }
            None => state.trusted_devices.push(device.clone()),
        }
        Ok(())
    }

    async fn touch_trusted_device(
        &self,
        device_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(device) = self
            .lock()?
            .trusted_devices
            .iter_mut()
            .find(|d| d.id == device_id)
        {
            device.last_seen_at = now;
        }
        Ok(())
    }

    async fn delete_trusted_devices(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let before = state.trusted_devices.len();
        state.trusted_devices.retain(|d| d.user_id != user_id);
        Ok((before - state.trusted_devices.len()) as u64)
    }

    async fn insert_remember_me_token(&self, token: &RememberMeToken) -> Result<(), StoreError> {
        self.lock()?.remember_me_tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn find_remember_me_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<RememberMeToken>, StoreError> {
        Ok(self
            .lock()?
            .remember_me_tokens
            .values()
            .filter(|t| t.token_prefix == prefix)
            .cloned()
            .collect())
    }

    async fn delete_remember_me_token(&self, token_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.lock()?.remember_me_tokens.remove(&token_id).is_some())
    }

    async fn delete_user_remember_me_tokens(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let before = state.remember_me_tokens.len();
        state.remember_me_tokens.retain(|_, t| t.user_id != user_id);
        Ok((before - state.remember_me_tokens.len()) as u64)
    }

    async fn find_oauth_client(&self, client_id: &str) -> Result<Option<OAuthClient>, StoreError> {
        Ok(self
            .lock()?
            .oauth_clients
            .values()
            .find(|c| c.client_id == client_id)
            .cloned())
    }

    async fn get_oauth_client(&self, id: Uuid) -> Result<Option<OAuthClient>, StoreError> {
        Ok(self.lock()?.oauth_clients.get(&id).cloned())
    }

    async fn insert_oauth_client(&self, client: &OAuthClient) -> Result<(), StoreError> {
        self.lock()?.oauth_clients.insert(client.id, client.clone());
        Ok(())
    }

    async fn insert_authorization_code(&self, code: &AuthorizationCode) -> Result<(), StoreError> {
        self.lock()?.authorization_codes.insert(code.id, code.clone());
        Ok(())
    }

    async fn find_authorization_code(
        &self,
        code_hash: &str,
    ) -> Result<Option<AuthorizationCode>, StoreError> {
        Ok(self
            .lock()?
            .authorization_codes
            .values()
            .find(|c| c.code_hash == code_hash)
            .cloned())
    }

    async fn consume_authorization_code(
        &self,
        code_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        match state.authorization_codes.get_mut(&code_id) {
            Some(code) if code.used_at.is_none() => {
                code.used_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_oauth_token(&self, token: &OAuthToken) -> Result<(), StoreError> {
        self.lock()?.oauth_tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn find_token_by_access_hash(&self, hash: &str) -> Result<Option<OAuthToken>, StoreError> {
        Ok(self
            .lock()?
            .oauth_tokens
            .values()
            .find(|t| t.access_token_hash == hash)
            .cloned())
    }

    async fn find_token_by_refresh_hash(
        &self,
        hash: &str,
    ) -> Result<Option<OAuthToken>, StoreError> {
        Ok(self
            .lock()?
            .oauth_tokens
            .values()
            .find(|t| t.refresh_token_hash.as_deref() == Some(hash))
            .cloned())
    }

    async fn rotate_refresh_token(
        &self,
        old_id: Uuid,
        replacement: &OAuthToken,
        _now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        match state.oauth_tokens.get_mut(&old_id) {
            Some(old) if old.is_lineage_head() => {
                old.replaced_by_token_id = Some(replacement.id);
            }
            _ => return Ok(false),
        }
        state.oauth_tokens.insert(replacement.id, replacement.clone());
        Ok(true)
    }

    async fn revoke_token_family(
        &self,
        family: Uuid,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let mut revoked = 0;
        for token in state
            .oauth_tokens
            .values_mut()
            .filter(|t| t.refresh_token_family == Some(family) && t.revoked_at.is_none())
        {
            token.revoked_at = Some(now);
            token.revoked_reason = Some(reason.as_str().to_string());
            revoked += 1;
        }
        Ok(revoked)
    }

    async fn revoke_token(
        &self,
        token_id: Uuid,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(token) = self.lock()?.oauth_tokens.get_mut(&token_id) {
            revoke_both(token, reason, now);
        }
        Ok(())
    }

    async fn revoke_tokens_for_code(
        &self,
        code_id: Uuid,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let mut revoked = 0;
        for token in state
            .oauth_tokens
            .values_mut()
            .filter(|t| t.authorization_code_id == Some(code_id))
        {
            revoke_both(token, reason, now);
            revoked += 1;
        }
        Ok(revoked)
    }

    async fn list_family_tokens(&self, family: Uuid) -> Result<Vec<OAuthToken>, StoreError> {
        let mut tokens: Vec<_> = self
            .lock()?
            .oauth_tokens
            .values()
            .filter(|t| t.refresh_token_family == Some(family))
            .cloned()
            .collect();
        tokens.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tokens)
    }

    async fn insert_audit_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        self.lock()?.audit_events.push(event.clone());
        Ok(())
    }

    async fn recent_audit_events(
        &self,
        user_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<AuditEvent>, StoreError> {
        let mut events: Vec<_> = self
            .lock()?
            .audit_events
            .iter()
            .filter(|e| user_id.is_none() || e.user_id == user_id)
            .cloned()
            .collect();
        newest_first(&mut events, |e| e.created_at);
        Ok(take_limit(events, limit))
    }
}

fn revoke_both(token: &mut OAuthToken, reason: RevocationReason, now: DateTime<Utc>) {
    if token.revoked_at.is_none() {
        token.revoked_at = Some(now);
        token.revoked_reason = Some(reason.as_str().to_string());
    }
    if token.access_revoked_at.is_none() {
        token.access_revoked_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SessionLimitStrategy, SessionSource};
    use chrono::Duration;

    fn session(user_id: Uuid, sid: &str, created_at: DateTime<Utc>) -> Session {
        Session {
            sid: sid.to_string(),
            user_id: Some(user_id),
            company_id: None,
            source: SessionSource::Web,
            ip_address: None,
            user_agent: None,
            created_at,
            last_activity_at: created_at,
            expires_at: created_at + Duration::minutes(30),
            absolute_expires_at: created_at + Duration::hours(12),
            mfa_verified: true,
        }
    }

    #[tokio::test]
    async fn test_expired_sessions_do_not_count_toward_limit() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        let start = Utc::now();
        let limit = SessionLimit {
            max_sessions: 1,
            strategy: SessionLimitStrategy::BlockNew,
        };

        let first = session(user_id, "first", start);
        store.admit_session(&first, Some(limit), None, start).await.unwrap();

        let later = start + Duration::hours(1);
        let second = session(user_id, "second", later);
        let outcome = store
            .admit_session(&second, Some(limit), None, later)
            .await
            .unwrap();
        assert_eq!(outcome, AdmissionOutcome::Admitted { evicted: vec![] });
    }

    #[tokio::test]
    async fn test_delete_user_sessions_keeps_exception() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        let now = Utc::now();
        for sid in ["a", "b", "c"] {
            store
                .admit_session(&session(user_id, sid, now), None, None, now)
                .await
                .unwrap();
        }

        let removed = store.delete_user_sessions(user_id, Some("b")).await.unwrap();
        assert_eq!(removed, 2);
        let left = store.list_user_sessions(user_id).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].sid, "b");
    }

    #[tokio::test]
    async fn test_trim_password_history_keeps_newest() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        let start = Utc::now();
        for i in 0..4 {
            let entry =
                PasswordHistoryEntry::new(user_id, format!("hash-{}", i), start + Duration::seconds(i));
            store.insert_password_history(&entry).await.unwrap();
        }

        store.trim_password_history(user_id, 2).await.unwrap();
        let left = store.recent_password_history(user_id, 10).await.unwrap();
        let hashes: Vec<_> = left.iter().map(|e| e.password_hash.as_str()).collect();
        assert_eq!(hashes, vec!["hash-3", "hash-2"]);
    }
}
