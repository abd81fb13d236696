//! Long-lived remember-me tokens.
//!
//! The holder keeps `prefix.secret`. The prefix is stored in clear for
//! candidate lookup; the whole token only as a digest. Tokens are single
//! use: redeeming one deletes it and issues a replacement.

use chrono::Duration;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::UnitOfWork;
use crate::models::RememberMeToken;
use crate::utils::Clock;

use super::credential::{constant_time_eq, generate_secure_token, hash_token};
use super::AuthError;

// 6 bytes encode to exactly 8 base64url characters.
const PREFIX_BYTES: usize = 6;
const SECRET_BYTES: usize = 32;

#[derive(Debug, Clone, Copy)]
pub struct RememberMeSettings {
    pub ttl: Duration,
}

impl Default for RememberMeSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::days(30),
        }
    }
}

#[derive(Clone)]
pub struct RememberMeService {
    settings: RememberMeSettings,
    clock: Arc<dyn Clock>,
}

impl RememberMeService {
    pub fn new(settings: RememberMeSettings, clock: Arc<dyn Clock>) -> Self {
        Self { settings, clock }
    }

    pub async fn issue(&self, uow: &dyn UnitOfWork, user_id: Uuid) -> Result<String, AuthError> {
        let now = self.clock.now();
        let prefix = generate_secure_token(PREFIX_BYTES);
        let token = format!("{}.{}", prefix, generate_secure_token(SECRET_BYTES));

        uow.insert_remember_me_token(&RememberMeToken {
            id: Uuid::new_v4(),
            user_id,
            token_prefix: prefix,
            token_hash: hash_token(&token),
            expires_at: now + self.settings.ttl,
            last_used_at: None,
            created_at: now,
        })
        .await?;

        Ok(token)
    }

    /// Exchange a token for its user and a replacement token.
    pub async fn redeem(
        &self,
        uow: &dyn UnitOfWork,
        token: &str,
    ) -> Result<(Uuid, String), AuthError> {
        let now = self.clock.now();
        let (prefix, _) = token
            .split_once('.')
            .ok_or(AuthError::InvalidCredentials)?;

        let presented = hash_token(token);
        let candidates = uow.find_remember_me_by_prefix(prefix).await?;
        let matched = candidates
            .into_iter()
            .find(|c| constant_time_eq(&presented, &c.token_hash))
            .ok_or(AuthError::InvalidCredentials)?;

        // Lost a race with a concurrent redemption, or already spent.
        if !uow.delete_remember_me_token(matched.id).await? {
            return Err(AuthError::InvalidCredentials);
        }
        if now >= matched.expires_at {
            return Err(AuthError::InvalidCredentials);
        }

        let replacement = self.issue(uow, matched.user_id).await?;
        tracing::debug!(user_id = %matched.user_id, "Remember-me token rotated");
        Ok((matched.user_id, replacement))
    }

    pub async fn revoke_all(&self, uow: &dyn UnitOfWork, user_id: Uuid) -> Result<u64, AuthError> {
        Ok(uow.delete_user_remember_me_tokens(user_id).await?)
    }
}
