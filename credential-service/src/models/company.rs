//! Company model - tenant-level security policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::session::SessionLimit;

/// What happens when a user's concurrent-session count reaches the company limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionLimitStrategy {
    /// Refuse the new session.
    BlockNew,
    /// Revoke the session with the smallest `created_at`.
    RevokeOldest,
    /// Revoke the least recently used session.
    RevokeLru,
    /// Ask the user which session to give up.
    PromptUser,
}

impl SessionLimitStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionLimitStrategy::BlockNew => "BLOCK_NEW",
            SessionLimitStrategy::RevokeOldest => "REVOKE_OLDEST",
            SessionLimitStrategy::RevokeLru => "REVOKE_LRU",
            SessionLimitStrategy::PromptUser => "PROMPT_USER",
        }
    }

    /// Evicting strategies only compete with sessions from the same source,
    /// so a phone login never silently kills the user's browser session.
    /// Blocking and prompting strategies count every live session.
    pub fn counts_per_source(&self) -> bool {
        matches!(
            self,
            SessionLimitStrategy::RevokeOldest | SessionLimitStrategy::RevokeLru
        )
    }
}

impl fmt::Display for SessionLimitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionLimitStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BLOCK_NEW" => Ok(SessionLimitStrategy::BlockNew),
            "REVOKE_OLDEST" => Ok(SessionLimitStrategy::RevokeOldest),
            "REVOKE_LRU" => Ok(SessionLimitStrategy::RevokeLru),
            "PROMPT_USER" => Ok(SessionLimitStrategy::PromptUser),
            _ => Err(format!("Invalid session limit strategy: {}", s)),
        }
    }
}

/// Company password rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordPolicy {
    pub min_length: i32,
    pub require_uppercase: bool,
    pub require_lowercase: bool,
    pub require_numbers: bool,
    pub require_special_chars: bool,
    /// How many previous passwords may not be reused (0 disables the check).
    pub history_count: i32,
    /// Password lifetime; `None` means passwords never expire.
    pub max_age_days: Option<i32>,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: 8,
            require_uppercase: false,
            require_lowercase: false,
            require_numbers: false,
            require_special_chars: false,
            history_count: 0,
            max_age_days: None,
        }
    }
}

/// Company entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub id: Uuid,
    pub name: String,
    pub max_seats: Option<i32>,
    /// `None` or a non-positive value means unlimited.
    pub max_sessions_per_user: Option<i32>,
    pub session_limit_strategy: SessionLimitStrategy,
    pub password_policy: PasswordPolicy,
    /// Company-wide MFA override.
    pub mfa_required: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Company {
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            max_seats: None,
            max_sessions_per_user: None,
            session_limit_strategy: SessionLimitStrategy::BlockNew,
            password_policy: PasswordPolicy::default(),
            mfa_required: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// The concurrency limit to enforce, if any.
    pub fn session_limit(&self) -> Option<SessionLimit> {
        match self.max_sessions_per_user {
            Some(max) if max > 0 => Some(SessionLimit {
                max_sessions: max as usize,
                strategy: self.session_limit_strategy,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_round_trips_through_str() {
        for strategy in [
            SessionLimitStrategy::BlockNew,
            SessionLimitStrategy::RevokeOldest,
            SessionLimitStrategy::RevokeLru,
            SessionLimitStrategy::PromptUser,
        ] {
            assert_eq!(strategy.as_str().parse::<SessionLimitStrategy>(), Ok(strategy));
        }
        assert!("REVOKE_NEWEST".parse::<SessionLimitStrategy>().is_err());
    }

    #[test]
    fn test_non_positive_limit_is_unlimited() {
        let mut company = Company::new("Acme", Utc::now());
        assert!(company.session_limit().is_none());

        company.max_sessions_per_user = Some(0);
        assert!(company.session_limit().is_none());

        company.max_sessions_per_user = Some(3);
        company.session_limit_strategy = SessionLimitStrategy::RevokeLru;
        let limit = company.session_limit().unwrap();
        assert_eq!(limit.max_sessions, 3);
        assert_eq!(limit.strategy, SessionLimitStrategy::RevokeLru);
    }
}
