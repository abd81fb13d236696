//! Password policy evaluation.
//!
//! Pure functions. The company's [`PasswordPolicy`] is always passed in by
//! the caller; nothing here reads storage.

use chrono::{DateTime, Duration, Utc};

use crate::models::{PasswordHistoryEntry, PasswordPolicy};
use crate::utils::{verify_password, Password, PasswordHashString};

use super::{AuthError, PolicyViolation};

/// Password policy service.
#[derive(Debug, Clone)]
pub struct PolicyEngine;

fn is_special(c: char) -> bool {
    !c.is_alphanumeric() && !c.is_whitespace() && !c.is_control()
}

impl PolicyEngine {
    /// Validate a candidate password, reporting every unmet rule at once.
    pub fn validate_password(candidate: &Password, policy: &PasswordPolicy) -> Result<(), AuthError> {
        let violations = Self::violations(candidate.as_str(), policy);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(AuthError::WeakPassword(violations))
        }
    }

    pub fn violations(password: &str, policy: &PasswordPolicy) -> Vec<PolicyViolation> {
        let mut violations = Vec::new();

        if password.chars().count() < policy.min_length.max(0) as usize {
            violations.push(PolicyViolation::TooShort {
                min_length: policy.min_length,
            });
        }

        if policy.require_uppercase && !password.chars().any(|c| c.is_uppercase()) {
            violations.push(PolicyViolation::MissingUppercase);
        }

        if policy.require_lowercase && !password.chars().any(|c| c.is_lowercase()) {
            violations.push(PolicyViolation::MissingLowercase);
        }

        if policy.require_numbers && !password.chars().any(|c| c.is_ascii_digit()) {
            violations.push(PolicyViolation::MissingNumber);
        }

        if policy.require_special_chars && !password.chars().any(is_special) {
            violations.push(PolicyViolation::MissingSpecialChar);
        }

        violations
    }

    /// True when the candidate does not match any of the newest
    /// `history_count` hashes. Stored hashes are salted, so each one is
    /// verified against the candidate rather than compared as strings.
    pub fn check_history(
        candidate: &Password,
        history: &[PasswordHistoryEntry],
        history_count: i32,
    ) -> bool {
        if history_count <= 0 {
            return true;
        }

        let mut newest: Vec<&PasswordHistoryEntry> = history.iter().collect();
        newest.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        !newest
            .into_iter()
            .take(history_count as usize)
            .any(|entry| {
                verify_password(candidate, &PasswordHashString::new(entry.password_hash.clone()))
            })
    }

    /// `None` or a non-positive max age means passwords never expire, as
    /// does a max age that runs past the end of representable time.
    pub fn is_expired(
        last_changed_at: DateTime<Utc>,
        max_age_days: Option<i32>,
        now: DateTime<Utc>,
    ) -> bool {
        let deadline = match max_age_days {
            Some(days) if days > 0 => Duration::try_days(days as i64)
                .and_then(|age| last_changed_at.checked_add_signed(age)),
            _ => None,
        };
        deadline.is_some_and(|deadline| now >= deadline)
    }
}
