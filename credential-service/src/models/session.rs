//! Session model and concurrent-session admission planning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::company::SessionLimitStrategy;

/// Client surface a session was opened from.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum SessionSource {
    #[default]
    Web,
    Ios,
    Android,
    Api,
}

impl SessionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionSource::Web => "web",
            SessionSource::Ios => "ios",
            SessionSource::Android => "android",
            SessionSource::Api => "api",
        }
    }
}

impl fmt::Display for SessionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "web" => Ok(SessionSource::Web),
            "ios" => Ok(SessionSource::Ios),
            "android" => Ok(SessionSource::Android),
            "api" => Ok(SessionSource::Api),
            _ => Err(format!("Invalid session source: {}", s)),
        }
    }
}

/// Server-side session row keyed by an opaque `sid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub sid: String,
    pub user_id: Option<Uuid>,
    pub company_id: Option<Uuid>,
    pub source: SessionSource,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Sliding idle deadline, never past `absolute_expires_at`.
    pub expires_at: DateTime<Utc>,
    pub absolute_expires_at: DateTime<Utc>,
    pub mfa_verified: bool,
}

impl Session {
    /// Both deadlines are still in the future.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at && now < self.absolute_expires_at
    }

    /// Live and created strictly after the user's last forced logout.
    pub fn is_valid(&self, force_logout_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        self.is_live(now) && force_logout_at.map_or(true, |cutoff| self.created_at > cutoff)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            sid: self.sid.clone(),
            source: self.source,
            ip_address: self.ip_address.clone(),
            user_agent: self.user_agent.clone(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
        }
    }
}

/// What a user sees when asked to pick a session to end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, utoipa::ToSchema)]
pub struct SessionSummary {
    pub sid: String,
    pub source: SessionSource,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Per-user concurrency limit derived from the company.
///
/// For `REVOKE_OLDEST` and `REVOKE_LRU`, `max_sessions` applies to each
/// [`SessionSource`] separately, so a user may hold up to four times that
/// many sessions across web, iOS, Android and API. `BLOCK_NEW` and
/// `PROMPT_USER` count every live session against one total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimit {
    pub max_sessions: usize,
    pub strategy: SessionLimitStrategy,
}

/// Decision for a new session against the sessions it competes with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionPlan {
    Admit,
    /// Delete these sids, then insert.
    EvictThenAdmit(Vec<String>),
    Block,
    Prompt(Vec<SessionSummary>),
}

/// Result of an atomic admission in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    Admitted { evicted: Vec<String> },
    Blocked,
    PromptRequired(Vec<SessionSummary>),
}

impl SessionLimit {
    /// Narrow the user's valid sessions to the ones the candidate competes with.
    pub fn competing<'a>(
        &self,
        candidate: &Session,
        valid: &'a [Session],
    ) -> Vec<&'a Session> {
        valid
            .iter()
            .filter(|s| !self.strategy.counts_per_source() || s.source == candidate.source)
            .collect()
    }

    /// Decide admission. `competing` must already be filtered to valid
    /// sessions within the strategy's counting scope.
    pub fn plan(&self, competing: &[&Session]) -> AdmissionPlan {
        if competing.len() < self.max_sessions {
            return AdmissionPlan::Admit;
        }

        // Enough evictions to leave room for exactly one more session.
        let excess = competing.len() + 1 - self.max_sessions;

        match self.strategy {
            SessionLimitStrategy::BlockNew => AdmissionPlan::Block,
            SessionLimitStrategy::PromptUser => {
                AdmissionPlan::Prompt(competing.iter().map(|s| s.summary()).collect())
            }
            SessionLimitStrategy::RevokeOldest => {
                let mut ordered: Vec<&&Session> = competing.iter().collect();
                ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.sid.cmp(&b.sid)));
                AdmissionPlan::EvictThenAdmit(
                    ordered.into_iter().take(excess).map(|s| s.sid.clone()).collect(),
                )
            }
            SessionLimitStrategy::RevokeLru => {
                let mut ordered: Vec<&&Session> = competing.iter().collect();
                ordered.sort_by(|a, b| {
                    a.last_activity_at
                        .cmp(&b.last_activity_at)
                        .then(a.sid.cmp(&b.sid))
                });
                AdmissionPlan::EvictThenAdmit(
                    ordered.into_iter().take(excess).map(|s| s.sid.clone()).collect(),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(sid: &str, source: SessionSource, created: i64, active: i64) -> Session {
        let base = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        Session {
            sid: sid.to_string(),
            user_id: None,
            company_id: None,
            source,
            ip_address: None,
            user_agent: None,
            created_at: base + Duration::minutes(created),
            last_activity_at: base + Duration::minutes(active),
            expires_at: base + Duration::hours(1),
            absolute_expires_at: base + Duration::hours(12),
            mfa_verified: true,
        }
    }

    fn limit(max: usize, strategy: SessionLimitStrategy) -> SessionLimit {
        SessionLimit {
            max_sessions: max,
            strategy,
        }
    }

    #[test]
    fn test_under_limit_admits() {
        let a = session("a", SessionSource::Web, 0, 0);
        let plan = limit(2, SessionLimitStrategy::BlockNew).plan(&[&a]);
        assert_eq!(plan, AdmissionPlan::Admit);
    }

    #[test]
    fn test_block_new_at_limit() {
        let a = session("a", SessionSource::Web, 0, 0);
        let plan = limit(1, SessionLimitStrategy::BlockNew).plan(&[&a]);
        assert_eq!(plan, AdmissionPlan::Block);
    }

    #[test]
    fn test_revoke_oldest_picks_smallest_created_at() {
        let a = session("a", SessionSource::Web, 5, 50);
        let b = session("b", SessionSource::Web, 1, 60);
        let plan = limit(2, SessionLimitStrategy::RevokeOldest).plan(&[&a, &b]);
        assert_eq!(plan, AdmissionPlan::EvictThenAdmit(vec!["b".to_string()]));
    }

    #[test]
    fn test_revoke_lru_picks_smallest_last_activity() {
        let a = session("a", SessionSource::Web, 5, 10);
        let b = session("b", SessionSource::Web, 1, 60);
        let plan = limit(2, SessionLimitStrategy::RevokeLru).plan(&[&a, &b]);
        assert_eq!(plan, AdmissionPlan::EvictThenAdmit(vec!["a".to_string()]));
    }

    #[test]
    fn test_lowered_limit_evicts_down_to_room_for_one() {
        let a = session("a", SessionSource::Web, 1, 1);
        let b = session("b", SessionSource::Web, 2, 2);
        let c = session("c", SessionSource::Web, 3, 3);
        let plan = limit(1, SessionLimitStrategy::RevokeOldest).plan(&[&a, &b, &c]);
        assert_eq!(
            plan,
            AdmissionPlan::EvictThenAdmit(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn test_prompt_lists_competing_sessions() {
        let a = session("a", SessionSource::Web, 0, 0);
        let plan = limit(1, SessionLimitStrategy::PromptUser).plan(&[&a]);
        match plan {
            AdmissionPlan::Prompt(summaries) => {
                assert_eq!(summaries.len(), 1);
                assert_eq!(summaries[0].sid, "a");
            }
            other => panic!("expected prompt, got {:?}", other),
        }
    }

    #[test]
    fn test_evicting_strategies_count_same_source_only() {
        let web = session("w", SessionSource::Web, 0, 0);
        let ios = session("i", SessionSource::Ios, 0, 0);
        let candidate = session("new", SessionSource::Ios, 9, 9);
        let all = vec![web, ios];

        let per_source = limit(1, SessionLimitStrategy::RevokeOldest);
        let competing = per_source.competing(&candidate, &all);
        assert_eq!(competing.len(), 1);
        assert_eq!(competing[0].sid, "i");

        let global = limit(1, SessionLimitStrategy::BlockNew);
        assert_eq!(global.competing(&candidate, &all).len(), 2);
    }

    #[test]
    fn test_source_defaults_to_web() {
        assert_eq!(SessionSource::default(), SessionSource::Web);
        assert_eq!("API".parse::<SessionSource>().unwrap(), SessionSource::Api);
    }

    #[test]
    fn test_force_logout_invalidates_older_sessions() {
        let s = session("a", SessionSource::Web, 10, 10);
        let now = s.created_at + Duration::minutes(1);
        assert!(s.is_valid(None, now));
        assert!(!s.is_valid(Some(s.created_at), now));
        assert!(s.is_valid(Some(s.created_at - Duration::seconds(1)), now));
    }
}
