//! Scope grammar.
//!
//! A scope token is one of:
//! - `*` - every scope
//! - `resource:*` - every action on one resource
//! - anything else - an exact scope such as `documents:read` or `openid`
//!
//! Matching is a closed predicate over those three shapes.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    All,
    Resource(String),
    Exact(String),
}

impl Scope {
    /// Parse one token. Tokens with stray wildcards or invalid characters are rejected.
    pub fn parse(token: &str) -> Option<Self> {
        if token.is_empty() || !token.chars().all(is_scope_char) {
            return None;
        }
        if token == "*" {
            return Some(Scope::All);
        }
        if let Some(resource) = token.strip_suffix(":*") {
            if resource.is_empty() || resource.contains('*') {
                return None;
            }
            return Some(Scope::Resource(resource.to_string()));
        }
        if token.contains('*') {
            return None;
        }
        Some(Scope::Exact(token.to_string()))
    }

    /// Whether holding `self` grants `requested`.
    pub fn grants(&self, requested: &Scope) -> bool {
        match (self, requested) {
            (Scope::All, _) => true,
            (Scope::Resource(r), Scope::Resource(q)) => r == q,
            (Scope::Resource(r), Scope::Exact(q)) => q
                .strip_prefix(r.as_str())
                .map_or(false, |rest| rest.starts_with(':')),
            (Scope::Exact(a), Scope::Exact(q)) => a == q,
            _ => false,
        }
    }
}

fn is_scope_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ':' | '*' | '_' | '-' | '.' | '/')
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::All => f.write_str("*"),
            Scope::Resource(r) => write!(f, "{}:*", r),
            Scope::Exact(s) => f.write_str(s),
        }
    }
}

/// Ordered, de-duplicated set of scopes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeSet(Vec<Scope>);

impl ScopeSet {
    /// Parse a space-separated list. Fails on the first malformed token.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut set = ScopeSet::default();
        for token in raw.split_whitespace() {
            let scope = Scope::parse(token).ok_or_else(|| format!("Malformed scope: {}", token))?;
            set.insert(scope);
        }
        Ok(set)
    }

    /// Parse a stored list, dropping malformed tokens.
    pub fn parse_lenient(raw: &str) -> Self {
        let mut set = ScopeSet::default();
        for scope in raw.split_whitespace().filter_map(Scope::parse) {
            set.insert(scope);
        }
        set
    }

    fn insert(&mut self, scope: Scope) {
        if !self.0.contains(&scope) {
            self.0.push(scope);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Scope> {
        self.0.iter()
    }

    pub fn grants(&self, requested: &Scope) -> bool {
        self.0.iter().any(|held| held.grants(requested))
    }

    /// Every scope in `other` is granted by this set.
    pub fn covers(&self, other: &ScopeSet) -> bool {
        other.iter().all(|requested| self.grants(requested))
    }
}

impl fmt::Display for ScopeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        f.write_str(&joined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(raw: &str) -> ScopeSet {
        ScopeSet::parse(raw).unwrap()
    }

    #[test]
    fn test_parse_shapes() {
        assert_eq!(Scope::parse("*"), Some(Scope::All));
        assert_eq!(
            Scope::parse("documents:*"),
            Some(Scope::Resource("documents".into()))
        );
        assert_eq!(
            Scope::parse("documents:read"),
            Some(Scope::Exact("documents:read".into()))
        );
        assert_eq!(Scope::parse("doc*:read"), None);
        assert_eq!(Scope::parse(":*"), None);
        assert_eq!(Scope::parse("bad scope"), None);
    }

    #[test]
    fn test_wildcard_grants_everything() {
        assert!(set("*").covers(&set("documents:read billing:*")));
    }

    #[test]
    fn test_resource_wildcard_grants_actions_on_that_resource_only() {
        let held = set("documents:*");
        assert!(held.covers(&set("documents:read documents:write")));
        assert!(held.covers(&set("documents:*")));
        assert!(!held.covers(&set("documentsx:read")));
        assert!(!held.covers(&set("billing:read")));
        assert!(!held.covers(&set("*")));
    }

    #[test]
    fn test_exact_scope_does_not_widen() {
        let held = set("documents:read");
        assert!(held.covers(&set("documents:read")));
        assert!(!held.covers(&set("documents:*")));
    }

    #[test]
    fn test_display_deduplicates() {
        assert_eq!(set("a b a").to_string(), "a b");
    }
}
