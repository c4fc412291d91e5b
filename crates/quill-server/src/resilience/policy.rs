//! Route policies and caller identity
//!
//! Both are pure lookups: the policy table maps a request path to a limit,
//! and identity resolution maps request headers to a counting bucket.

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

/// Bucket for callers without any usable address header
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// Headers consulted for the caller address, most trusted first
const IDENTITY_HEADERS: [&str; 3] = ["x-forwarded-for", "x-real-ip", "cf-connecting-ip"];

const MINUTE_MS: u64 = 60_000;

/// A fixed-window limit for one route class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Policy name; part of every counter key, so it must not contain `:`
    pub name: String,
    /// Requests allowed per window
    pub max_requests: u32,
    /// Window length in milliseconds
    pub window_ms: u64,
}

impl RateLimitPolicy {
    /// Create a policy
    pub fn new(name: impl Into<String>, max_requests: u32, window_ms: u64) -> Self {
        Self {
            name: name.into(),
            max_requests,
            window_ms,
        }
    }

    /// Login and registration endpoints
    pub fn auth() -> Self {
        Self::new("auth", 5, 15 * MINUTE_MS)
    }

    /// Expensive generation endpoints
    pub fn generation() -> Self {
        Self::new("generation", 5, 60 * MINUTE_MS)
    }

    /// Operator endpoints
    pub fn admin() -> Self {
        Self::new("admin", 10, 15 * MINUTE_MS)
    }

    /// Everything else
    pub fn api() -> Self {
        Self::new("api", 100, MINUTE_MS)
    }
}

/// Maps a path prefix to a policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Path prefix, matched on segment boundaries
    pub prefix: String,
    /// Policy applied to matching paths
    pub policy: RateLimitPolicy,
}

impl PolicyRule {
    /// Create a rule
    pub fn new(prefix: impl Into<String>, policy: RateLimitPolicy) -> Self {
        Self {
            prefix: prefix.into(),
            policy,
        }
    }

    fn matches(&self, path: &str) -> bool {
        let prefix = self.prefix.trim_end_matches('/');
        match path.strip_prefix(prefix) {
            Some(rest) => prefix.is_empty() || rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

/// Route class table; the longest matching prefix wins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTable {
    rules: Vec<PolicyRule>,
    default: RateLimitPolicy,
}

impl PolicyTable {
    /// Create a table from rules and a default policy
    pub fn new(rules: Vec<PolicyRule>, default: RateLimitPolicy) -> Self {
        Self { rules, default }
    }

    /// Built-in route classes
    pub fn builtin() -> Self {
        Self::new(
            vec![
                PolicyRule::new("/api/auth", RateLimitPolicy::auth()),
                PolicyRule::new("/api/letters/generate", RateLimitPolicy::generation()),
                PolicyRule::new("/api/admin", RateLimitPolicy::admin()),
            ],
            RateLimitPolicy::api(),
        )
    }

    /// Policy for a request path
    pub fn resolve(&self, path: &str) -> &RateLimitPolicy {
        self.rules
            .iter()
            .filter(|rule| rule.matches(path))
            .max_by_key(|rule| rule.prefix.trim_end_matches('/').len())
            .map(|rule| &rule.policy)
            .unwrap_or(&self.default)
    }

    /// Every policy in the table, default last
    pub fn policies(&self) -> impl Iterator<Item = &RateLimitPolicy> {
        self.rules.iter().map(|rule| &rule.policy).chain(std::iter::once(&self.default))
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Resolve the caller identity from request headers
///
/// Never fails: unusable headers are skipped and a caller with none ends up
/// in the shared [`UNKNOWN_IDENTITY`] bucket.
pub fn resolve_identity(headers: &HeaderMap) -> String {
    IDENTITY_HEADERS
        .iter()
        .find_map(|name| {
            headers.get_all(*name).iter().find_map(|value| {
                let value = value.to_str().ok()?;
                // Only the client end of a forwarding chain identifies the caller.
                let first = value.split(',').next()?.trim();
                (!first.is_empty()).then(|| format!("ip:{}", first))
            })
        })
        .unwrap_or_else(|| UNKNOWN_IDENTITY.to_string())
}
