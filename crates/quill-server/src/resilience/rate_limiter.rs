//!
//! Rate limiter for inbound requests
//! Fixed-window counting in the shared store, falling back to process-local
//! counters when the store cannot be reached
//!

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time;
use tracing::{debug, warn};

use quill_core::{Clock, CoreError};
use quill_monitoring::ResilienceMetrics;

use super::fallback_store::{FallbackStore, DEFAULT_MAX_ENTRIES};
use super::policy::RateLimitPolicy;
use crate::error::{ServerError, ServerResult};
use crate::shared_state::SharedStateService;

/// Outcome of one rate limit check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests allowed per window
    pub limit: u32,
    /// Requests left in the current window
    pub remaining: u32,
    /// When the current window ends (epoch ms)
    #[serde(rename = "resetAtEpochMs")]
    pub reset_at_ms: u64,
    /// Whether the process-local fallback made this decision
    pub degraded: bool,
}

impl RateLimitDecision {
    /// Decision for the `count`-th request of a window
    pub fn from_count(policy: &RateLimitPolicy, count: u64, reset_at_ms: u64, degraded: bool) -> Self {
        let limit = u64::from(policy.max_requests);
        Self {
            allowed: count <= limit,
            limit: policy.max_requests,
            remaining: limit.saturating_sub(count) as u32,
            reset_at_ms,
            degraded,
        }
    }

    /// Whole seconds until the window ends, rounded up; at least 1 on a denial
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        let secs = self.reset_at_ms.saturating_sub(now_ms).div_ceil(1000);
        if self.allowed {
            secs
        } else {
            secs.max(1)
        }
    }

    /// Window end in epoch seconds, rounded up
    pub fn reset_at_secs(&self) -> u64 {
        self.reset_at_ms.div_ceil(1000)
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Shared state scope holding the counters
    pub scope: String,

    /// Timeout for one shared store call in milliseconds
    pub store_timeout_ms: u64,

    /// Fallback store size above which expired entries are swept
    pub fallback_max_entries: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            scope: "ratelimit".to_string(),
            store_timeout_ms: 250,
            fallback_max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

/// Distributed fixed-window rate limiter
pub struct RateLimiter {
    config: RateLimiterConfig,
    shared_state: Arc<dyn SharedStateService>,
    fallback: Arc<FallbackStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a new rate limiter over the given shared store
    pub fn new(config: RateLimiterConfig, shared_state: Arc<dyn SharedStateService>, clock: Arc<dyn Clock>) -> Self {
        let fallback = Arc::new(FallbackStore::new(config.fallback_max_entries));
        Self {
            config,
            shared_state,
            fallback,
            clock,
        }
    }

    /// Process-local store used while the shared store is down
    pub fn fallback_store(&self) -> &Arc<FallbackStore> {
        &self.fallback
    }

    /// Count one request for `identity` under `policy` and decide on it
    ///
    /// A denial is a normal decision, not an error.
    pub async fn check(&self, identity: &str, policy: &RateLimitPolicy) -> RateLimitDecision {
        let now = self.clock.now_ms();
        let window_ms = policy.window_ms.max(1);
        let window_start = now / window_ms * window_ms;
        let key = format!("{}:{}:{}", policy.name, identity, window_start);

        let decision = match self.increment(&key, window_ms).await {
            Ok(count) => RateLimitDecision::from_count(policy, count, window_start + window_ms, false),
            Err(e) => {
                warn!(
                    policy = %policy.name,
                    identity,
                    error = %e,
                    "Shared rate limit store unavailable, using local counters"
                );
                let reason = if e.is_unavailable() { "unavailable" } else { "store_error" };
                ResilienceMetrics::record_rate_limit_fallback(&policy.name, reason);
                self.fallback.check(policy, identity, now)
            }
        };

        debug!(
            policy = %policy.name,
            identity,
            allowed = decision.allowed,
            remaining = decision.remaining,
            degraded = decision.degraded,
            "Rate limit checked"
        );
        ResilienceMetrics::record_rate_limit_decision(&policy.name, decision.allowed, decision.remaining, decision.degraded);
        decision
    }

    /// Like [`check`](Self::check), but turns a denial into [`ServerError::RateLimitExceeded`]
    pub async fn allow(&self, identity: &str, policy: &RateLimitPolicy) -> ServerResult<RateLimitDecision> {
        let decision = self.check(identity, policy).await;
        if decision.allowed {
            Ok(decision)
        } else {
            Err(ServerError::RateLimitExceeded {
                policy: policy.name.clone(),
                identity: identity.to_string(),
                max_requests: policy.max_requests,
                window_ms: policy.window_ms,
                retry_after_secs: decision.retry_after_secs(self.clock.now_ms()),
            })
        }
    }

    async fn increment(&self, key: &str, ttl_ms: u64) -> Result<u64, CoreError> {
        let timeout_ms = self.config.store_timeout_ms;
        match time::timeout(
            Duration::from_millis(timeout_ms),
            self.shared_state.increment_with_expiry(&self.config.scope, key, ttl_ms),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CoreError::Timeout(timeout_ms)),
        }
    }
}
