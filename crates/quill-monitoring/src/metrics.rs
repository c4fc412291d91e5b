//! Metrics collection, emitted as structured log events.

use tracing::{debug, info, warn};

/// Resilience-layer metrics
pub struct ResilienceMetrics;

impl ResilienceMetrics {
    /// Record one attempt against an external dependency
    pub fn record_retry_attempt(dependency: &str, attempt: u32, success: bool, duration_ms: u64) {
        debug!(
            metric = "retry_attempt",
            dependency, attempt, success, duration_ms,
            "Retry attempt recorded"
        );
    }

    /// Record the final result of a retried operation
    pub fn record_retry_outcome(dependency: &str, attempts: u32, success: bool, total_duration_ms: u64) {
        info!(
            metric = "retry_outcome",
            dependency, attempts, success, total_duration_ms,
            "Retry outcome recorded"
        );
    }

    /// Record a circuit breaker state change
    pub fn record_circuit_transition(circuit: &str, from: &str, to: &str, failure_count: u32) {
        info!(
            metric = "circuit_transition",
            circuit, from, to, failure_count,
            "Circuit transition recorded"
        );
    }

    /// Record a rate limit decision
    pub fn record_rate_limit_decision(policy: &str, allowed: bool, remaining: u32, degraded: bool) {
        debug!(
            metric = "rate_limit_decision",
            policy, allowed, remaining, degraded,
            "Rate limit decision recorded"
        );
    }

    /// Record a fall back from the shared store to the local store
    pub fn record_rate_limit_fallback(policy: &str, reason: &str) {
        warn!(
            metric = "rate_limit_fallback",
            policy, reason,
            "Rate limiter fell back to local store"
        );
    }
}
