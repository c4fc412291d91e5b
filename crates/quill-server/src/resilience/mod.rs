//! Resilience module for the Quill server
//! Provides retries with backoff, circuit breaking and distributed rate limiting.

use serde::{Deserialize, Serialize};

pub mod circuit_breaker;
pub mod fallback_store;
pub mod policy;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitStatus, Permit};
pub use fallback_store::FallbackStore;
pub use policy::{resolve_identity, PolicyRule, PolicyTable, RateLimitPolicy, UNKNOWN_IDENTITY};
pub use rate_limiter::{RateLimitDecision, RateLimiter, RateLimiterConfig};
pub use retry::{
    classify, ErrorClass, RetryAttempt, RetryClient, RetryError, RetryOutcome, RetryPolicy,
};

/// Common configuration for resilience patterns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Retries after the initial attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff multiplier for retry backoff (exponential)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Maximum backoff duration in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Uniform jitter applied to each delay, as a fraction of it (0.1 = ±10%)
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    /// Timeout for a single generation attempt in milliseconds
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,

    /// Deadline for a whole retried operation in milliseconds
    #[serde(default = "default_overall_deadline_ms")]
    pub overall_deadline_ms: u64,

    /// Circuit breaker failure threshold
    #[serde(default = "default_circuit_threshold")]
    pub circuit_threshold: u32,

    /// Circuit breaker cooldown in milliseconds
    #[serde(default = "default_circuit_reset_ms")]
    pub circuit_reset_ms: u64,

    /// Timeout for one shared store call in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Fallback store size above which expired entries are swept
    #[serde(default = "default_fallback_max_entries")]
    pub fallback_max_entries: usize,

    /// Interval of the background fallback sweep in milliseconds
    #[serde(default = "default_fallback_sweep_interval_ms")]
    pub fallback_sweep_interval_ms: u64,
}

// Default values
fn default_max_retries() -> u32 { 3 }
fn default_base_delay_ms() -> u64 { 1000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_max_delay_ms() -> u64 { 30000 }
fn default_jitter_ratio() -> f64 { 0.1 }
fn default_attempt_timeout_ms() -> u64 { 30000 }
fn default_overall_deadline_ms() -> u64 { 120000 }
fn default_circuit_threshold() -> u32 { 10 }
fn default_circuit_reset_ms() -> u64 { 60000 }
fn default_store_timeout_ms() -> u64 { 250 }
fn default_fallback_max_entries() -> usize { 10_000 }
fn default_fallback_sweep_interval_ms() -> u64 { 60000 }

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            overall_deadline_ms: default_overall_deadline_ms(),
            circuit_threshold: default_circuit_threshold(),
            circuit_reset_ms: default_circuit_reset_ms(),
            store_timeout_ms: default_store_timeout_ms(),
            fallback_max_entries: default_fallback_max_entries(),
            fallback_sweep_interval_ms: default_fallback_sweep_interval_ms(),
        }
    }
}

impl ResilienceConfig {
    /// Retry policy described by this configuration
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms,
            multiplier: self.backoff_multiplier,
            max_delay_ms: self.max_delay_ms,
            jitter_ratio: self.jitter_ratio,
            attempt_timeout_ms: self.attempt_timeout_ms,
            overall_deadline_ms: self.overall_deadline_ms,
        }
    }

    /// Circuit breaker settings described by this configuration
    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_threshold,
            reset_timeout_ms: self.circuit_reset_ms,
            call_timeout_ms: self.attempt_timeout_ms,
        }
    }
}
