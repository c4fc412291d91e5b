//!
//! Retrying client for the generation service
//! Classifies failures, backs off exponentially with jitter and reports every
//! attempt to the circuit breaker. Expected failures come back as a
//! [`RetryOutcome`], never as an `Err`.
//!

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time;
use tracing::{debug, info, warn};

use quill_core::{Clock, Sleeper};
use quill_monitoring::ResilienceMetrics;

use super::circuit_breaker::CircuitBreaker;
use crate::error::ServerError;
use crate::generation::{GenerationClient, GenerationError, GenerationRequest, GenerationResponse};

/// Statuses the service uses for transient trouble
const RETRYABLE_STATUSES: [u16; 4] = [429, 502, 503, 504];

/// Normalised transient error codes
const RETRYABLE_CODES: [&str; 3] = ["rate_limit_exceeded", "model_overloaded", "temporary_failure"];

/// Lower-case message fragments that mark a transient failure
const RETRYABLE_MESSAGE_FRAGMENTS: [&str; 4] = ["timeout", "timed out", "unavailable", "overloaded"];

/// Message shown to end users when generation is temporarily impossible
const UNAVAILABLE_MESSAGE: &str =
    "The letter generation service is temporarily unavailable. Please try again in a few minutes.";

/// Message shown to end users when the request itself was rejected
const REJECTED_MESSAGE: &str = "We could not generate this letter. Please review the request and try again.";

/// Whether a failure is worth another attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient; retry after a backoff
    Retryable,
    /// Terminal; retrying cannot help
    NonRetryable,
}

/// Classify a generation failure
pub fn classify(error: &GenerationError) -> ErrorClass {
    if let Some(status) = error.status {
        if RETRYABLE_STATUSES.contains(&status) {
            return ErrorClass::Retryable;
        }
    }

    if let Some(code) = &error.code {
        let normalized = code.trim().to_ascii_lowercase().replace('-', "_");
        if RETRYABLE_CODES.contains(&normalized.as_str()) {
            return ErrorClass::Retryable;
        }
    }

    let message = error.message.to_ascii_lowercase();
    if RETRYABLE_MESSAGE_FRAGMENTS.iter().any(|fragment| message.contains(fragment)) {
        return ErrorClass::Retryable;
    }

    ErrorClass::NonRetryable
}

/// Backoff and budget settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the initial attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Growth factor per retry
    pub multiplier: f64,
    /// Upper bound on any single delay
    pub max_delay_ms: u64,
    /// Jitter as a fraction of the delay; 0 disables it
    pub jitter_ratio: f64,
    /// Timeout for a single attempt
    pub attempt_timeout_ms: u64,
    /// Deadline for the whole operation
    pub overall_deadline_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter_ratio: 0.1,
            attempt_timeout_ms: 30_000,
            overall_deadline_ms: 120_000,
        }
    }
}

impl RetryPolicy {
    /// Total attempts allowed, including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Un-jittered delay after the given 1-based attempt
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31) as i32;
        let delay_ms = (self.base_delay_ms as f64) * self.multiplier.max(1.0).powi(exp);
        Duration::from_millis(delay_ms.min(self.max_delay_ms as f64) as u64)
    }

    /// Delay after the given 1-based attempt, jittered and clamped to `[0, max_delay]`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay_for_attempt(attempt).as_millis() as f64;
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);

        let jitter = if ratio > 0.0 && base_ms > 0.0 {
            let range = base_ms * ratio;
            rand::thread_rng().gen_range(-range..=range)
        } else {
            0.0
        };

        let delay_ms = (base_ms + jitter).clamp(0.0, self.max_delay_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }
}

/// One attempt within a retried operation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAttempt {
    /// 1-based attempt number
    pub attempt_number: u32,
    /// Backoff waited after this attempt; 0 when no retry followed
    pub delay_ms: u64,
    /// Failure of this attempt, if it failed
    pub error: Option<GenerationError>,
    /// How long the call took
    pub duration_ms: u64,
    /// When the attempt started (epoch ms)
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
}

/// Why a retried operation failed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetryError {
    /// The last attempt failed with a terminal error or the budget ran out
    #[error("{0}")]
    Generation(GenerationError),

    /// The circuit breaker rejected the call
    #[error("Circuit breaker open for {circuit} after {failures} failures. Retry after {retry_after_ms}ms")]
    CircuitOpen {
        /// Circuit that rejected the call
        circuit: String,
        /// Failures counted when the call was rejected
        failures: u32,
        /// Milliseconds until a probe will be admitted
        retry_after_ms: u64,
    },

    /// The operation ran out of time before the retry budget
    #[error("Retry deadline of {deadline_ms}ms exceeded")]
    DeadlineExceeded {
        /// Configured overall deadline
        deadline_ms: u64,
        /// Failure of the last attempt, if one ran
        last_error: Option<GenerationError>,
    },
}

impl RetryError {
    /// Whether the breaker rejected the call
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, RetryError::CircuitOpen { .. })
    }

    /// Message safe to show end users; never exposes breaker or provider internals
    pub fn user_message(&self) -> &'static str {
        match self {
            RetryError::Generation(err) if classify(err) == ErrorClass::NonRetryable => REJECTED_MESSAGE,
            _ => UNAVAILABLE_MESSAGE,
        }
    }
}

impl From<RetryError> for ServerError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::CircuitOpen { circuit, failures, retry_after_ms } => ServerError::CircuitBreakerOpen {
                circuit,
                failures,
                retry_after_ms,
            },
            other => ServerError::GenerationFailed(other.to_string()),
        }
    }
}

/// Result of a retried operation with its full history
#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    /// Whether a call succeeded
    pub success: bool,
    /// Value from the successful call
    pub data: Option<T>,
    /// Final failure
    pub error: Option<RetryError>,
    /// Calls made; 0 when the breaker rejected the first one
    pub attempts: u32,
    /// One entry per call made
    pub retry_history: Vec<RetryAttempt>,
    /// Wall time spent, backoff included
    pub total_duration_ms: u64,
}

/// Generation client wrapped in retries and a circuit breaker
pub struct RetryClient {
    client: Arc<dyn GenerationClient>,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryClient {
    /// Create a new retry client
    pub fn new(
        client: Arc<dyn GenerationClient>,
        breaker: Arc<CircuitBreaker>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            client,
            breaker,
            policy,
            clock,
            sleeper,
        }
    }

    /// Breaker guarding this client
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Policy in use
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run one generation call with retries
    pub async fn execute(&self, request: &GenerationRequest) -> RetryOutcome<GenerationResponse> {
        let started = self.clock.now_ms();
        let deadline = started.saturating_add(self.policy.overall_deadline_ms);
        let max_attempts = self.policy.max_attempts();
        let mut history: Vec<RetryAttempt> = Vec::new();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let now = self.clock.now_ms();
            if now >= deadline {
                let last_error = history.last().and_then(|a| a.error.clone());
                return self.deadline_exceeded(history, last_error, started);
            }

            let permit = match self.breaker.try_acquire() {
                Ok(permit) => permit,
                Err(err) => return self.circuit_open(err, history, started),
            };

            let timeout_ms = self.policy.attempt_timeout_ms.min(deadline - now);
            let result = match time::timeout(Duration::from_millis(timeout_ms), self.client.generate(request)).await {
                Ok(Ok(response)) if !response.text.trim().is_empty() => Ok(response),
                Ok(Ok(_)) => Err(GenerationError::empty_response()),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(GenerationError::timeout(timeout_ms)),
            };
            let duration_ms = self.clock.now_ms().saturating_sub(now);
            ResilienceMetrics::record_retry_attempt(self.breaker.name(), attempt, result.is_ok(), duration_ms);

            let err = match result {
                Ok(response) => {
                    self.breaker.record_success(permit);
                    history.push(RetryAttempt {
                        attempt_number: attempt,
                        delay_ms: 0,
                        error: None,
                        duration_ms,
                        timestamp_ms: now,
                    });
                    if attempt > 1 {
                        info!(dependency = %self.breaker.name(), attempts = attempt, "Generation succeeded after retries");
                    }
                    return self.finish(Some(response), None, history, started);
                }
                Err(err) => {
                    self.breaker.record_failure(permit);
                    err
                }
            };

            let class = classify(&err);
            debug!(
                dependency = %self.breaker.name(),
                attempt,
                status = ?err.status,
                code = ?err.code,
                error = %err,
                retryable = class == ErrorClass::Retryable,
                "Generation attempt failed"
            );

            if class == ErrorClass::NonRetryable || attempt >= max_attempts {
                history.push(RetryAttempt {
                    attempt_number: attempt,
                    delay_ms: 0,
                    error: Some(err.clone()),
                    duration_ms,
                    timestamp_ms: now,
                });
                warn!(
                    dependency = %self.breaker.name(),
                    attempts = attempt,
                    retryable = class == ErrorClass::Retryable,
                    error = %err,
                    "Giving up on generation call"
                );
                return self.finish(None, Some(RetryError::Generation(err)), history, started);
            }

            let delay = self.policy.delay_for_attempt(attempt);
            let delay_ms = delay.as_millis() as u64;
            if self.clock.now_ms().saturating_add(delay_ms) >= deadline {
                history.push(RetryAttempt {
                    attempt_number: attempt,
                    delay_ms: 0,
                    error: Some(err.clone()),
                    duration_ms,
                    timestamp_ms: now,
                });
                return self.deadline_exceeded(history, Some(err), started);
            }

            history.push(RetryAttempt {
                attempt_number: attempt,
                delay_ms,
                error: Some(err),
                duration_ms,
                timestamp_ms: now,
            });
            self.sleeper.sleep(delay).await;
        }
    }

    fn circuit_open(
        &self,
        err: ServerError,
        history: Vec<RetryAttempt>,
        started: u64,
    ) -> RetryOutcome<GenerationResponse> {
        let error = match err {
            ServerError::CircuitBreakerOpen { circuit, failures, retry_after_ms } => RetryError::CircuitOpen {
                circuit,
                failures,
                retry_after_ms,
            },
            other => RetryError::Generation(GenerationError::new(other.to_string())),
        };
        warn!(dependency = %self.breaker.name(), attempts = history.len(), error = %error, "Generation call rejected");
        self.finish(None, Some(error), history, started)
    }

    fn deadline_exceeded(
        &self,
        history: Vec<RetryAttempt>,
        last_error: Option<GenerationError>,
        started: u64,
    ) -> RetryOutcome<GenerationResponse> {
        warn!(
            dependency = %self.breaker.name(),
            attempts = history.len(),
            deadline_ms = self.policy.overall_deadline_ms,
            "Generation retry deadline exceeded"
        );
        let error = RetryError::DeadlineExceeded {
            deadline_ms: self.policy.overall_deadline_ms,
            last_error,
        };
        self.finish(None, Some(error), history, started)
    }

    fn finish(
        &self,
        data: Option<GenerationResponse>,
        error: Option<RetryError>,
        history: Vec<RetryAttempt>,
        started: u64,
    ) -> RetryOutcome<GenerationResponse> {
        let attempts = history.len() as u32;
        let total_duration_ms = self.clock.now_ms().saturating_sub(started);
        let success = data.is_some();
        ResilienceMetrics::record_retry_outcome(self.breaker.name(), attempts, success, total_duration_ms);

        RetryOutcome {
            success,
            data,
            error,
            attempts,
            retry_history: history,
            total_duration_ms,
        }
    }
}
