//!
//! Circuit breaker pattern implementation
//! Stops calling a failing dependency for a cooldown, then lets a single probe through
//!

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use quill_core::Clock;
use quill_monitoring::ResilienceMetrics;

use crate::error::{ServerError, ServerResult};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitStatus {
    /// Circuit is closed (normal operation)
    #[default]
    Closed,
    /// Circuit is open (fast-rejecting)
    Open,
    /// Circuit is half-open (one probe decides what happens next)
    HalfOpen,
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitStatus::Closed => write!(f, "CLOSED"),
            CircuitStatus::Open => write!(f, "OPEN"),
            CircuitStatus::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of failures before opening the circuit
    pub failure_threshold: u32,

    /// Time to wait before allowing a probe request (in milliseconds)
    pub reset_timeout_ms: u64,

    /// Longest a single call can run; a half-open lease never ends before this
    pub call_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            reset_timeout_ms: 60_000,
            call_timeout_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    /// How long an outstanding half-open call keeps other callers out
    fn half_open_lease_ms(&self) -> u64 {
        self.reset_timeout_ms.max(self.call_timeout_ms)
    }
}

/// Read-only snapshot of a circuit breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerState {
    /// Whether calls are currently being fast-rejected
    pub is_open: bool,
    /// Failures counted since the last success or reset
    pub failure_count: u32,
    /// When the most recent failure was recorded (epoch ms)
    #[serde(rename = "lastFailureTime")]
    pub last_failure_time_ms: Option<u64>,
    /// When an open circuit will admit a probe (epoch ms)
    #[serde(rename = "nextAttemptTime")]
    pub next_attempt_time_ms: Option<u64>,
    /// Current state
    pub status: CircuitStatus,
}

/// Admission ticket returned by [`CircuitBreaker::try_acquire`]
///
/// Hand it back through `record_success` or `record_failure` once the call finishes.
#[derive(Debug)]
#[must_use = "report the call result with record_success or record_failure"]
pub struct Permit {
    probe: bool,
}

impl Permit {
    /// Whether this permit is the half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

struct Circuit {
    status: CircuitStatus,
    failure_count: u32,
    last_failure_time_ms: Option<u64>,
    next_attempt_time_ms: Option<u64>,
    /// Set while the half-open probe is out; holds when it was issued
    probe_started_ms: Option<u64>,
}

impl Circuit {
    fn closed() -> Self {
        Self {
            status: CircuitStatus::Closed,
            failure_count: 0,
            last_failure_time_ms: None,
            next_attempt_time_ms: None,
            probe_started_ms: None,
        }
    }
}

/// A state change to report once the lock is released
struct Transition {
    from: CircuitStatus,
    to: CircuitStatus,
    failure_count: u32,
}

/// Circuit breaker guarding one external dependency
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    circuit: Mutex<Circuit>,
}

impl CircuitBreaker {
    /// Create a new, closed circuit breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            circuit: Mutex::new(Circuit::closed()),
        }
    }

    /// Name of the protected dependency
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask to make one call
    ///
    /// Fails fast with [`ServerError::CircuitBreakerOpen`] while the cooldown
    /// runs and while a half-open probe is in flight. The first caller after
    /// the cooldown becomes the probe.
    pub fn try_acquire(&self) -> ServerResult<Permit> {
        let now = self.clock.now_ms();
        let mut transition = None;

        let result = {
            let mut circuit = self.circuit.lock();
            match circuit.status {
                CircuitStatus::Closed => Ok(Permit { probe: false }),
                CircuitStatus::Open => {
                    let next_attempt = circuit.next_attempt_time_ms.unwrap_or(now);
                    if now >= next_attempt {
                        circuit.status = CircuitStatus::HalfOpen;
                        circuit.probe_started_ms = Some(now);
                        transition = Some(Transition {
                            from: CircuitStatus::Open,
                            to: CircuitStatus::HalfOpen,
                            failure_count: circuit.failure_count,
                        });
                        Ok(Permit { probe: true })
                    } else {
                        Err(self.open_error(circuit.failure_count, next_attempt - now))
                    }
                }
                CircuitStatus::HalfOpen => {
                    // A probe that never reported back (its task was dropped)
                    // loses its lease once it cannot still be running.
                    let lease_end = circuit
                        .probe_started_ms
                        .map(|started| started.saturating_add(self.config.half_open_lease_ms()));
                    match lease_end {
                        Some(end) if now < end => Err(self.open_error(circuit.failure_count, end - now)),
                        _ => {
                            circuit.probe_started_ms = Some(now);
                            Ok(Permit { probe: true })
                        }
                    }
                }
            }
        };

        if let Some(t) = transition {
            self.report(t);
        }
        result
    }

    /// Report a successful call
    pub fn record_success(&self, permit: Permit) {
        let transition = {
            let mut circuit = self.circuit.lock();
            circuit.failure_count = 0;

            if permit.probe && circuit.status == CircuitStatus::HalfOpen {
                *circuit = Circuit::closed();
                Some(Transition {
                    from: CircuitStatus::HalfOpen,
                    to: CircuitStatus::Closed,
                    failure_count: 0,
                })
            } else {
                None
            }
        };

        if let Some(t) = transition {
            self.report(t);
        }
    }

    /// Report a failed call
    pub fn record_failure(&self, permit: Permit) {
        let now = self.clock.now_ms();
        let threshold = self.config.failure_threshold.max(1);

        let transition = {
            let mut circuit = self.circuit.lock();
            circuit.failure_count = circuit.failure_count.saturating_add(1);
            circuit.last_failure_time_ms = Some(now);

            let from = circuit.status;
            let trip = match from {
                CircuitStatus::HalfOpen => permit.probe,
                CircuitStatus::Closed => circuit.failure_count >= threshold,
                // Stragglers from before the trip do not extend the cooldown
                CircuitStatus::Open => false,
            };

            if trip {
                circuit.status = CircuitStatus::Open;
                circuit.next_attempt_time_ms = Some(now.saturating_add(self.config.reset_timeout_ms));
                circuit.probe_started_ms = None;
                Some(Transition {
                    from,
                    to: CircuitStatus::Open,
                    failure_count: circuit.failure_count,
                })
            } else {
                None
            }
        };

        if let Some(t) = transition {
            self.report(t);
        }
    }

    /// Snapshot of the current state
    pub fn get_state(&self) -> CircuitBreakerState {
        let circuit = self.circuit.lock();
        CircuitBreakerState {
            is_open: circuit.status == CircuitStatus::Open,
            failure_count: circuit.failure_count,
            last_failure_time_ms: circuit.last_failure_time_ms,
            next_attempt_time_ms: circuit.next_attempt_time_ms,
            status: circuit.status,
        }
    }

    /// Force the circuit closed with zeroed counters
    pub fn reset(&self) {
        let previous = {
            let mut circuit = self.circuit.lock();
            let previous = circuit.status;
            *circuit = Circuit::closed();
            previous
        };

        info!(circuit = %self.name, previous = %previous, "Circuit breaker reset");
        if previous != CircuitStatus::Closed {
            ResilienceMetrics::record_circuit_transition(
                &self.name,
                &previous.to_string(),
                &CircuitStatus::Closed.to_string(),
                0,
            );
        }
    }

    fn open_error(&self, failures: u32, retry_after_ms: u64) -> ServerError {
        ServerError::CircuitBreakerOpen {
            circuit: self.name.clone(),
            failures,
            retry_after_ms,
        }
    }

    fn report(&self, t: Transition) {
        match t.to {
            CircuitStatus::Open => warn!(
                circuit = %self.name,
                from = %t.from,
                failures = t.failure_count,
                cooldown_ms = self.config.reset_timeout_ms,
                "Circuit breaker opened"
            ),
            _ => info!(circuit = %self.name, from = %t.from, to = %t.to, "Circuit breaker state changed"),
        }
        ResilienceMetrics::record_circuit_transition(
            &self.name,
            &t.from.to_string(),
            &t.to.to_string(),
            t.failure_count,
        );
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.get_state())
            .finish()
    }
}
