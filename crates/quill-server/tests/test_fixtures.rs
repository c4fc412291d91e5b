//! Test fixtures for quill-server tests.
//! Scripted generation backends, failing stores and builders for the
//! resilience components on a manual clock.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use quill_core::{Clock, CoreError, ManualClock, ManualSleeper};
use quill_server::config::ServerConfig;
use quill_server::generation::{GenerationClient, GenerationError, GenerationRequest, GenerationResponse};
use quill_server::resilience::{CircuitBreaker, CircuitBreakerConfig, RetryClient, RetryPolicy};
use quill_server::shared_state::{InMemorySharedStateService, SharedStateService};
use quill_server::QuillServer;

pub use quill_monitoring::logging::init_test_tracing;

/// Epoch time every manual clock starts at
pub const T0: u64 = 1_700_000_000_000;

/// One scripted reply of [`ScriptedGenerationClient`]
#[derive(Debug, Clone)]
pub enum Step {
    /// Return this text
    Text(&'static str),
    /// Fail with this error
    Fail(GenerationError),
    /// Never answer
    Hang,
}

/// Generation backend that replays a script, then repeats a fallback step
pub struct ScriptedGenerationClient {
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: AtomicUsize,
}

impl ScriptedGenerationClient {
    pub fn new(script: Vec<Step>, fallback: Step) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
        })
    }

    /// Always succeeds
    pub fn healthy() -> Arc<Self> {
        Self::new(vec![], Step::Text("OK"))
    }

    /// Always fails with `err`
    pub fn failing(err: GenerationError) -> Arc<Self> {
        Self::new(vec![], Step::Fail(err))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationClient for ScriptedGenerationClient {
    async fn generate(&self, _request: &GenerationRequest) -> Result<GenerationResponse, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().pop_front().unwrap_or_else(|| self.fallback.clone());

        match step {
            Step::Text(text) => Ok(GenerationResponse {
                text: text.to_string(),
                model: Some("scripted".to_string()),
                usage: None,
            }),
            Step::Fail(err) => Err(err),
            Step::Hang => std::future::pending().await,
        }
    }
}

pub fn rate_limited() -> GenerationError {
    GenerationError::new("rate limited").with_code("rate_limit_exceeded")
}

pub fn unavailable() -> GenerationError {
    GenerationError::new("upstream down").with_status(503)
}

pub fn bad_request() -> GenerationError {
    GenerationError::new("prompt too long")
        .with_status(400)
        .with_code("invalid_request_error")
}

/// Shared store that is always unreachable
#[derive(Default)]
pub struct UnavailableStore {
    pub calls: AtomicUsize,
}

#[async_trait]
impl SharedStateService for UnavailableStore {
    async fn increment_with_expiry(&self, _scope_key: &str, _key: &str, _ttl_ms: u64) -> Result<u64, CoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CoreError::StateStoreError("connection refused".to_string()))
    }

    async fn health_check(&self) -> Result<bool, CoreError> {
        Err(CoreError::StateStoreError("connection refused".to_string()))
    }
}

/// In-memory store that can be switched off and on
pub struct ToggleStore {
    inner: InMemorySharedStateService,
    down: AtomicBool,
}

impl ToggleStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: InMemorySharedStateService::with_clock(clock),
            down: AtomicBool::new(false),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl SharedStateService for ToggleStore {
    async fn increment_with_expiry(&self, scope_key: &str, key: &str, ttl_ms: u64) -> Result<u64, CoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(CoreError::StateStoreError("store offline".to_string()));
        }
        self.inner.increment_with_expiry(scope_key, key, ttl_ms).await
    }
}

/// Store whose calls take far longer than any sensible timeout
pub struct SlowStore {
    pub delay: Duration,
}

#[async_trait]
impl SharedStateService for SlowStore {
    async fn increment_with_expiry(&self, _scope_key: &str, _key: &str, _ttl_ms: u64) -> Result<u64, CoreError> {
        tokio::time::sleep(self.delay).await;
        Ok(1)
    }
}

/// Retry policy without jitter
pub fn fixed_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        jitter_ratio: 0.0,
        ..RetryPolicy::default()
    }
}

/// Everything a retry test needs to observe
pub struct RetryHarness {
    pub client: RetryClient,
    pub backend: Arc<ScriptedGenerationClient>,
    pub breaker: Arc<CircuitBreaker>,
    pub clock: Arc<ManualClock>,
    pub sleeper: Arc<ManualSleeper>,
}

impl RetryHarness {
    pub fn new(backend: Arc<ScriptedGenerationClient>, policy: RetryPolicy, breaker_config: CircuitBreakerConfig) -> Self {
        let clock = Arc::new(ManualClock::new(T0));
        let sleeper = Arc::new(ManualSleeper::new(clock.clone()));
        let breaker = Arc::new(CircuitBreaker::new("generation", breaker_config, clock.clone()));
        let client = RetryClient::new(backend.clone(), breaker.clone(), policy, clock.clone(), sleeper.clone());

        Self {
            client,
            backend,
            breaker,
            clock,
            sleeper,
        }
    }

    /// Backoff waits requested so far, in milliseconds
    pub fn sleeps_ms(&self) -> Vec<u64> {
        self.sleeper.recorded().iter().map(|d| d.as_millis() as u64).collect()
    }
}

/// Breaker whose half-open lease equals its cooldown
pub fn breaker_config(failure_threshold: u32, reset_timeout_ms: u64) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold,
        reset_timeout_ms,
        call_timeout_ms: 0,
    }
}

/// Server on a manual clock with an in-memory store
pub struct TestServer {
    pub server: Arc<QuillServer>,
    pub backend: Arc<ScriptedGenerationClient>,
    pub clock: Arc<ManualClock>,
}

pub fn test_server(config: ServerConfig, backend: Arc<ScriptedGenerationClient>) -> TestServer {
    let clock = Arc::new(ManualClock::new(T0));
    let sleeper = Arc::new(ManualSleeper::new(clock.clone()));
    let store = Arc::new(InMemorySharedStateService::with_clock(clock.clone()));

    let server = QuillServer::new(config, store, backend.clone(), clock.clone(), sleeper);
    TestServer {
        server: Arc::new(server),
        backend,
        clock,
    }
}
