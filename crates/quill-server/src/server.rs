//! Main Quill server implementation
//!
//! Owns every resilience component for the lifetime of the process and
//! serves the HTTP surface.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use quill_core::{Clock, Sleeper};
use quill_monitoring::LogExt;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::generation::GenerationClient;
use crate::health::HealthProbe;
use crate::resilience::{CircuitBreaker, PolicyTable, RateLimiter, RetryClient};
use crate::shared_state::SharedStateService;

/// Circuit name of the generation dependency
pub const GENERATION_CIRCUIT: &str = "generation";

/// Main server implementation
#[derive(Clone)]
pub struct QuillServer {
    /// Configuration
    pub config: ServerConfig,

    shared_state: Arc<dyn SharedStateService>,
    rate_limiter: Arc<RateLimiter>,
    policies: Arc<PolicyTable>,
    breaker: Arc<CircuitBreaker>,
    retry_client: Arc<RetryClient>,
    health_probe: Arc<HealthProbe>,
    clock: Arc<dyn Clock>,
}

/// Manual Debug implementation that doesn't try to debug the trait objects
impl std::fmt::Debug for QuillServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuillServer")
            .field("config", &self.config)
            .field("circuit", &self.breaker.get_state())
            .field("fallback_entries", &self.rate_limiter.fallback_store().len())
            .finish()
    }
}

impl QuillServer {
    /// Wire up a server from its collaborators
    pub fn new(
        config: ServerConfig,
        shared_state: Arc<dyn SharedStateService>,
        generation: Arc<dyn GenerationClient>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            GENERATION_CIRCUIT,
            config.resilience.circuit_breaker_config(),
            clock.clone(),
        ));

        let retry_client = Arc::new(RetryClient::new(
            generation.clone(),
            breaker.clone(),
            config.resilience.retry_policy(),
            clock.clone(),
            sleeper.clone(),
        ));

        // The canary makes exactly one call; it still counts toward the breaker.
        let mut probe_policy = config.resilience.retry_policy();
        probe_policy.max_retries = 0;
        let probe_client = Arc::new(RetryClient::new(generation, breaker.clone(), probe_policy, clock.clone(), sleeper));
        let health_probe = Arc::new(HealthProbe::new(
            probe_client,
            config.generation.probe_prompt.clone(),
            clock.clone(),
        ));

        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limiter_config(),
            shared_state.clone(),
            clock.clone(),
        ));
        let policies = Arc::new(config.rate_limits.policy_table());

        Self {
            config,
            shared_state,
            rate_limiter,
            policies,
            breaker,
            retry_client,
            health_probe,
            clock,
        }
    }

    /// Run the server until ctrl-c
    pub async fn run(self) -> ServerResult<()> {
        info!("Starting Quill Server");

        let sweeper = self.rate_limiter.fallback_store().clone().spawn_sweeper(
            self.clock.clone(),
            Duration::from_millis(self.config.resilience.fallback_sweep_interval_ms.max(1)),
        );

        let app = crate::api::build_router(Arc::new(self.clone()));

        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| ServerError::ConfigError(format!("Invalid bind address: {}", e)))?;
        let listener = TcpListener::bind(addr).await.log_err("Failed to bind listener")?;
        info!("Listening on {}", listener.local_addr()?);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .log_err("Server terminated with an error")?;

        sweeper.abort();
        info!("Quill Server stopped");
        Ok(())
    }

    /// Shared counting store
    pub fn shared_state(&self) -> &Arc<dyn SharedStateService> {
        &self.shared_state
    }

    /// Inbound rate limiter
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Route policy table
    pub fn policies(&self) -> &Arc<PolicyTable> {
        &self.policies
    }

    /// Breaker guarding the generation service
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Retrying generation client for request handlers
    pub fn retry_client(&self) -> &Arc<RetryClient> {
        &self.retry_client
    }

    /// Generation canary
    pub fn health_probe(&self) -> &Arc<HealthProbe> {
        &self.health_probe
    }

    /// Clock shared by every component
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Check if the shared state service is healthy
    pub async fn check_shared_state_health(&self) -> ServerResult<bool> {
        self.shared_state.health_check().await.map_err(ServerError::from)
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // Without a signal handler there is nothing to wait for.
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
