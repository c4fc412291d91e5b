//!
//! Quill Server - resilience and traffic-control layer of the Quill platform
//!
//! Wraps calls to the text-generation service in retries and a circuit
//! breaker, and throttles inbound requests per caller with a distributed
//! fixed-window rate limiter.

use std::sync::Arc;

use quill_core::{SystemClock, TokioSleeper};
use tracing::info;

/// API module
pub mod api;

/// Configuration module
pub mod config;

/// Error module
pub mod error;

/// Generation client module
pub mod generation;

/// Health probe module
pub mod health;

/// Resilience module
pub mod resilience;

/// Server module
pub mod server;

/// Shared state module
pub mod shared_state;

// Re-export key types
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use generation::{GenerationClient, GenerationError, GenerationRequest, GenerationResponse, HttpGenerationClient};
pub use resilience::{CircuitBreaker, FallbackStore, RateLimitDecision, RateLimiter, RetryClient, RetryOutcome};
pub use server::QuillServer;
pub use shared_state::{create_shared_state_service, SharedStateService};

/// Run function
pub async fn run(config: ServerConfig) -> ServerResult<()> {
    info!(
        shared_state_url = %config.shared_state_url,
        generation_url = %config.generation.base_url,
        "Building Quill Server"
    );

    let shared_state = create_shared_state_service(&config.shared_state_url)?;
    let generation: Arc<dyn GenerationClient> = Arc::new(HttpGenerationClient::new(&config.generation)?);

    let server = QuillServer::new(
        config,
        shared_state,
        generation,
        Arc::new(SystemClock),
        Arc::new(TokioSleeper),
    );

    server.run().await
}
