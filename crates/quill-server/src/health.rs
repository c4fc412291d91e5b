//! Canary probe for the generation dependency

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use quill_core::Clock;

use crate::generation::GenerationRequest;
use crate::resilience::RetryClient;

const UNKNOWN_FAILURE: &str = "The letter generation service did not respond.";

/// Result of one canary call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    /// Whether the canary produced text
    pub healthy: bool,
    /// Time the canary took
    pub response_time_ms: u64,
    /// User-facing reason the canary failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Issues a minimal generation call through a [`RetryClient`]
pub struct HealthProbe {
    client: Arc<RetryClient>,
    request: GenerationRequest,
    clock: Arc<dyn Clock>,
}

impl HealthProbe {
    /// Create a probe sending `prompt` with a one-token budget
    pub fn new(client: Arc<RetryClient>, prompt: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            request: GenerationRequest::new(prompt, 1),
            clock,
        }
    }

    /// Run the canary
    pub async fn check(&self) -> ProbeResult {
        let started = self.clock.now_ms();
        let outcome = self.client.execute(&self.request).await;
        let response_time_ms = self.clock.now_ms().saturating_sub(started);

        match outcome.error {
            None if outcome.success => {
                debug!(response_time_ms, "Generation canary succeeded");
                ProbeResult {
                    healthy: true,
                    response_time_ms,
                    error: None,
                }
            }
            error => {
                let detail = error.as_ref().map(|e| e.to_string()).unwrap_or_else(|| "unknown failure".to_string());
                warn!(response_time_ms, error = %detail, "Generation canary failed");
                // Provider messages stay in the log; callers get the coarse text.
                let message = error.map_or(UNKNOWN_FAILURE, |e| e.user_message());
                ProbeResult {
                    healthy: false,
                    response_time_ms,
                    error: Some(message.to_string()),
                }
            }
        }
    }
}
