//! Error types for the Quill Server
//!
//! This module contains the error types used throughout the server.

use thiserror::Error;
use quill_core::CoreError;

/// Server error types
#[derive(Error, Debug)]
pub enum ServerError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// State service error
    #[error("State service error: {0}")]
    StateServiceError(String),

    /// Internal server error
    #[error("Internal server error: {0}")]
    InternalError(String),

    /// Generation call failed for good
    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded for {policy}:{identity}: {max_requests} requests per {window_ms}ms. Retry after {retry_after_secs}s")]
    RateLimitExceeded {
        /// Policy that denied the request
        policy: String,
        /// Caller identity
        identity: String,
        /// Maximum requests allowed in the time window
        max_requests: u32,
        /// Time window in milliseconds
        window_ms: u64,
        /// Seconds until the window resets
        retry_after_secs: u64,
    },

    /// Circuit breaker open
    #[error("Circuit breaker open for {circuit} after {failures} failures. Retry after {retry_after_ms}ms")]
    CircuitBreakerOpen {
        /// Circuit being protected
        circuit: String,
        /// Failures counted when the call was rejected
        failures: u32,
        /// Milliseconds until a probe will be admitted
        retry_after_ms: u64,
    },
}

/// Result type for server operations
pub type ServerResult<T> = Result<T, ServerError>;

impl From<CoreError> for ServerError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::StateStoreError(msg) => ServerError::StateServiceError(msg),
            CoreError::ConfigurationError(msg) => ServerError::ConfigError(msg),
            other => ServerError::InternalError(other.to_string()),
        }
    }
}

impl From<config::ConfigError> for ServerError {
    fn from(err: config::ConfigError) -> Self {
        ServerError::ConfigError(err.to_string())
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::InternalError(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::InternalError(format!("JSON error: {}", err))
    }
}
