//! Error handling for the Quill Server API
//!
//! Every error leaves the server as `{"error": {"code": ..., "message": ...}}`.
//! Throttling errors also carry `retryAfter` and a `Retry-After` header.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

use crate::error::ServerError;
use crate::resilience::{classify, ErrorClass, RetryError};

/// Message for any failure of the generation dependency
const UNAVAILABLE_MESSAGE: &str = "The service is temporarily unavailable. Please try again shortly.";

/// API Error type for returning standard error responses
#[derive(Debug)]
pub enum ApiError {
    /// Bad request (400)
    BadRequest(String),
    /// Not found (404)
    NotFound(String),
    /// Too many requests (429)
    TooManyRequests {
        /// Description of the limit
        message: String,
        /// Seconds until the caller may retry
        retry_after_secs: u64,
    },
    /// Service unavailable (503)
    ServiceUnavailable(String),
    /// Internal server error (500)
    InternalServerError(String),
    /// Wrapped server error
    ServerError(ServerError),
    /// Failed generation call
    Generation(RetryError),
}

impl From<ServerError> for ApiError {
    fn from(err: ServerError) -> Self {
        ApiError::ServerError(err)
    }
}

impl From<RetryError> for ApiError {
    fn from(err: RetryError) -> Self {
        ApiError::Generation(err)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::BadRequest(msg) => write!(f, "Bad Request: {}", msg),
            ApiError::NotFound(msg) => write!(f, "Not Found: {}", msg),
            ApiError::TooManyRequests { message, .. } => write!(f, "Too Many Requests: {}", message),
            ApiError::ServiceUnavailable(msg) => write!(f, "Service Unavailable: {}", msg),
            ApiError::InternalServerError(msg) => write!(f, "Internal Server Error: {}", msg),
            ApiError::ServerError(err) => write!(f, "Server Error: {}", err),
            ApiError::Generation(err) => write!(f, "Generation Error: {}", err),
        }
    }
}

impl ApiError {
    /// Throttling error for a denied rate limit check
    pub fn too_many_requests(retry_after_secs: u64) -> Self {
        ApiError::TooManyRequests {
            message: "Too many requests. Please slow down and try again later.".to_string(),
            retry_after_secs,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, retry_after) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "ERR_BAD_REQUEST", msg, None),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "ERR_NOT_FOUND", msg, None),
            ApiError::TooManyRequests { message, retry_after_secs } => {
                (StatusCode::TOO_MANY_REQUESTS, "ERR_TOO_MANY_REQUESTS", message, Some(retry_after_secs))
            }
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "ERR_SERVICE_UNAVAILABLE", msg, None),
            ApiError::InternalServerError(msg) => {
                error!("Internal server error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "ERR_INTERNAL_SERVER_ERROR",
                    "Internal server error".to_string(),
                    None,
                )
            }
            ApiError::Generation(err) => {
                error!(error = %err, "Generation failed");
                let status = match &err {
                    RetryError::Generation(e) if classify(e) == ErrorClass::NonRetryable => StatusCode::BAD_GATEWAY,
                    _ => StatusCode::SERVICE_UNAVAILABLE,
                };
                (status, "ERR_GENERATION_FAILED", err.user_message().to_string(), None)
            }
            ApiError::ServerError(err) => return server_error_response(err),
        };

        error_response(status, code, message, retry_after)
    }
}

fn server_error_response(err: ServerError) -> Response {
    match err {
        ServerError::RateLimitExceeded { retry_after_secs, .. } => {
            ApiError::too_many_requests(retry_after_secs).into_response()
        }
        ServerError::CircuitBreakerOpen { .. } | ServerError::GenerationFailed(_) => {
            // Breaker internals are logged, never returned.
            error!(error = %err, "Generation dependency unavailable");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "ERR_SERVICE_UNAVAILABLE",
                UNAVAILABLE_MESSAGE.to_string(),
                None,
            )
        }
        ServerError::ConfigError(_) | ServerError::StateServiceError(_) | ServerError::InternalError(_) => {
            ApiError::InternalServerError(err.to_string()).into_response()
        }
    }
}

fn error_response(status: StatusCode, code: &str, message: String, retry_after: Option<u64>) -> Response {
    let mut body = json!({
        "error": {
            "code": code,
            "message": message,
        }
    });
    if let Some(secs) = retry_after {
        body["error"]["retryAfter"] = json!(secs);
    }

    let mut response = (status, Json(body)).into_response();
    if let Some(secs) = retry_after {
        response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::GenerationError;

    #[test]
    fn test_rate_limit_error_maps_to_429() {
        let response = ApiError::from(ServerError::RateLimitExceeded {
            policy: "auth".into(),
            identity: "ip:1.2.3.4".into(),
            max_requests: 5,
            window_ms: 900_000,
            retry_after_secs: 42,
        })
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");
    }

    #[test]
    fn test_circuit_open_maps_to_503() {
        let response = ApiError::from(ServerError::CircuitBreakerOpen {
            circuit: "generation".into(),
            failures: 10,
            retry_after_ms: 1_000,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = ApiError::from(RetryError::CircuitOpen {
            circuit: "generation".into(),
            failures: 10,
            retry_after_ms: 1_000,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_terminal_generation_error_maps_to_502() {
        let err = RetryError::Generation(GenerationError::new("bad prompt").with_status(400));
        assert_eq!(ApiError::from(err).into_response().status(), StatusCode::BAD_GATEWAY);
    }
}
