//!
//! Rate limiting middleware
//! Resolves the route policy and caller identity, asks the rate limiter, and
//! either short-circuits with 429 or forwards the request. Both paths carry
//! the informational limit headers.
//!

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use tower::{Layer, Service};
use tracing::info;

use quill_core::Clock;

use crate::api::errors::ApiError;
use crate::resilience::{resolve_identity, PolicyTable, RateLimitDecision, RateLimiter};

/// Requests allowed per window
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Requests left in the window
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Window end in epoch seconds
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Add rate limiting headers to a response
pub fn add_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at_secs()));
}

/// Layer for applying rate limiter middleware
#[derive(Clone)]
pub struct RateLimitLayer {
    rate_limiter: Arc<RateLimiter>,
    policies: Arc<PolicyTable>,
    clock: Arc<dyn Clock>,
}

impl RateLimitLayer {
    /// Create a new rate limit layer
    pub fn new(rate_limiter: Arc<RateLimiter>, policies: Arc<PolicyTable>, clock: Arc<dyn Clock>) -> Self {
        Self {
            rate_limiter,
            policies,
            clock,
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            rate_limiter: self.rate_limiter.clone(),
            policies: self.policies.clone(),
            clock: self.clock.clone(),
        }
    }
}

/// Service for applying rate limiter middleware
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    rate_limiter: Arc<RateLimiter>,
    policies: Arc<PolicyTable>,
    clock: Arc<dyn Clock>,
}

impl<S> Service<Request> for RateLimitService<S>
where
    S: Service<Request, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        // The clone may not be ready; keep the one poll_ready was called on.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let rate_limiter = self.rate_limiter.clone();
        let clock = self.clock.clone();

        let policy = self.policies.resolve(req.uri().path()).clone();
        let identity = resolve_identity(req.headers());

        Box::pin(async move {
            let decision = rate_limiter.check(&identity, &policy).await;

            if !decision.allowed {
                let retry_after_secs = decision.retry_after_secs(clock.now_ms());
                info!(
                    policy = %policy.name,
                    identity = %identity,
                    retry_after_secs,
                    degraded = decision.degraded,
                    "Request throttled"
                );
                let mut response = ApiError::too_many_requests(retry_after_secs).into_response();
                add_rate_limit_headers(response.headers_mut(), &decision);
                return Ok(response);
            }

            let mut response = inner.call(req).await?;
            add_rate_limit_headers(response.headers_mut(), &decision);
            Ok(response)
        })
    }
}
