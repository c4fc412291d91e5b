//! API module for the Quill Server
//!
//! Health and operator routes, all behind the rate limit layer.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub mod admin;
pub mod errors;
pub mod health;
pub mod middleware;

use crate::server::QuillServer;
use middleware::RateLimitLayer;

/// Build the router for API endpoints
pub fn build_router(server: Arc<QuillServer>) -> Router {
    let rate_limit = RateLimitLayer::new(
        server.rate_limiter().clone(),
        server.policies().clone(),
        server.clock().clone(),
    );

    Router::new()
        // Health check
        .route("/health", get(health::health_check))

        // Breaker operations
        .route("/api/admin/circuit", get(admin::circuit_status_handler))
        .route("/api/admin/circuit/reset", post(admin::circuit_reset_handler))

        .layer(rate_limit)
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}
