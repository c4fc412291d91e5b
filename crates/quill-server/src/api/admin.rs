//! Operator endpoints for the generation circuit breaker

use std::sync::Arc;

use axum::{extract::State, Json};
use tracing::warn;

use crate::resilience::CircuitBreakerState;
use crate::server::QuillServer;

/// Current breaker snapshot
pub async fn circuit_status_handler(State(server): State<Arc<QuillServer>>) -> Json<CircuitBreakerState> {
    Json(server.circuit_breaker().get_state())
}

/// Force the breaker closed
pub async fn circuit_reset_handler(State(server): State<Arc<QuillServer>>) -> Json<CircuitBreakerState> {
    let breaker = server.circuit_breaker();
    warn!(circuit = %breaker.name(), "Circuit breaker reset by operator");
    breaker.reset();
    Json(breaker.get_state())
}
