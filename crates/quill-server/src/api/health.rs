//! Health check endpoint for the Quill Server

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use tracing::info;

use crate::server::QuillServer;

/// Health check handler
///
/// Runs the generation canary, checks the shared store and reports the
/// breaker. `503` when generation is down or the breaker is open; a shared
/// store outage only degrades the service because rate limiting falls back
/// to local counters.
pub async fn health_check(State(server): State<Arc<QuillServer>>) -> impl IntoResponse {
    info!("Health check requested");

    let circuit = server.circuit_breaker().get_state();

    let generation = if circuit.is_open {
        json!({
            "healthy": false,
            "responseTimeMs": 0,
            "error": "circuit open",
        })
    } else {
        json!(server.health_probe().check().await)
    };
    let generation_healthy = generation["healthy"].as_bool().unwrap_or(false);

    let shared_state_status = match server.check_shared_state_health().await {
        Ok(true) => "UP",
        Ok(false) => "DEGRADED",
        Err(_) => "DOWN",
    };

    // The canary may have tripped the breaker.
    let circuit = server.circuit_breaker().get_state();
    let down = !generation_healthy || circuit.is_open;

    let status = if down {
        "DOWN"
    } else if shared_state_status != "UP" {
        "DEGRADED"
    } else {
        "UP"
    };

    let response = json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "dependencies": {
            "generation": generation,
            "sharedState": { "status": shared_state_status },
            "circuit": circuit,
        },
    });

    let code = if down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (code, Json(response))
}
