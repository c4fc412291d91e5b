use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use serde_json::Value;
use tower::ServiceExt;

use quill_server::api::build_router;
use quill_server::config::ServerConfig;

mod test_fixtures;
use test_fixtures::*;

async fn json_body(response: Response) -> Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn get(path: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header("x-forwarded-for", "10.1.1.1")
        .body(Body::empty())
        .unwrap()
}

fn post(path: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("x-forwarded-for", "10.1.1.1")
        .body(Body::empty())
        .unwrap()
}

fn config_with_threshold(threshold: u32) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.resilience.circuit_threshold = threshold;
    config
}

#[tokio::test]
async fn test_health_up_when_canary_succeeds() {
    init_test_tracing();
    let ts = test_server(ServerConfig::default(), ScriptedGenerationClient::healthy());

    let response = build_router(ts.server.clone()).oneshot(get("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["status"], "UP");
    assert_eq!(json["dependencies"]["generation"]["healthy"], true);
    assert_eq!(json["dependencies"]["sharedState"]["status"], "UP");
    assert_eq!(json["dependencies"]["circuit"]["status"], "CLOSED");
    assert_eq!(ts.backend.calls(), 1);
}

#[tokio::test]
async fn test_health_down_when_canary_fails() {
    let ts = test_server(ServerConfig::default(), ScriptedGenerationClient::failing(unavailable()));

    let response = build_router(ts.server.clone()).oneshot(get("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = json_body(response).await;
    assert_eq!(json["status"], "DOWN");
    assert_eq!(json["dependencies"]["generation"]["healthy"], false);
    let reason = json["dependencies"]["generation"]["error"].as_str().unwrap();
    assert!(reason.contains("temporarily unavailable"), "reason: {}", reason);
    assert!(!json.to_string().contains("upstream down"));
    // The canary makes a single call, never retries.
    assert_eq!(ts.backend.calls(), 1);
}

#[tokio::test]
async fn test_health_reports_open_circuit_without_calling_out() {
    let ts = test_server(config_with_threshold(2), ScriptedGenerationClient::failing(bad_request()));
    let request = quill_server::GenerationRequest::new("draft", 100);
    ts.server.retry_client().execute(&request).await;
    ts.server.retry_client().execute(&request).await;
    assert_eq!(ts.backend.calls(), 2);

    let response = build_router(ts.server.clone()).oneshot(get("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = json_body(response).await;
    assert_eq!(json["dependencies"]["circuit"]["isOpen"], true);
    assert_eq!(json["dependencies"]["circuit"]["status"], "OPEN");
    assert_eq!(ts.backend.calls(), 2);
}

#[tokio::test]
async fn test_admin_circuit_status_and_reset() {
    let ts = test_server(config_with_threshold(1), ScriptedGenerationClient::failing(bad_request()));
    ts.server
        .retry_client()
        .execute(&quill_server::GenerationRequest::new("draft", 100))
        .await;
    let app = build_router(ts.server.clone());

    let response = app.clone().oneshot(get("/api/admin/circuit")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["status"], "OPEN");
    assert_eq!(json["failureCount"], 1);
    assert_eq!(json["nextAttemptTime"], T0 + 60_000);

    let response = app.oneshot(post("/api/admin/circuit/reset")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["status"], "CLOSED");
    assert_eq!(json["failureCount"], 0);
    assert_eq!(json["isOpen"], false);
}

#[tokio::test]
async fn test_admin_routes_use_admin_policy() {
    let ts = test_server(ServerConfig::default(), ScriptedGenerationClient::healthy());
    let app = build_router(ts.server.clone());

    for _ in 0..10 {
        let response = app.clone().oneshot(get("/api/admin/circuit")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "10");
    }

    let response = app.oneshot(get("/api/admin/circuit")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}
