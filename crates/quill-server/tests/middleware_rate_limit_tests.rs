use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::routing::get;
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use quill_core::ManualClock;
use quill_server::api::middleware::RateLimitLayer;
use quill_server::resilience::{PolicyRule, PolicyTable, RateLimitPolicy, RateLimiter, RateLimiterConfig};
use quill_server::shared_state::{InMemorySharedStateService, SharedStateService};

mod test_fixtures;
use test_fixtures::*;

fn app_with_store(store: Arc<dyn SharedStateService>, clock: Arc<ManualClock>) -> Router {
    let limiter = Arc::new(RateLimiter::new(RateLimiterConfig::default(), store, clock.clone()));
    let policies = Arc::new(PolicyTable::new(
        vec![PolicyRule::new("/api/auth", RateLimitPolicy::new("auth", 5, 15 * 60 * 1000))],
        RateLimitPolicy::new("api", 100, 60_000),
    ));

    Router::new()
        .route("/api/auth/login", get(|| async { "logged in" }))
        .route("/api/letters", get(|| async { "letters" }))
        .layer(RateLimitLayer::new(limiter, policies, clock))
}

fn app() -> (Router, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(T0));
    let store = Arc::new(InMemorySharedStateService::with_clock(clock.clone()));
    (app_with_store(store, clock.clone()), clock)
}

fn get_from(path: &str, ip: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header("x-forwarded-for", ip)
        .body(Body::empty())
        .unwrap()
}

fn header_u64(response: &axum::response::Response, name: &str) -> u64 {
    response.headers()[name].to_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn test_allowed_responses_carry_rate_limit_headers() {
    init_test_tracing();
    let (app, _clock) = app();

    let response = app.oneshot(get_from("/api/letters", "1.2.3.4")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_u64(&response, "x-ratelimit-limit"), 100);
    assert_eq!(header_u64(&response, "x-ratelimit-remaining"), 99);
    let window_end_ms = (T0 / 60_000 + 1) * 60_000;
    assert_eq!(header_u64(&response, "x-ratelimit-reset"), window_end_ms / 1000);
    assert!(response.headers().get(header::RETRY_AFTER).is_none());
}

#[tokio::test]
async fn test_sixth_login_is_throttled() {
    let (app, _clock) = app();

    for expected in (0..5u64).rev() {
        let response = app.clone().oneshot(get_from("/api/auth/login", "1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_u64(&response, "x-ratelimit-remaining"), expected);
    }

    let response = app.clone().oneshot(get_from("/api/auth/login", "1.2.3.4")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header_u64(&response, "x-ratelimit-remaining"), 0);
    assert_eq!(header_u64(&response, "x-ratelimit-limit"), 5);
    let retry_after = header_u64(&response, "retry-after");
    assert!(retry_after > 0);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"]["code"], "ERR_TOO_MANY_REQUESTS");
    assert_eq!(json["error"]["retryAfter"], retry_after);

    // Other callers and other route classes are unaffected.
    let other_ip = app.clone().oneshot(get_from("/api/auth/login", "5.6.7.8")).await.unwrap();
    assert_eq!(other_ip.status(), StatusCode::OK);
    let other_route = app.oneshot(get_from("/api/letters", "1.2.3.4")).await.unwrap();
    assert_eq!(other_route.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_callers_without_address_share_unknown_bucket() {
    let (app, _clock) = app();

    for _ in 0..5 {
        let request = Request::builder().uri("/api/auth/login").body(Body::empty()).unwrap();
        assert_eq!(app.clone().oneshot(request).await.unwrap().status(), StatusCode::OK);
    }

    let request = Request::builder()
        .uri("/api/auth/login")
        .header("x-real-ip", "   ")
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.oneshot(request).await.unwrap().status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_throttling_survives_store_outage() {
    let clock = Arc::new(ManualClock::new(T0));
    let app = app_with_store(Arc::new(UnavailableStore::default()), clock);

    for _ in 0..5 {
        let response = app.clone().oneshot(get_from("/api/auth/login", "1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app.oneshot(get_from("/api/auth/login", "1.2.3.4")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}
