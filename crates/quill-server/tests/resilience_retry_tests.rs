use pretty_assertions::assert_eq;
use quill_server::generation::{GenerationError, GenerationRequest};
use quill_server::resilience::{RetryError, RetryPolicy};

mod test_fixtures;
use test_fixtures::*;

fn request() -> GenerationRequest {
    GenerationRequest::new("Write a cover letter", 512)
}

#[tokio::test]
async fn test_recovers_after_rate_limits() {
    init_test_tracing();
    let backend = ScriptedGenerationClient::new(
        vec![
            Step::Fail(rate_limited()),
            Step::Fail(rate_limited()),
            Step::Fail(rate_limited()),
        ],
        Step::Text("Dear hiring manager"),
    );
    let harness = RetryHarness::new(backend, fixed_policy(3), breaker_config(10, 60_000));

    let outcome = harness.client.execute(&request()).await;

    assert!(outcome.success);
    assert_eq!(outcome.attempts, 4);
    assert_eq!(harness.backend.calls(), 4);
    assert_eq!(outcome.data.map(|r| r.text), Some("Dear hiring manager".to_string()));
    assert_eq!(harness.sleeps_ms(), vec![1_000, 2_000, 4_000]);

    let delays: Vec<u64> = outcome.retry_history.iter().map(|a| a.delay_ms).collect();
    assert_eq!(delays, vec![1_000, 2_000, 4_000, 0]);
    let numbers: Vec<u32> = outcome.retry_history.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
    assert!(outcome.retry_history[3].error.is_none());
    assert_eq!(outcome.total_duration_ms, 7_000);

    // Success resets the breaker's count.
    assert_eq!(harness.breaker.get_state().failure_count, 0);
}

#[tokio::test]
async fn test_jittered_delays_stay_within_ten_percent() {
    let backend = ScriptedGenerationClient::new(
        vec![
            Step::Fail(rate_limited()),
            Step::Fail(rate_limited()),
            Step::Fail(rate_limited()),
        ],
        Step::Text("ok"),
    );
    let harness = RetryHarness::new(backend, RetryPolicy::default(), breaker_config(10, 60_000));

    let outcome = harness.client.execute(&request()).await;
    assert!(outcome.success);

    for (actual, nominal) in harness.sleeps_ms().into_iter().zip([1_000u64, 2_000, 4_000]) {
        let low = nominal - nominal / 10;
        let high = nominal + nominal / 10;
        assert!((low..=high).contains(&actual), "delay {} not within ±10% of {}", actual, nominal);
    }
}

#[tokio::test]
async fn test_non_retryable_error_stops_after_one_attempt() {
    let harness = RetryHarness::new(
        ScriptedGenerationClient::failing(bad_request()),
        fixed_policy(3),
        breaker_config(10, 60_000),
    );

    let outcome = harness.client.execute(&request()).await;

    assert!(!outcome.success);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(harness.backend.calls(), 1);
    assert!(harness.sleeps_ms().is_empty());
    assert_eq!(outcome.error, Some(RetryError::Generation(bad_request())));
    // Terminal failures still count toward the breaker.
    assert_eq!(harness.breaker.get_state().failure_count, 1);
}

#[tokio::test]
async fn test_budget_exhaustion_returns_full_history() {
    let harness = RetryHarness::new(
        ScriptedGenerationClient::failing(unavailable()),
        fixed_policy(3),
        breaker_config(10, 60_000),
    );

    let outcome = harness.client.execute(&request()).await;

    assert!(!outcome.success);
    assert_eq!(outcome.attempts, 4);
    assert_eq!(outcome.retry_history.len(), 4);
    assert!(outcome.retry_history.iter().all(|a| a.error == Some(unavailable())));
    assert_eq!(harness.sleeps_ms(), vec![1_000, 2_000, 4_000]);
    assert_eq!(harness.breaker.get_state().failure_count, 4);
    assert_eq!(outcome.error.map(|e| e.user_message().contains("temporarily unavailable")), Some(true));
}

#[tokio::test]
async fn test_empty_text_is_a_failure() {
    let harness = RetryHarness::new(
        ScriptedGenerationClient::new(vec![Step::Text("   ")], Step::Text("never reached")),
        fixed_policy(3),
        breaker_config(10, 60_000),
    );

    let outcome = harness.client.execute(&request()).await;

    assert!(!outcome.success);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.error, Some(RetryError::Generation(GenerationError::empty_response())));
}

#[tokio::test(start_paused = true)]
async fn test_hung_attempt_times_out_and_is_retried() {
    let policy = RetryPolicy {
        attempt_timeout_ms: 100,
        ..fixed_policy(3)
    };
    let harness = RetryHarness::new(
        ScriptedGenerationClient::new(vec![Step::Hang], Step::Text("finally")),
        policy,
        breaker_config(10, 60_000),
    );

    let outcome = harness.client.execute(&request()).await;

    assert!(outcome.success);
    assert_eq!(outcome.attempts, 2);
    let first_error = outcome.retry_history[0].error.clone().unwrap();
    assert_eq!(first_error.code.as_deref(), Some("timeout"));
}

#[tokio::test(start_paused = true)]
async fn test_overall_deadline_stops_retrying() {
    let policy = RetryPolicy {
        max_retries: 10,
        base_delay_ms: 100,
        attempt_timeout_ms: 50,
        overall_deadline_ms: 250,
        ..fixed_policy(10)
    };
    let harness = RetryHarness::new(
        ScriptedGenerationClient::new(vec![], Step::Hang),
        policy,
        breaker_config(100, 60_000),
    );

    let outcome = harness.client.execute(&request()).await;

    assert!(!outcome.success);
    // Waits of 100 then 200 would end past the 250ms deadline.
    assert_eq!(outcome.attempts, 2);
    assert_eq!(harness.sleeps_ms(), vec![100]);
    match outcome.error {
        Some(RetryError::DeadlineExceeded { deadline_ms, last_error }) => {
            assert_eq!(deadline_ms, 250);
            assert_eq!(last_error.and_then(|e| e.code), Some("timeout".to_string()));
        }
        other => panic!("expected deadline error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_circuit_opening_mid_operation_stops_retries() {
    let harness = RetryHarness::new(
        ScriptedGenerationClient::failing(unavailable()),
        fixed_policy(3),
        breaker_config(2, 60_000),
    );

    let outcome = harness.client.execute(&request()).await;

    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.retry_history.len(), 2);
    assert_eq!(harness.backend.calls(), 2);
    assert!(outcome.error.as_ref().map(RetryError::is_circuit_open).unwrap_or(false));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_operations_share_one_breaker() {
    let harness = RetryHarness::new(
        ScriptedGenerationClient::failing(bad_request()),
        fixed_policy(0),
        breaker_config(1_000, 60_000),
    );
    let client = std::sync::Arc::new(harness.client);

    let mut handles = Vec::new();
    for _ in 0..64 {
        let client = client.clone();
        handles.push(tokio::spawn(async move { client.execute(&request()).await.attempts }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), 1);
    }

    assert_eq!(harness.breaker.get_state().failure_count, 64);
    assert_eq!(harness.backend.calls(), 64);
}
