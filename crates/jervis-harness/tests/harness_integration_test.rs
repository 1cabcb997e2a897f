//! Cross-cutting tests exercising rate limiting, the circuit breaker, and
//! the link safety qualifier together, the way the polling handlers and
//! continuous indexer compose them in practice.

use std::time::Duration;

use jervis_core::staging::StagingStore;
use jervis_core::types::LinkVerdict;
use jervis_harness::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
use jervis_harness::rate_limiter::{RateLimitConfig, RateLimiter};
use jervis_harness::security::{LinkSafetyEvaluator, LinkSafetyQualifier};
use uuid::Uuid;

fn fast_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 3,
        success_threshold: 2,
        timeout: Duration::from_millis(100),
        call_timeout: Duration::from_secs(5),
    }
}

// ===========================================================================
// Rate limiter
// ===========================================================================

#[test]
fn rate_limiter_allows_up_to_burst_then_blocks() {
    let limiter = RateLimiter::new(RateLimitConfig::per_second(10));
    for i in 0..10 {
        assert!(limiter.check("api.example.com"), "request {i} should be allowed");
    }
    assert!(!limiter.check("api.example.com"));
}

#[tokio::test]
async fn rate_limiter_refills_over_time() {
    let limiter = RateLimiter::new(RateLimitConfig::per_second(1000).with_burst(2));
    limiter.check("fast.example.com");
    limiter.check("fast.example.com");
    assert!(!limiter.check("fast.example.com"));

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(limiter.check("fast.example.com"));
}

// ===========================================================================
// Circuit breaker
// ===========================================================================

#[tokio::test]
async fn circuit_breaker_starts_closed() {
    let cb = CircuitBreaker::new(fast_config());
    assert_eq!(cb.state().await, CircuitState::Closed);
}

#[tokio::test]
async fn circuit_breaker_opens_after_failures() {
    let cb = CircuitBreaker::new(fast_config());
    for _ in 0..3 {
        let _ = cb.call(|| async { Err::<i32, _>("failure") }).await;
    }
    assert_eq!(cb.state().await, CircuitState::Open);
}

#[tokio::test]
async fn circuit_breaker_half_open_after_timeout_then_closes_on_success() {
    let config = CircuitBreakerConfig {
        failure_threshold: 2,
        success_threshold: 2,
        timeout: Duration::from_millis(50),
        call_timeout: Duration::from_secs(5),
    };
    let cb = CircuitBreaker::new(config);

    for _ in 0..2 {
        let _ = cb.call(|| async { Err::<i32, _>("fail") }).await;
    }
    assert_eq!(cb.state().await, CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(80)).await;
    let _ = cb.call(|| async { Ok::<_, String>(1) }).await;
    let _ = cb.call(|| async { Ok::<_, String>(2) }).await;
    assert_eq!(cb.state().await, CircuitState::Closed);
}

#[tokio::test]
async fn planner_circuit_survives_isolated_failures_without_opening() {
    // The orchestrator poll loop must not trip the breaker on a single
    // transient planner hiccup; the planner preset tolerates more.
    let cb = CircuitBreaker::new(CircuitBreakerConfig::for_planner());
    for _ in 0..3 {
        let _ = cb.call(|| async { Err::<i32, _>("planner 503") }).await;
    }
    assert_eq!(cb.state().await, CircuitState::Closed);
}

#[tokio::test]
async fn open_circuit_rejects_without_invoking_the_call() {
    let cb = CircuitBreaker::new(fast_config());
    for _ in 0..3 {
        let _ = cb.call(|| async { Err::<i32, _>("fail") }).await;
    }
    let result = cb.call(|| async { Ok::<_, String>(1) }).await;
    assert!(matches!(result, Err(CircuitBreakerError::Open)));
}

// ===========================================================================
// Rate limiter + link safety qualifier composed, as a polling handler would
// ===========================================================================

#[tokio::test]
async fn polling_like_flow_rate_limits_source_calls_and_qualifies_discovered_links() {
    let limiter = RateLimiter::new(RateLimitConfig::per_second(50));
    let store = StagingStore::new_in_memory().await.unwrap();
    let evaluator = LinkSafetyEvaluator::new(&store, LinkSafetyQualifier::new(&[]));
    let client_id = Uuid::new_v4();

    limiter.acquire("issuetracker.example.com").await;
    let verdict = evaluator
        .evaluate("https://docs.rs/serde/latest", client_id, "")
        .await
        .unwrap();
    assert_eq!(verdict.verdict, LinkVerdict::Safe);

    limiter.acquire("issuetracker.example.com").await;
    let verdict = evaluator
        .evaluate("https://bit.ly/shortened", client_id, "")
        .await
        .unwrap();
    assert_eq!(verdict.verdict, LinkVerdict::Unsafe);
}
