use jervis_harness::rate_limiter::{RateLimitConfig, RateLimiter};
use std::time::{Duration, Instant};

#[test]
fn allows_requests_within_burst_without_blocking() {
    let limiter = RateLimiter::new(RateLimitConfig::per_second(10));
    for _ in 0..10 {
        assert!(limiter.check("github.com"));
    }
}

#[test]
fn rejects_once_exhausted() {
    let limiter = RateLimiter::new(RateLimitConfig::per_second(5));
    for _ in 0..5 {
        assert!(limiter.check("jira.example.com"));
    }
    assert!(!limiter.check("jira.example.com"));
}

#[test]
fn separate_domains_have_separate_buckets() {
    let limiter = RateLimiter::new(RateLimitConfig::per_second(2));
    limiter.check("a.example.com");
    limiter.check("a.example.com");
    assert!(!limiter.check("a.example.com"));
    assert!(limiter.check("b.example.com"));
}

#[test]
fn per_minute_config_converts_to_per_second_rate() {
    let config = RateLimitConfig::per_minute(60);
    assert!((config.tokens_per_second - 1.0).abs() < f64::EPSILON);
    assert!((config.max_burst - 60.0).abs() < f64::EPSILON);
}

#[test]
fn with_burst_override_raises_capacity() {
    let config = RateLimitConfig::per_second(10).with_burst(20);
    assert!((config.max_burst - 20.0).abs() < f64::EPSILON);

    let limiter = RateLimiter::new(config);
    for _ in 0..20 {
        assert!(limiter.check("wiki.example.com"));
    }
    assert!(!limiter.check("wiki.example.com"));
}

#[tokio::test]
async fn acquire_with_cost_blocks_longer_for_expensive_calls() {
    let limiter = RateLimiter::new(RateLimitConfig::per_second(10).with_burst(1));
    limiter.acquire_with_cost("imap.example.com", 1.0).await;
    let start = Instant::now();
    limiter.acquire_with_cost("imap.example.com", 5.0).await;
    assert!(start.elapsed() >= Duration::from_millis(400));
}

#[test]
fn bucket_count_grows_with_distinct_domains() {
    let limiter = RateLimiter::new(RateLimitConfig::per_second(5));
    limiter.check("one.example.com");
    limiter.check("two.example.com");
    limiter.check("three.example.com");
    assert_eq!(limiter.bucket_count(), 3);
}
