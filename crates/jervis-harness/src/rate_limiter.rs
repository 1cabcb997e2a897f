use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Token-bucket configuration for a single rate-limit domain.
///
/// A "domain" here is whatever a connection's `rate_limit_domain()` resolves
/// to — an HTTP host, an IMAP/POP3 host, or an OAuth provider name. Every
/// connection sharing a domain shares a bucket, so two connections against
/// the same upstream API don't double the effective rate.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Tokens added per second.
    pub tokens_per_second: f64,
    /// Maximum burst size (bucket capacity).
    pub max_burst: f64,
}

impl RateLimitConfig {
    pub fn per_second(count: u32) -> Self {
        Self {
            tokens_per_second: count as f64,
            max_burst: count as f64,
        }
    }

    pub fn per_minute(count: u32) -> Self {
        Self {
            tokens_per_second: count as f64 / 60.0,
            max_burst: count as f64,
        }
    }

    /// Build from the per-connection limits stored on a `Connection`. The
    /// per-second figure wins when both are set since it's the tighter
    /// constraint; falls back to a conservative default when neither is set.
    pub fn from_connection_limits(
        max_per_second: Option<u32>,
        max_per_minute: Option<u32>,
    ) -> Self {
        match (max_per_second, max_per_minute) {
            (Some(rps), _) => Self::per_second(rps),
            (None, Some(rpm)) => Self::per_minute(rpm),
            (None, None) => Self::per_second(5),
        }
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.max_burst = burst as f64;
        self
    }
}

// ---------------------------------------------------------------------------
// Bucket (per-domain state)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

impl TokenBucket {
    fn new(max_burst: f64) -> Self {
        let now = Instant::now();
        Self {
            tokens: max_burst,
            last_refill: now,
            last_used: now,
        }
    }

    fn refill(&mut self, tokens_per_second: f64, max_burst: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * tokens_per_second).min(max_burst);
        self.last_refill = now;
    }

    /// Try to consume `cost` tokens. Returns the wait duration on failure.
    fn try_consume(
        &mut self,
        cost: f64,
        tokens_per_second: f64,
        max_burst: f64,
    ) -> Result<(), Duration> {
        self.refill(tokens_per_second, max_burst);
        self.last_used = Instant::now();
        if self.tokens >= cost {
            self.tokens -= cost;
            Ok(())
        } else {
            let deficit = cost - self.tokens;
            let wait = Duration::from_secs_f64(deficit / tokens_per_second);
            Err(wait)
        }
    }
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Per-domain async rate limiter. Callers never see a rejection — `acquire`
/// suspends the caller until tokens are available, since polling and
/// indexing are background work with no client waiting synchronously on the
/// other end.
#[derive(Debug)]
pub struct RateLimiter {
    default_config: RateLimitConfig,
    configs: DashMap<String, RateLimitConfig>,
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimiter {
    pub fn new(default_config: RateLimitConfig) -> Self {
        Self {
            default_config,
            configs: DashMap::new(),
            buckets: DashMap::new(),
        }
    }

    /// Register a domain-specific config, overriding the default for that
    /// domain. Safe to call before the domain has any bucket yet.
    pub fn configure_domain(&self, domain: &str, config: RateLimitConfig) {
        self.configs.insert(domain.to_string(), config);
    }

    fn config_for(&self, domain: &str) -> RateLimitConfig {
        self.configs
            .get(domain)
            .map(|c| c.clone())
            .unwrap_or_else(|| self.default_config.clone())
    }

    /// Suspend the caller until one token is available for `domain`.
    pub async fn acquire(&self, domain: &str) {
        self.acquire_with_cost(domain, 1.0).await
    }

    pub async fn acquire_with_cost(&self, domain: &str, cost: f64) {
        loop {
            let config = self.config_for(domain);
            let wait = {
                let mut bucket = self
                    .buckets
                    .entry(domain.to_string())
                    .or_insert_with(|| TokenBucket::new(config.max_burst));
                bucket.try_consume(cost, config.tokens_per_second, config.max_burst)
            };
            match wait {
                Ok(()) => return,
                Err(wait) => {
                    debug!(domain, ?wait, "rate limit suspending caller");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Non-blocking check, used where a caller wants to fail fast instead of
    /// suspending (e.g. a health probe).
    pub fn check(&self, domain: &str) -> bool {
        let config = self.config_for(domain);
        let mut bucket = self
            .buckets
            .entry(domain.to_string())
            .or_insert_with(|| TokenBucket::new(config.max_burst));
        bucket
            .try_consume(1.0, config.tokens_per_second, config.max_burst)
            .is_ok()
    }

    /// Remove buckets idle for longer than `ttl`, so a rate limiter tracking
    /// many short-lived connections doesn't grow unbounded.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = self
            .buckets
            .iter()
            .filter(|entry| now.duration_since(entry.last_used) > ttl)
            .map(|entry| entry.key().clone())
            .collect();
        for key in &stale {
            self.buckets.remove(key);
        }
        stale.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_consumes_immediately_within_burst() {
        let limiter = RateLimiter::new(RateLimitConfig::per_second(10));
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire("github.com").await;
        }
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn acquire_suspends_past_burst() {
        let limiter = RateLimiter::new(RateLimitConfig::per_second(2).with_burst(1));
        limiter.acquire("slow.example.com").await;
        let start = Instant::now();
        limiter.acquire("slow.example.com").await;
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[test]
    fn check_rejects_without_blocking_once_exhausted() {
        let limiter = RateLimiter::new(RateLimitConfig::per_second(1).with_burst(1));
        assert!(limiter.check("api.example.com"));
        assert!(!limiter.check("api.example.com"));
    }

    #[test]
    fn per_domain_config_overrides_default() {
        let limiter = RateLimiter::new(RateLimitConfig::per_second(1));
        limiter.configure_domain("fast.example.com", RateLimitConfig::per_second(100));
        for _ in 0..10 {
            assert!(limiter.check("fast.example.com"));
        }
    }

    #[test]
    fn evict_idle_removes_stale_buckets() {
        let limiter = RateLimiter::new(RateLimitConfig::per_second(5));
        limiter.check("a.example.com");
        limiter.check("b.example.com");
        assert_eq!(limiter.bucket_count(), 2);

        let removed = limiter.evict_idle(Duration::from_secs(0));
        assert_eq!(removed, 2);
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn from_connection_limits_prefers_per_second() {
        let cfg = RateLimitConfig::from_connection_limits(Some(3), Some(1000));
        assert_eq!(cfg.tokens_per_second, 3.0);
    }

    #[test]
    fn from_connection_limits_falls_back_to_per_minute() {
        let cfg = RateLimitConfig::from_connection_limits(None, Some(60));
        assert_eq!(cfg.tokens_per_second, 1.0);
    }

    #[test]
    fn from_connection_limits_defaults_when_unset() {
        let cfg = RateLimitConfig::from_connection_limits(None, None);
        assert_eq!(cfg.tokens_per_second, 5.0);
    }
}
