//! Rate limiting algorithms.
//!
//! Both limiters are keyed by `serviceId:userId` and keep their state in a
//! [`CounterStore`], so limits hold across gateway processes when the store
//! is shared.
//!
//! - Token bucket: lazy refill of whole elapsed seconds times `rate`, capped
//!   at `capacity`. An allowed request stores `(tokens, now)`; a denied one
//!   leaves the refill timestamp where it was.
//! - Sliding window: a time-ordered log of request timestamps; entries older
//!   than the window are pruned before the count is compared to `threshold`.
//!   A denied request is not recorded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::security::limit_config::{LimitConfig, LimitConfigStore, LimitKind};
use crate::security::store::{BucketSpec, Clock, CounterStore, StoreError, SystemClock, WindowSpec};

const BUCKET_PREFIX: &str = "rate_limit:";
const WINDOW_PREFIX: &str = "sliding_window:";
const BUCKET_TTL: Duration = Duration::from_secs(120);

/// A limiter algorithm.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Record one request for `key` and report whether it is allowed.
    async fn allow(&self, key: &str, config: &LimitConfig) -> Result<bool, StoreError>;
}

/// Token bucket limiter.
pub struct TokenBucketLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
}

impl TokenBucketLimiter {
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn allow(&self, key: &str, config: &LimitConfig) -> Result<bool, StoreError> {
        let key = format!("{BUCKET_PREFIX}{key}");
        let spec = BucketSpec {
            rate: config.rate,
            capacity: config.capacity,
            ttl: BUCKET_TTL,
        };
        self.store.take_token(&key, spec, self.clock.now_millis()).await
    }
}

/// Sliding window log limiter.
pub struct SlidingWindowLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    seq: AtomicU64,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            seq: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    async fn allow(&self, key: &str, config: &LimitConfig) -> Result<bool, StoreError> {
        let key = format!("{WINDOW_PREFIX}{key}");
        let now = self.clock.now_millis();
        let window_ms = config.window.saturating_mul(1000);

        // Same-millisecond requests need distinct sorted-set members.
        let member = format!("{now}-{}", self.seq.fetch_add(1, Ordering::Relaxed));
        let spec = WindowSpec {
            min_millis: now.saturating_sub(window_ms),
            threshold: config.threshold,
            ttl: Duration::from_secs(config.window.saturating_mul(2)),
        };
        self.store.try_admit(&key, spec, now, &member).await
    }
}

/// Picks the limiter configured for a service and applies it.
pub struct RateLimitService {
    limits: Arc<LimitConfigStore>,
    token_bucket: TokenBucketLimiter,
    sliding_window: SlidingWindowLimiter,
}

impl RateLimitService {
    pub fn new(limits: Arc<LimitConfigStore>, store: Arc<dyn CounterStore>) -> Self {
        Self::with_clock(limits, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        limits: Arc<LimitConfigStore>,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            limits,
            token_bucket: TokenBucketLimiter::new(store.clone(), clock.clone()),
            sliding_window: SlidingWindowLimiter::new(store, clock),
        }
    }

    /// Check one request of `user_id` against `service_id`'s limit.
    pub async fn check(&self, service_id: &str, user_id: &str) -> Result<bool, StoreError> {
        let config = self.limits.get(service_id);
        let key = format!("{service_id}:{user_id}");
        let limiter: &dyn RateLimiter = match config.kind {
            LimitKind::TokenBucket => &self.token_bucket,
            LimitKind::SlidingWindow => &self.sliding_window,
        };
        let allowed = limiter.allow(&key, &config).await?;
        tracing::debug!(key = %key, kind = config.kind.as_str(), allowed, "Rate limit check");
        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::store::{ManualClock, MemoryStore};

    fn setup() -> (Arc<ManualClock>, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        (clock, store)
    }

    #[tokio::test]
    async fn token_bucket_refills_whole_seconds() {
        let (clock, store) = setup();
        let limiter = TokenBucketLimiter::new(store, clock.clone());
        let config = LimitConfig {
            rate: 1,
            capacity: 10,
            ..LimitConfig::default()
        };

        for _ in 0..10 {
            assert!(limiter.allow("svc:u1", &config).await.unwrap());
        }
        assert!(!limiter.allow("svc:u1", &config).await.unwrap());

        clock.advance(Duration::from_secs(5));
        for _ in 0..5 {
            assert!(limiter.allow("svc:u1", &config).await.unwrap());
        }
        assert!(!limiter.allow("svc:u1", &config).await.unwrap());
    }

    #[tokio::test]
    async fn token_bucket_keeps_sub_second_progress() {
        let (clock, store) = setup();
        let limiter = TokenBucketLimiter::new(store, clock.clone());
        let config = LimitConfig {
            rate: 1,
            capacity: 1,
            ..LimitConfig::default()
        };

        assert!(limiter.allow("k", &config).await.unwrap());
        // Two half-second steps add up to one token.
        clock.advance(Duration::from_millis(500));
        assert!(!limiter.allow("k", &config).await.unwrap());
        clock.advance(Duration::from_millis(500));
        assert!(limiter.allow("k", &config).await.unwrap());
    }

    #[tokio::test]
    async fn sliding_window_resets_after_window() {
        let (clock, store) = setup();
        let limiter = SlidingWindowLimiter::new(store, clock.clone());
        let config = LimitConfig {
            kind: LimitKind::SlidingWindow,
            window: 60,
            threshold: 3,
            ..LimitConfig::default()
        };

        for _ in 0..3 {
            assert!(limiter.allow("svc:u1", &config).await.unwrap());
        }
        assert!(!limiter.allow("svc:u1", &config).await.unwrap());

        clock.advance(Duration::from_secs(61));
        assert!(limiter.allow("svc:u1", &config).await.unwrap());
    }

    #[tokio::test]
    async fn service_uses_configured_kind_per_service() {
        let (clock, store) = setup();
        let limits = Arc::new(LimitConfigStore::new());
        limits.set(
            "order-service",
            LimitConfig {
                kind: LimitKind::SlidingWindow,
                window: 60,
                threshold: 1,
                ..LimitConfig::default()
            },
        );
        let service = RateLimitService::with_clock(limits, store, clock);

        assert!(service.check("order-service", "u1").await.unwrap());
        assert!(!service.check("order-service", "u1").await.unwrap());
        // Other users and other services are counted separately.
        assert!(service.check("order-service", "u2").await.unwrap());
        assert!(service.check("user-service", "u1").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_requests_respect_both_limits() {
        let (clock, store) = setup();
        let bucket = Arc::new(TokenBucketLimiter::new(store.clone(), clock.clone()));
        let window = Arc::new(SlidingWindowLimiter::new(store, clock));
        let bucket_config = LimitConfig {
            rate: 1,
            capacity: 10,
            ..LimitConfig::default()
        };
        let window_config = LimitConfig {
            kind: LimitKind::SlidingWindow,
            window: 60,
            threshold: 10,
            ..LimitConfig::default()
        };

        let mut tasks = Vec::new();
        for _ in 0..64 {
            let (bucket, config) = (bucket.clone(), bucket_config.clone());
            tasks.push(tokio::spawn(async move { bucket.allow("svc:u1", &config).await.unwrap() }));
            let (window, config) = (window.clone(), window_config.clone());
            tasks.push(tokio::spawn(async move { window.allow("svc:u1", &config).await.unwrap() }));
        }
        let mut allowed = 0;
        for task in tasks {
            if task.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 20);
    }
}
