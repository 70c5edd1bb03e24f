//! Counter store backing the rate limiters.
//!
//! # Responsibilities
//! - Hold token bucket state (`tokens`, `last_refill`) per key
//! - Hold sliding window logs (time-ordered request timestamps) per key
//! - Expire idle keys after their TTL
//!
//! # Design Decisions
//! - Each limiter decision is one store call: refill-and-take for buckets,
//!   prune-count-admit for windows. `MemoryStore` runs it under the key's
//!   map entry lock, `RedisStore` as a Lua script, so concurrent requests
//!   never both spend the last token
//! - `MemoryStore` is process-local; `RedisStore` (feature `redis`) lets
//!   several gateway processes share limiter state
//! - Time comes from a [`Clock`] so tests control it

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as Slot;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use thiserror::Error;

/// Source of wall-clock milliseconds.
pub trait Clock: Send + Sync + 'static {
    fn now_millis(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// Clock advanced by hand.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Counter store failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key `{0}` holds a value of another type")]
    WrongType(String),

    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Persisted token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    pub tokens: u64,
    /// Milliseconds since the epoch of the last allowed take.
    pub last_refill: u64,
}

impl Bucket {
    pub fn full(capacity: u64, now_millis: u64) -> Self {
        Self {
            tokens: capacity,
            last_refill: now_millis,
        }
    }

    /// Credit whole elapsed seconds, then take one token if there is one.
    pub fn take(&mut self, rate: u64, capacity: u64, now_millis: u64) -> bool {
        let elapsed_secs = now_millis.saturating_sub(self.last_refill) / 1000;
        if elapsed_secs > 0 {
            self.tokens = self
                .tokens
                .saturating_add(elapsed_secs.saturating_mul(rate))
                .min(capacity);
        }
        if self.tokens == 0 {
            return false;
        }
        self.tokens -= 1;
        self.last_refill = now_millis;
        true
    }
}

/// Token bucket parameters for one call.
#[derive(Debug, Clone, Copy)]
pub struct BucketSpec {
    pub rate: u64,
    pub capacity: u64,
    pub ttl: Duration,
}

/// Sliding window parameters for one call.
#[derive(Debug, Clone, Copy)]
pub struct WindowSpec {
    /// Entries with a timestamp strictly below this are dropped first.
    pub min_millis: u64,
    pub threshold: u64,
    pub ttl: Duration,
}

/// Atomic limiter primitives.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Refill the bucket at `key` (full when absent) and take one token.
    async fn take_token(&self, key: &str, spec: BucketSpec, now_millis: u64) -> Result<bool, StoreError>;

    /// Prune the window at `key`; when fewer than `threshold` entries remain,
    /// record `member` at `at_millis`, reset the TTL and admit.
    /// `member` must be unique per request.
    async fn try_admit(
        &self,
        key: &str,
        spec: WindowSpec,
        at_millis: u64,
        member: &str,
    ) -> Result<bool, StoreError>;

    /// Remove keys whose TTL has passed. Stores with native expiry do nothing.
    async fn purge_expired(&self) {}
}

#[derive(Debug)]
enum Value {
    Bucket(Bucket),
    Window(VecDeque<u64>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: u64,
}

/// In-process store with TTL expiry, purged by [`CounterStore::purge_expired`].
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The live entry for `key`, holding its shard lock. An expired entry is
    /// replaced as if it never existed.
    fn live_entry(&self, key: &str, init: impl FnOnce() -> Value) -> RefMut<'_, String, Entry> {
        let now = self.clock.now_millis();
        match self.entries.entry(key.to_string()) {
            Slot::Occupied(mut occupied) => {
                if occupied.get().expires_at <= now {
                    occupied.insert(Entry {
                        value: init(),
                        expires_at: now,
                    });
                }
                occupied.into_ref()
            }
            Slot::Vacant(vacant) => vacant.insert(Entry {
                value: init(),
                expires_at: now,
            }),
        }
    }

    fn deadline(&self, ttl: Duration) -> u64 {
        self.clock.now_millis() + ttl.as_millis() as u64
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn take_token(&self, key: &str, spec: BucketSpec, now_millis: u64) -> Result<bool, StoreError> {
        let expires_at = self.deadline(spec.ttl);
        let mut entry = self.live_entry(key, || Value::Bucket(Bucket::full(spec.capacity, now_millis)));
        let allowed = match &mut entry.value {
            Value::Bucket(bucket) => bucket.take(spec.rate, spec.capacity, now_millis),
            Value::Window(_) => return Err(StoreError::WrongType(key.to_string())),
        };
        entry.expires_at = expires_at;
        Ok(allowed)
    }

    async fn try_admit(
        &self,
        key: &str,
        spec: WindowSpec,
        at_millis: u64,
        _member: &str,
    ) -> Result<bool, StoreError> {
        let expires_at = self.deadline(spec.ttl);
        let mut entry = self.live_entry(key, || Value::Window(VecDeque::new()));
        let admitted = match &mut entry.value {
            Value::Window(log) => {
                while log.front().is_some_and(|&at| at < spec.min_millis) {
                    log.pop_front();
                }
                if (log.len() as u64) >= spec.threshold {
                    false
                } else {
                    let at = log.partition_point(|&existing| existing <= at_millis);
                    log.insert(at, at_millis);
                    true
                }
            }
            Value::Bucket(_) => return Err(StoreError::WrongType(key.to_string())),
        };
        if admitted {
            entry.expires_at = expires_at;
        }
        Ok(admitted)
    }

    async fn purge_expired(&self) {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            tracing::debug!(purged, remaining = self.entries.len(), "Expired limiter keys purged");
        }
    }
}

#[cfg(feature = "redis")]
pub use self::redis_store::RedisStore;

#[cfg(feature = "redis")]
mod redis_store {
    use super::*;
    use redis::aio::ConnectionManager;
    use redis::Script;

    const TAKE_TOKEN: &str = r"
local state = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill')
local rate = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil or last == nil then
  tokens = capacity
  last = now
end
local elapsed = math.floor(math.max(now - last, 0) / 1000)
if elapsed > 0 then
  tokens = math.min(capacity, tokens + elapsed * rate)
end
local allowed = 0
if tokens >= 1 then
  tokens = tokens - 1
  last = ARGV[3]
  allowed = 1
end
redis.call('HSET', KEYS[1], 'tokens', tokens, 'last_refill', last)
redis.call('EXPIRE', KEYS[1], ARGV[4])
return allowed
";

    const TRY_ADMIT: &str = r"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1])
if redis.call('ZCARD', KEYS[1]) >= tonumber(ARGV[2]) then
  return 0
end
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[4])
redis.call('EXPIRE', KEYS[1], ARGV[5])
return 1
";

    /// Redis-backed store: hashes for buckets, sorted sets for windows.
    #[derive(Clone)]
    pub struct RedisStore {
        connection: ConnectionManager,
        take_token: Script,
        try_admit: Script,
    }

    impl RedisStore {
        pub async fn connect(url: &str) -> Result<Self, StoreError> {
            let client = redis::Client::open(url)?;
            let connection = ConnectionManager::new(client).await?;
            tracing::info!(url = %url, "Redis counter store connected");
            Ok(Self {
                connection,
                take_token: Script::new(TAKE_TOKEN),
                try_admit: Script::new(TRY_ADMIT),
            })
        }
    }

    fn ttl_secs(ttl: Duration) -> u64 {
        ttl.as_secs().max(1)
    }

    #[async_trait]
    impl CounterStore for RedisStore {
        async fn take_token(&self, key: &str, spec: BucketSpec, now_millis: u64) -> Result<bool, StoreError> {
            let mut conn = self.connection.clone();
            let allowed: i64 = self
                .take_token
                .key(key)
                .arg(spec.rate)
                .arg(spec.capacity)
                .arg(now_millis)
                .arg(ttl_secs(spec.ttl))
                .invoke_async(&mut conn)
                .await?;
            Ok(allowed == 1)
        }

        async fn try_admit(
            &self,
            key: &str,
            spec: WindowSpec,
            at_millis: u64,
            member: &str,
        ) -> Result<bool, StoreError> {
            let mut conn = self.connection.clone();
            let admitted: i64 = self
                .try_admit
                .key(key)
                .arg(spec.min_millis)
                .arg(spec.threshold)
                .arg(at_millis)
                .arg(member)
                .arg(ttl_secs(spec.ttl))
                .invoke_async(&mut conn)
                .await?;
            Ok(admitted == 1)
        }
    }
}
