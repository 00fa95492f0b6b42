//! Delivery-rate admission control.
//!
//! Two independent sliding windows gate every delivery: a global ceiling
//! shared by all destinations and a per-destination ceiling. Counter state
//! lives behind [`CounterStore`] so it can sit in a shared external store
//! (Redis) and stay consistent across router instances. When the store is
//! unreachable the limiter fails open: delivering messages matters more than
//! strictly enforcing the rate, and the outage is logged once rather than
//! once per event.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::error::{RelayError, Result};
use crate::subscription::DestinationId;

/// A shared sliding-window hit counter.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Record a hit against `key` and report whether the key stays within
    /// `max` hits per `window`. An error means the store is unreachable.
    async fn hit(&self, key: &str, max: u32, window: Duration) -> Result<bool>;
}

/// Limiter ceilings.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Whether admission control is enforced at all
    pub enabled: bool,
    /// Global ceiling across all destinations
    pub global_max: u32,
    pub global_window: Duration,
    /// Per-destination ceiling
    pub per_destination_max: u32,
    pub per_destination_window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            global_max: 30,
            global_window: Duration::from_secs(1),
            per_destination_max: 20,
            per_destination_window: Duration::from_secs(60),
        }
    }
}

/// Sliding-window rate limiter over a [`CounterStore`].
pub struct RateLimiter {
    store: Box<dyn CounterStore>,
    config: RateLimiterConfig,
    outage: AtomicBool,
}

impl RateLimiter {
    pub fn new(store: Box<dyn CounterStore>, config: RateLimiterConfig) -> Self {
        Self {
            store,
            config,
            outage: AtomicBool::new(false),
        }
    }

    /// Whether a delivery to the destination is admitted right now. Both the
    /// global and the per-destination window must have capacity.
    pub async fn admit(&self, destination: DestinationId) -> bool {
        if !self.config.enabled {
            return true;
        }

        let global = self
            .hit("global", self.config.global_max, self.config.global_window)
            .await;
        let per_destination = self
            .hit(
                &format!("chat:{destination}"),
                self.config.per_destination_max,
                self.config.per_destination_window,
            )
            .await;

        let admitted = global && per_destination;
        if !admitted {
            debug!("Delivery rate limit exceeded for destination {destination}");
        }
        admitted
    }

    async fn hit(&self, key: &str, max: u32, window: Duration) -> bool {
        match self.store.hit(key, max, window).await {
            Ok(within) => {
                if self.outage.swap(false, Ordering::SeqCst) {
                    info!("Rate limiter counter store recovered");
                }
                within
            }
            Err(e) => {
                // Fail open; log the outage once, not per event.
                if !self.outage.swap(true, Ordering::SeqCst) {
                    error!("Counter store unreachable, admitting deliveries unchecked: {e}");
                }
                true
            }
        }
    }
}

/// In-process counter store. Backs tests and deployments without a shared
/// store; limits are per-instance only.
#[derive(Default)]
pub struct MemoryCounterStore {
    windows: DashMap<String, Mutex<VecDeque<u64>>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn hit(&self, key: &str, max: u32, window: Duration) -> Result<bool> {
        let now = now_millis();
        let cutoff = now.saturating_sub(window.as_millis() as u64);

        let entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut hits = entry.lock();
        while hits.front().is_some_and(|t| *t < cutoff) {
            hits.pop_front();
        }
        if hits.len() < max as usize {
            hits.push_back(now);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// Redis-backed counter store: a sorted set per key, trimmed, extended and
/// counted atomically via a Lua script so concurrent hits from multiple
/// router instances cannot race.
pub struct RedisCounterStore {
    conn: redis::aio::ConnectionManager,
    key_prefix: String,
}

impl RedisCounterStore {
    pub fn new(conn: redis::aio::ConnectionManager, key_prefix: impl Into<String>) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.into(),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn hit(&self, key: &str, max: u32, window: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let redis_key = format!("{}rate:{}", self.key_prefix, key);
        let now = now_millis();
        let window_start = now.saturating_sub(window.as_millis() as u64);
        let expire_seconds = (window.as_secs() + 1) as i64;

        let script = redis::Script::new(
            r"
            redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, ARGV[1])
            redis.call('ZADD', KEYS[1], ARGV[2], ARGV[2])
            local count = redis.call('ZCARD', KEYS[1])
            redis.call('EXPIRE', KEYS[1], ARGV[3])
            return count
            ",
        );

        let count: u32 = script
            .key(&redis_key)
            .arg(window_start)
            .arg(now)
            .arg(expire_seconds)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RelayError::LimiterUnavailable(e.to_string()))?;

        Ok(count <= max)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingStore;

    #[async_trait]
    impl CounterStore for FailingStore {
        async fn hit(&self, _key: &str, _max: u32, _window: Duration) -> Result<bool> {
            Err(RelayError::LimiterUnavailable("store down".to_string()))
        }
    }

    fn limiter(config: RateLimiterConfig) -> RateLimiter {
        RateLimiter::new(Box::new(MemoryCounterStore::new()), config)
    }

    #[tokio::test]
    async fn test_memory_store_sliding_window() {
        let store = MemoryCounterStore::new();
        for _ in 0..5 {
            assert!(store.hit("k", 5, Duration::from_secs(60)).await.unwrap());
        }
        assert!(!store.hit("k", 5, Duration::from_secs(60)).await.unwrap());
        // Other keys have independent windows.
        assert!(store.hit("k2", 5, Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_per_destination_ceiling() {
        let limiter = limiter(RateLimiterConfig {
            global_max: 1000,
            per_destination_max: 3,
            ..Default::default()
        });

        for _ in 0..3 {
            assert!(limiter.admit(1).await);
        }
        assert!(!limiter.admit(1).await);
        // A different destination still has capacity.
        assert!(limiter.admit(2).await);
    }

    #[tokio::test]
    async fn test_global_ceiling_blocks_despite_destination_capacity() {
        let limiter = limiter(RateLimiterConfig {
            global_max: 2,
            per_destination_max: 1000,
            ..Default::default()
        });

        assert!(limiter.admit(1).await);
        assert!(limiter.admit(2).await);
        // Destination 3 has not sent anything, but the global window is full.
        assert!(!limiter.admit(3).await);
    }

    #[tokio::test]
    async fn test_disabled_limiter_admits_everything() {
        let limiter = limiter(RateLimiterConfig {
            enabled: false,
            global_max: 0,
            per_destination_max: 0,
            ..Default::default()
        });
        assert!(limiter.admit(1).await);
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_open() {
        let limiter = RateLimiter::new(Box::new(FailingStore), RateLimiterConfig::default());
        assert!(limiter.admit(1).await);
        assert!(limiter.admit(1).await);
        assert!(limiter.outage.load(Ordering::SeqCst));
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_redis_store_basic() {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let conn = redis::aio::ConnectionManager::new(client).await.unwrap();
        let store = RedisCounterStore::new(conn, "relay-test:");

        let key = format!("t:{}", now_millis());
        for _ in 0..5 {
            assert!(store.hit(&key, 5, Duration::from_secs(2)).await.unwrap());
        }
        assert!(!store.hit(&key, 5, Duration::from_secs(2)).await.unwrap());

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(store.hit(&key, 5, Duration::from_secs(2)).await.unwrap());
    }
}
