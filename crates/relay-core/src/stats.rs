//! Delivery statistics.
//!
//! Optional counters bumped per delivered message, keyed by sender and room
//! (`"{source}_{uid}"` / `"{source}_{room}"`). Recording failures are logged
//! and never affect delivery.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use redis::AsyncCommands;
use tracing::warn;

use crate::error::{RelayError, Result};

/// Sink for per-delivery statistics.
#[async_trait]
pub trait StatsSink: Send + Sync {
    /// Record one delivered message: `sentences += 1`, `words += words`.
    async fn record_delivery(&self, sender_key: &str, room_key: &str, words: u64);

    /// Total sentences delivered for a sender.
    async fn sentences_for_user(&self, sender_key: &str) -> Result<u64>;

    /// Total words delivered for a sender.
    async fn words_for_user(&self, sender_key: &str) -> Result<u64>;

    /// Total sentences delivered out of a room.
    async fn sentences_for_room(&self, room_key: &str) -> Result<u64>;

    /// Total words delivered out of a room.
    async fn words_for_room(&self, room_key: &str) -> Result<u64>;

    /// All senders with recorded statistics.
    async fn known_users(&self) -> Result<Vec<String>>;
}

/// In-process statistics, for tests and store-less deployments.
#[derive(Default)]
pub struct MemoryStats {
    users: DashSet<String>,
    by_user: DashMap<String, (u64, u64)>,
    by_room: DashMap<String, (u64, u64)>,
}

impl MemoryStats {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatsSink for MemoryStats {
    async fn record_delivery(&self, sender_key: &str, room_key: &str, words: u64) {
        self.users.insert(sender_key.to_string());
        {
            let mut user = self.by_user.entry(sender_key.to_string()).or_insert((0, 0));
            user.0 += 1;
            user.1 += words;
        }
        let mut room = self.by_room.entry(room_key.to_string()).or_insert((0, 0));
        room.0 += 1;
        room.1 += words;
    }

    async fn sentences_for_user(&self, sender_key: &str) -> Result<u64> {
        Ok(self.by_user.get(sender_key).map(|e| e.0).unwrap_or(0))
    }

    async fn words_for_user(&self, sender_key: &str) -> Result<u64> {
        Ok(self.by_user.get(sender_key).map(|e| e.1).unwrap_or(0))
    }

    async fn sentences_for_room(&self, room_key: &str) -> Result<u64> {
        Ok(self.by_room.get(room_key).map(|e| e.0).unwrap_or(0))
    }

    async fn words_for_room(&self, room_key: &str) -> Result<u64> {
        Ok(self.by_room.get(room_key).map(|e| e.1).unwrap_or(0))
    }

    async fn known_users(&self) -> Result<Vec<String>> {
        Ok(self.users.iter().map(|u| u.clone()).collect())
    }
}

/// Redis-backed statistics shared across router instances.
pub struct RedisStats {
    conn: redis::aio::ConnectionManager,
    key_prefix: String,
}

impl RedisStats {
    pub fn new(conn: redis::aio::ConnectionManager, key_prefix: impl Into<String>) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.into(),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.key_prefix, suffix)
    }

    async fn get_counter(&self, suffix: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let value: Option<u64> = conn
            .get(self.key(suffix))
            .await
            .map_err(|e| RelayError::other(format!("Statistics read failed: {e}")))?;
        Ok(value.unwrap_or(0))
    }
}

#[async_trait]
impl StatsSink for RedisStats {
    async fn record_delivery(&self, sender_key: &str, room_key: &str, words: u64) {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.sadd(self.key("users"), sender_key)
            .ignore()
            .sadd(self.key("rooms"), room_key)
            .ignore()
            .incr(self.key(&format!("sentences:user:{sender_key}")), 1u64)
            .ignore()
            .incr(self.key(&format!("words:user:{sender_key}")), words)
            .ignore()
            .incr(self.key(&format!("sentences:room:{room_key}")), 1u64)
            .ignore()
            .incr(self.key(&format!("words:room:{room_key}")), words)
            .ignore();

        let result: std::result::Result<(), redis::RedisError> = pipe.query_async(&mut conn).await;
        if let Err(e) = result {
            warn!("Failed to record delivery statistics: {e}");
        }
    }

    async fn sentences_for_user(&self, sender_key: &str) -> Result<u64> {
        self.get_counter(&format!("sentences:user:{sender_key}")).await
    }

    async fn words_for_user(&self, sender_key: &str) -> Result<u64> {
        self.get_counter(&format!("words:user:{sender_key}")).await
    }

    async fn sentences_for_room(&self, room_key: &str) -> Result<u64> {
        self.get_counter(&format!("sentences:room:{room_key}")).await
    }

    async fn words_for_room(&self, room_key: &str) -> Result<u64> {
        self.get_counter(&format!("words:room:{room_key}")).await
    }

    async fn known_users(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.smembers(self.key("users"))
            .await
            .map_err(|e| RelayError::other(format!("Statistics read failed: {e}")))
    }
}
