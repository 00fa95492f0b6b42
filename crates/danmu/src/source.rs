//! Danmu source trait and connection types.
//!
//! Defines the interface the relay core uses to drive platform-specific
//! source adapters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::event::DanmuEvent;

/// Connection handle for an active danmaku stream.
#[derive(Debug)]
pub struct SourceConnection {
    /// Unique connection ID
    pub id: String,
    /// Source platform identifier
    pub source_id: String,
    /// Room ID
    pub room_id: u64,
    /// Whether the connection is active
    pub is_connected: bool,
    /// Connection start time
    pub connected_at: DateTime<Utc>,
    /// Number of reconnection attempts
    pub reconnect_count: u32,
}

impl SourceConnection {
    /// Create a new connection handle.
    pub fn new(id: impl Into<String>, source_id: impl Into<String>, room_id: u64) -> Self {
        Self {
            id: id.into(),
            source_id: source_id.into(),
            room_id,
            is_connected: false,
            connected_at: Utc::now(),
            reconnect_count: 0,
        }
    }

    /// Mark the connection as connected.
    pub fn set_connected(&mut self) {
        self.is_connected = true;
        self.connected_at = Utc::now();
    }

    /// Mark the connection as disconnected.
    pub fn set_disconnected(&mut self) {
        self.is_connected = false;
    }

    /// Increment reconnect count.
    pub fn increment_reconnect(&mut self) {
        self.reconnect_count += 1;
    }
}

/// Trait for platform-specific danmaku sources.
///
/// An implementation is solely responsible for wire-level decoding and must
/// emit only canonical [`DanmuEvent`]s with `source_id` stamped.
#[async_trait]
pub trait DanmuSource: Send + Sync {
    /// Get the source id this adapter handles.
    fn source_id(&self) -> &str;

    /// Connect to the danmaku stream for a room.
    async fn connect(&self, room_id: u64) -> Result<SourceConnection>;

    /// Disconnect from the danmaku stream.
    async fn disconnect(&self, connection: &mut SourceConnection) -> Result<()>;

    /// Receive the next danmaku event.
    /// Returns None if no event is currently available.
    async fn receive(&self, connection: &SourceConnection) -> Result<Option<DanmuEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_connection() {
        let mut conn = SourceConnection::new("conn1", "bilibili", 12345);

        assert!(!conn.is_connected);
        assert_eq!(conn.reconnect_count, 0);

        conn.set_connected();
        assert!(conn.is_connected);

        conn.set_disconnected();
        assert!(!conn.is_connected);

        conn.increment_reconnect();
        assert_eq!(conn.reconnect_count, 1);
    }
}
