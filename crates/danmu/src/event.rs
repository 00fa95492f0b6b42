//! Canonical danmaku event types.
//!
//! The serde representation matches the JSON payload emitted by the
//! danmaku-source servers, so events decode straight off the wire. The
//! `source_id` field is not part of the payload; the source client stamps it
//! after decoding.

use serde::{Deserialize, Serialize};

/// Type of danmaku event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DanmuEventType {
    /// Regular chat message
    #[serde(rename = "danmaku")]
    Chat,
    /// Gift/donation
    Gift,
    /// Viewer entered the room
    Enter,
    /// Viewer liked the stream
    Like,
    /// Super chat (paid highlighted message)
    #[serde(rename = "sc")]
    SuperChat,
    /// Guard/membership purchase
    Guard,
}

impl Default for DanmuEventType {
    fn default() -> Self {
        Self::Chat
    }
}

/// The sender of a danmaku event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DanmuSender {
    /// Platform user id; `0` when the platform did not supply one
    #[serde(default)]
    pub uid: u64,
    /// Display name
    #[serde(default)]
    pub username: String,
    /// Profile URL on the platform
    #[serde(default)]
    pub url: String,
    /// Fan medal / badge text, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medal: Option<String>,
}

/// A single canonical danmaku event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DanmuEvent {
    /// Source platform id; stamped by the source client, not on the wire
    #[serde(default)]
    pub source_id: String,
    /// Room the event originated from
    #[serde(rename = "roomId")]
    pub room_id: u64,
    /// Event classification
    #[serde(rename = "type", default)]
    pub event_type: DanmuEventType,
    /// Sender info
    pub sender: DanmuSender,
    /// Event text
    #[serde(default)]
    pub text: String,
    /// Unix timestamp in seconds
    #[serde(default)]
    pub timestamp: i64,
    /// Price attached to paid events (super chats, gifts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
}

impl DanmuEvent {
    /// Create a new chat event.
    pub fn chat(
        source_id: impl Into<String>,
        room_id: u64,
        sender: DanmuSender,
        text: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            room_id,
            event_type: DanmuEventType::Chat,
            sender,
            text: text.into(),
            timestamp,
            price: None,
        }
    }

    /// Key identifying the sender across sources: `"{source}_{uid}"`.
    pub fn sender_key(&self) -> String {
        format!("{}_{}", self.source_id, self.sender.uid)
    }

    /// Key identifying the room across sources: `"{source}_{room}"`.
    pub fn room_key(&self) -> String {
        format!("{}_{}", self.source_id, self.room_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_wire_payload() {
        let json = r#"{
            "sender": {"uid": 123, "username": "alice", "url": "https://space.bilibili.com/123"},
            "text": "hello",
            "timestamp": 1700000000,
            "roomId": 555,
            "type": "danmaku"
        }"#;

        let event: DanmuEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.room_id, 555);
        assert_eq!(event.event_type, DanmuEventType::Chat);
        assert_eq!(event.sender.uid, 123);
        assert_eq!(event.sender.username, "alice");
        assert_eq!(event.text, "hello");
        assert!(event.source_id.is_empty());
        assert!(event.price.is_none());
    }

    #[test]
    fn test_decode_super_chat() {
        let json = r#"{
            "sender": {"uid": 9, "username": "bob", "url": ""},
            "text": "big spender",
            "timestamp": 1700000001,
            "roomId": 10,
            "type": "sc",
            "price": 30.0
        }"#;

        let event: DanmuEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.event_type, DanmuEventType::SuperChat);
        assert_eq!(event.price, Some(30.0));
    }

    #[test]
    fn test_decode_anonymous_sender() {
        // Platforms sometimes omit the uid entirely.
        let json = r#"{
            "sender": {"username": "anon", "url": ""},
            "text": "hi",
            "timestamp": 0,
            "roomId": 1,
            "type": "danmaku"
        }"#;

        let event: DanmuEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.sender.uid, 0);
    }

    #[test]
    fn test_sender_and_room_keys() {
        let mut event = DanmuEvent::chat(
            "bilibili",
            555,
            DanmuSender {
                uid: 123,
                ..Default::default()
            },
            "hi",
            0,
        );
        assert_eq!(event.sender_key(), "bilibili_123");
        assert_eq!(event.room_key(), "bilibili_555");

        event.source_id = "douyu".to_string();
        assert_eq!(event.sender_key(), "douyu_123");
    }
}
