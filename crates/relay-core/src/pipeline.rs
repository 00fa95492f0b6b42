//! Dispatch pipeline.
//!
//! The fan-out point: one upstream event may produce zero, one, or many
//! outbound deliveries, one per matching, non-filtered, non-duplicated,
//! rate-admitted destination. Failures local to one destination never abort
//! processing of the same event for the others.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHasher;
use tracing::{debug, trace, warn};

use danmu::{DanmuEvent, DanmuEventType};

use crate::dedup::DedupCache;
use crate::error::Result;
use crate::limiter::RateLimiter;
use crate::multiplexer::EventSink;
use crate::stats::StatsSink;
use crate::subscription::{DestinationId, RoomKey, Subscription, SubscriptionRegistry};

/// Display name substituted when the platform supplies neither a sender id
/// nor a usable display name.
const ANONYMOUS_NAME: &str = "anonymous";

/// Options forwarded to the delivery boundary alongside the formatted text.
#[derive(Debug, Clone, Default)]
pub struct DeliveryOptions {
    pub hide_sender_name: bool,
}

/// The delivery boundary: actually sends a formatted message to a
/// destination. Returns an opaque message handle.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(
        &self,
        destination: DestinationId,
        text: &str,
        options: &DeliveryOptions,
    ) -> Result<String>;
}

/// Per-event fan-out: filter, dedup and rate-limit each destination, then
/// hand the surviving deliveries to the delivery boundary.
pub struct DispatchPipeline {
    registry: Arc<SubscriptionRegistry>,
    dedup: DedupCache,
    limiter: Arc<RateLimiter>,
    delivery: Arc<dyn DeliverySink>,
    stats: Option<Arc<dyn StatsSink>>,
}

impl DispatchPipeline {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        dedup: DedupCache,
        limiter: Arc<RateLimiter>,
        delivery: Arc<dyn DeliverySink>,
        stats: Option<Arc<dyn StatsSink>>,
    ) -> Self {
        Self {
            registry,
            dedup,
            limiter,
            delivery,
            stats,
        }
    }

    /// Process one canonical event from any adapter.
    pub async fn dispatch(&self, mut event: DanmuEvent) {
        if event.source_id.is_empty() || event.text.is_empty() {
            warn!("Dropping malformed event: {event:?}");
            return;
        }
        normalize_sender(&mut event);

        let key = RoomKey::new(&event.source_id, event.room_id);
        let subscriptions = self.registry.match_destinations(&key);
        for subscription in subscriptions {
            if let Err(e) = self.deliver_to(&subscription, &event).await {
                warn!(
                    "Delivery to destination {} failed: {e}",
                    subscription.destination_id
                );
            }
        }
    }

    async fn deliver_to(&self, subscription: &Subscription, event: &DanmuEvent) -> Result<()> {
        let destination = subscription.destination_id;
        if !subscription.matches(event) {
            return Ok(());
        }
        if self.dedup.check_and_record(destination, event) {
            trace!("Duplicate event for destination {destination} dropped");
            return Ok(());
        }
        if !self.limiter.admit(destination).await {
            // Drop, don't queue: the pipeline stays stateless and bounded.
            debug!("Event for destination {destination} dropped by rate limit");
            return Ok(());
        }

        let text = format_message(event, subscription.hide_sender_name);
        let options = DeliveryOptions {
            hide_sender_name: subscription.hide_sender_name,
        };
        self.delivery.deliver(destination, &text, &options).await?;

        if let Some(stats) = &self.stats {
            stats
                .record_delivery(
                    &event.sender_key(),
                    &event.room_key(),
                    event.text.chars().count() as u64,
                )
                .await;
        }
        Ok(())
    }
}

#[async_trait]
impl EventSink for DispatchPipeline {
    async fn on_event(&self, event: DanmuEvent) {
        self.dispatch(event).await;
    }
}

/// Give anonymous senders a stable pseudo-identity so block-lists and
/// statistics still apply to them: a deterministic hash of the display name,
/// never zero.
pub fn pseudo_uid(username: &str) -> u64 {
    let name = if username.trim().is_empty() {
        ANONYMOUS_NAME
    } else {
        username
    };
    let mut hasher = FxHasher::default();
    name.hash(&mut hasher);
    hasher.finish().max(1)
}

fn normalize_sender(event: &mut DanmuEvent) {
    if event.sender.uid == 0 {
        event.sender.uid = pseudo_uid(&event.sender.username);
    }
}

/// Render the outbound message: a sender hyperlink prefix (unless hidden)
/// followed by the event text, HTML-escaped for the chat API.
pub fn format_message(event: &DanmuEvent, hide_sender_name: bool) -> String {
    let mut body = escape_html(&event.text);
    if event.event_type == DanmuEventType::SuperChat
        && let Some(price) = event.price
    {
        body = format!("[¥{price}] {body}");
    }

    if hide_sender_name {
        return body;
    }

    // The sender key is appended to the profile URL fragment so a forwarded
    // message can be traced back to the platform account.
    let href = format!("{}#{}", event.sender.url, event.sender_key());
    let name = if event.sender.username.is_empty() {
        ANONYMOUS_NAME
    } else {
        &event.sender.username
    };
    format!(
        "<a href=\"{}\">{}</a>：{}",
        escape_html(&href),
        escape_html(name),
        body
    )
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use danmu::DanmuSender;

    fn event(uid: u64, username: &str, text: &str) -> DanmuEvent {
        DanmuEvent::chat(
            "bilibili",
            555,
            DanmuSender {
                uid,
                username: username.to_string(),
                url: "https://space.bilibili.com/0".to_string(),
                medal: None,
            },
            text,
            0,
        )
    }

    #[test]
    fn test_pseudo_uid_deterministic_and_nonzero() {
        assert_eq!(pseudo_uid("alice"), pseudo_uid("alice"));
        assert_ne!(pseudo_uid("alice"), pseudo_uid("bob"));
        assert_ne!(pseudo_uid("alice"), 0);

        // Empty and whitespace-only names share the anonymous fallback.
        assert_eq!(pseudo_uid(""), pseudo_uid("  "));
        assert_ne!(pseudo_uid(""), 0);
    }

    #[test]
    fn test_normalize_keeps_real_uid() {
        let mut e = event(42, "alice", "hi");
        normalize_sender(&mut e);
        assert_eq!(e.sender.uid, 42);
    }

    #[test]
    fn test_normalize_substitutes_pseudo_uid() {
        let mut a = event(0, "", "hi");
        let mut b = event(0, "", "hi");
        normalize_sender(&mut a);
        normalize_sender(&mut b);
        assert_ne!(a.sender.uid, 0);
        assert_eq!(a.sender.uid, b.sender.uid);
    }

    #[test]
    fn test_format_message_with_sender_link() {
        let e = event(42, "alice", "hello");
        let text = format_message(&e, false);
        assert_eq!(
            text,
            "<a href=\"https://space.bilibili.com/0#bilibili_42\">alice</a>：hello"
        );
    }

    #[test]
    fn test_format_message_hidden_sender() {
        let e = event(42, "alice", "hello");
        assert_eq!(format_message(&e, true), "hello");
    }

    #[test]
    fn test_format_message_escapes_html() {
        let e = event(42, "<script>", "a & b");
        let text = format_message(&e, false);
        assert!(text.contains("&lt;script&gt;"));
        assert!(text.contains("a &amp; b"));
    }

    #[test]
    fn test_format_super_chat_includes_price() {
        let mut e = event(42, "alice", "big spender");
        e.event_type = DanmuEventType::SuperChat;
        e.price = Some(30.0);
        assert_eq!(format_message(&e, true), "[¥30] big spender");
    }
}
