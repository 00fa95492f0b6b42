//! Subscription rules and the destination registry.
//!
//! A subscription binds one destination to one `(source, room)` key together
//! with its filter rule. Patterns are compiled once here, at subscribe time;
//! an invalid pattern is rejected before anything is mutated.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};

use danmu::DanmuEvent;

use crate::error::{RelayError, Result};

/// Identifier of a downstream chat destination.
pub type DestinationId = i64;

/// Identifies one upstream connection: `(source, room)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomKey {
    pub source_id: String,
    pub room_id: u64,
}

impl RoomKey {
    pub fn new(source_id: impl Into<String>, room_id: u64) -> Self {
        Self {
            source_id: source_id.into(),
            room_id,
        }
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.source_id, self.room_id)
    }
}

/// The filter rule supplied by the configuration layer.
#[derive(Debug, Clone)]
pub struct FilterRule {
    /// Regular expression the event text must match
    pub pattern: String,
    /// Blocked senders as `"{source}_{uid}"` keys
    pub blocked_senders: HashSet<String>,
    /// Omit the sender hyperlink when formatting
    pub hide_sender_name: bool,
}

impl Default for FilterRule {
    fn default() -> Self {
        Self {
            pattern: ".*".to_string(),
            blocked_senders: HashSet::new(),
            hide_sender_name: false,
        }
    }
}

/// A destination's compiled binding to a room.
#[derive(Debug)]
pub struct Subscription {
    pub destination_id: DestinationId,
    pub key: RoomKey,
    pattern: Regex,
    pub blocked_senders: HashSet<String>,
    pub hide_sender_name: bool,
}

impl Subscription {
    /// Compile a rule into a subscription. Fails with a config error if the
    /// pattern is not a valid regular expression.
    pub fn compile(destination_id: DestinationId, key: RoomKey, rule: FilterRule) -> Result<Self> {
        let pattern = Regex::new(&rule.pattern).map_err(|e| {
            RelayError::config(format!("Invalid pattern {:?}: {e}", rule.pattern))
        })?;
        Ok(Self {
            destination_id,
            key,
            pattern,
            blocked_senders: rule.blocked_senders,
            hide_sender_name: rule.hide_sender_name,
        })
    }

    /// The source pattern string.
    pub fn pattern_str(&self) -> &str {
        self.pattern.as_str()
    }

    /// Evaluate the per-destination filter: blocked senders are rejected,
    /// everything else is accepted iff the pattern matches the text.
    pub fn matches(&self, event: &DanmuEvent) -> bool {
        if self.blocked_senders.contains(&event.sender_key()) {
            return false;
        }
        self.pattern.is_match(&event.text)
    }
}

/// Outcome of binding a destination in the registry.
#[derive(Debug, PartialEq, Eq)]
pub enum BindOutcome {
    /// The destination had no previous binding.
    New,
    /// The destination was bound to a different key; that key was released
    /// from the index and must be released from the multiplexer.
    Rebound { released: RoomKey },
    /// Same key as before; only the rule was replaced.
    Updated,
}

#[derive(Default)]
struct Inner {
    by_destination: FxHashMap<DestinationId, Arc<Subscription>>,
    by_key: FxHashMap<RoomKey, FxHashSet<DestinationId>>,
}

/// Registry mapping destinations to their subscriptions and rooms to their
/// subscribed destinations.
///
/// Reads are concurrent; updates swap the binding atomically so a dispatch
/// worker sees either the old or the new state, never a partial one.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<Inner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a destination's subscription.
    pub fn bind(&self, subscription: Subscription) -> BindOutcome {
        let destination = subscription.destination_id;
        let key = subscription.key.clone();
        let mut inner = self.inner.write();

        let previous = inner
            .by_destination
            .insert(destination, Arc::new(subscription));
        inner.by_key.entry(key.clone()).or_default().insert(destination);

        match previous {
            None => BindOutcome::New,
            Some(old) if old.key == key => BindOutcome::Updated,
            Some(old) => {
                let released = old.key.clone();
                if let Some(set) = inner.by_key.get_mut(&released) {
                    set.remove(&destination);
                    if set.is_empty() {
                        inner.by_key.remove(&released);
                    }
                }
                BindOutcome::Rebound { released }
            }
        }
    }

    /// Remove a destination's subscription, returning the key it was bound
    /// to. Returns None (and changes nothing) if the destination was not
    /// subscribed.
    pub fn unbind(&self, destination: DestinationId) -> Option<RoomKey> {
        let mut inner = self.inner.write();
        let subscription = inner.by_destination.remove(&destination)?;
        let key = subscription.key.clone();
        if let Some(set) = inner.by_key.get_mut(&key) {
            set.remove(&destination);
            if set.is_empty() {
                inner.by_key.remove(&key);
            }
        }
        Some(key)
    }

    /// Consistent point-in-time snapshot of the subscriptions bound to a key.
    pub fn match_destinations(&self, key: &RoomKey) -> Vec<Arc<Subscription>> {
        let inner = self.inner.read();
        let Some(destinations) = inner.by_key.get(key) else {
            return Vec::new();
        };
        destinations
            .iter()
            .filter_map(|d| inner.by_destination.get(d).cloned())
            .collect()
    }

    /// The subscription of a single destination, if bound.
    pub fn get(&self, destination: DestinationId) -> Option<Arc<Subscription>> {
        self.inner.read().by_destination.get(&destination).cloned()
    }

    /// The key a destination is bound to, if any.
    pub fn key_for(&self, destination: DestinationId) -> Option<RoomKey> {
        self.inner
            .read()
            .by_destination
            .get(&destination)
            .map(|s| s.key.clone())
    }

    /// Number of destinations bound to a key.
    pub fn destination_count(&self, key: &RoomKey) -> usize {
        self.inner
            .read()
            .by_key
            .get(key)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    /// All destinations currently bound, with their keys.
    pub fn bindings(&self) -> Vec<(DestinationId, RoomKey)> {
        self.inner
            .read()
            .by_destination
            .iter()
            .map(|(d, s)| (*d, s.key.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use danmu::DanmuSender;

    fn event(source: &str, room: u64, uid: u64, text: &str) -> DanmuEvent {
        DanmuEvent::chat(
            source,
            room,
            DanmuSender {
                uid,
                username: "user".to_string(),
                url: String::new(),
                medal: None,
            },
            text,
            0,
        )
    }

    fn rule(pattern: &str) -> FilterRule {
        FilterRule {
            pattern: pattern.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_compile_rejects_invalid_pattern() {
        let result = Subscription::compile(1, RoomKey::new("bilibili", 1), rule("[unclosed"));
        assert!(matches!(result, Err(RelayError::Config(_))));
    }

    #[test]
    fn test_matches_pattern() {
        let sub = Subscription::compile(1, RoomKey::new("bilibili", 1), rule("^【.*】")).unwrap();

        assert!(sub.matches(&event("bilibili", 1, 5, "【翻译】hello")));
        assert!(!sub.matches(&event("bilibili", 1, 5, "plain chat")));
    }

    #[test]
    fn test_matches_rejects_blocked_sender() {
        let mut rule = rule(".*");
        rule.blocked_senders.insert("bilibili_123".to_string());
        let sub = Subscription::compile(1, RoomKey::new("bilibili", 1), rule).unwrap();

        assert!(!sub.matches(&event("bilibili", 1, 123, "anything")));
        // Same uid on another source is a different sender.
        assert!(sub.matches(&event("douyu", 1, 123, "anything")));
        assert!(sub.matches(&event("bilibili", 1, 124, "anything")));
    }

    #[test]
    fn test_bind_outcomes() {
        let registry = SubscriptionRegistry::new();
        let key = RoomKey::new("bilibili", 555);

        let outcome = registry.bind(
            Subscription::compile(1, key.clone(), FilterRule::default()).unwrap(),
        );
        assert_eq!(outcome, BindOutcome::New);

        // Same key, new rule.
        let outcome = registry.bind(Subscription::compile(1, key.clone(), rule("^a")).unwrap());
        assert_eq!(outcome, BindOutcome::Updated);
        assert_eq!(registry.get(1).unwrap().pattern_str(), "^a");

        // Different key releases the old one.
        let other = RoomKey::new("douyu", 10);
        let outcome =
            registry.bind(Subscription::compile(1, other.clone(), FilterRule::default()).unwrap());
        assert_eq!(outcome, BindOutcome::Rebound { released: key.clone() });
        assert_eq!(registry.destination_count(&key), 0);
        assert_eq!(registry.destination_count(&other), 1);
    }

    #[test]
    fn test_unbind() {
        let registry = SubscriptionRegistry::new();
        let key = RoomKey::new("bilibili", 555);
        registry.bind(Subscription::compile(1, key.clone(), FilterRule::default()).unwrap());

        assert_eq!(registry.unbind(1), Some(key.clone()));
        assert_eq!(registry.destination_count(&key), 0);
        // Unbinding again is a no-op.
        assert_eq!(registry.unbind(1), None);
    }

    #[test]
    fn test_match_destinations_snapshot() {
        let registry = SubscriptionRegistry::new();
        let key = RoomKey::new("bilibili", 555);
        for destination in 1..=3 {
            registry.bind(
                Subscription::compile(destination, key.clone(), FilterRule::default()).unwrap(),
            );
        }

        let snapshot = registry.match_destinations(&key);
        assert_eq!(snapshot.len(), 3);

        registry.unbind(2);
        // The old snapshot is untouched; a fresh one reflects the removal.
        assert_eq!(snapshot.len(), 3);
        assert_eq!(registry.match_destinations(&key).len(), 2);
    }
}
