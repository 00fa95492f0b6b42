//! Duplicate-event suppression.
//!
//! Near-identical repeats (same destination, sender and text within one
//! wall-clock window) are dropped silently. Seen-keys live in a TTL cache so
//! the working set stays bounded; eviction is purely time-based and
//! independent of whether the original delivery succeeded.

use std::time::Duration;

use chrono::Utc;

use danmu::DanmuEvent;

use crate::subscription::DestinationId;

/// Dedup tuning knobs.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Window within which a repeat is considered a duplicate
    pub window: Duration,
    /// How long seen-keys are retained before eviction
    pub retention: Duration,
    /// Upper bound on tracked keys
    pub max_entries: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30),
            retention: Duration::from_secs(600),
            max_entries: 100_000,
        }
    }
}

type DedupKey = (DestinationId, u64, String, i64);

/// Time-bounded cache of recently delivered `(destination, sender, text)`
/// combinations.
pub struct DedupCache {
    seen: moka::sync::Cache<DedupKey, ()>,
    window_secs: i64,
}

impl DedupCache {
    pub fn new(config: DedupConfig) -> Self {
        let seen = moka::sync::Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(config.retention)
            .build();
        Self {
            seen,
            window_secs: config.window.as_secs().max(1) as i64,
        }
    }

    /// Returns true if this event is a repeat for the destination within the
    /// current window; records it otherwise.
    pub fn check_and_record(&self, destination: DestinationId, event: &DanmuEvent) -> bool {
        self.check_and_record_at(destination, event, Utc::now().timestamp())
    }

    fn check_and_record_at(
        &self,
        destination: DestinationId,
        event: &DanmuEvent,
        now: i64,
    ) -> bool {
        let bucket = now.div_euclid(self.window_secs);
        let key = (
            destination,
            event.sender.uid,
            normalize_text(&event.text),
            bucket,
        );
        if self.seen.contains_key(&key) {
            return true;
        }
        self.seen.insert(key, ());
        false
    }
}

/// Normalize text for duplicate comparison.
fn normalize_text(text: &str) -> String {
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use danmu::DanmuSender;

    fn event(uid: u64, text: &str) -> DanmuEvent {
        DanmuEvent::chat(
            "bilibili",
            555,
            DanmuSender {
                uid,
                ..Default::default()
            },
            text,
            0,
        )
    }

    fn cache() -> DedupCache {
        DedupCache::new(DedupConfig::default())
    }

    #[test]
    fn test_first_occurrence_passes_repeat_drops() {
        let cache = cache();
        let e = event(1, "hello");

        assert!(!cache.check_and_record_at(10, &e, 1000));
        assert!(cache.check_and_record_at(10, &e, 1005));
    }

    #[test]
    fn test_new_window_passes_again() {
        let cache = cache();
        let e = event(1, "hello");

        assert!(!cache.check_and_record_at(10, &e, 1000));
        // 30s window: 1000 and 1031 land in different buckets.
        assert!(!cache.check_and_record_at(10, &e, 1031));
    }

    #[test]
    fn test_destinations_are_independent() {
        let cache = cache();
        let e = event(1, "hello");

        assert!(!cache.check_and_record_at(10, &e, 1000));
        assert!(!cache.check_and_record_at(11, &e, 1000));
    }

    #[test]
    fn test_senders_and_text_are_discriminated() {
        let cache = cache();

        assert!(!cache.check_and_record_at(10, &event(1, "hello"), 1000));
        assert!(!cache.check_and_record_at(10, &event(2, "hello"), 1000));
        assert!(!cache.check_and_record_at(10, &event(1, "other"), 1000));
    }

    #[test]
    fn test_whitespace_normalized() {
        let cache = cache();

        assert!(!cache.check_and_record_at(10, &event(1, "hello"), 1000));
        assert!(cache.check_and_record_at(10, &event(1, "  hello  "), 1000));
    }
}
