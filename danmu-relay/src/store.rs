//! Destination store.
//!
//! Per-destination settings persisted as one JSON file. The store is read
//! once at startup to re-establish every subscription, and rewritten (via a
//! temp file) whenever the configuration layer changes a destination.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use relay_core::{DestinationId, FilterRule};

fn default_pattern() -> String {
    ".*".to_string()
}

/// A scheduled action for one destination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleEntry {
    /// Cron expression (seconds granularity)
    pub cron: String,
    /// Pre-approved router action, e.g. "reconnect"
    pub action: String,
}

/// Persisted settings for one destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationEntry {
    /// Source id the destination is bound to
    pub source: String,
    /// Room id the destination is bound to
    pub room_id: u64,
    #[serde(default = "default_pattern")]
    pub pattern: String,
    #[serde(default)]
    pub blocked_senders: HashSet<String>,
    #[serde(default)]
    pub hide_sender_name: bool,
    #[serde(default)]
    pub schedules: Vec<ScheduleEntry>,
}

impl DestinationEntry {
    /// The filter rule for this destination.
    pub fn rule(&self) -> FilterRule {
        FilterRule {
            pattern: self.pattern.clone(),
            blocked_senders: self.blocked_senders.clone(),
            hide_sender_name: self.hide_sender_name,
        }
    }
}

/// JSON-file-backed store of destination settings.
pub struct DestinationStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<DestinationId, DestinationEntry>>,
}

impl DestinationStore {
    /// Load the store; a missing file yields an empty store.
    pub async fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// All destination entries.
    pub fn all(&self) -> Vec<(DestinationId, DestinationEntry)> {
        self.entries
            .read()
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect()
    }

    /// Settings for one destination.
    pub fn get(&self, destination: DestinationId) -> Option<DestinationEntry> {
        self.entries.read().get(&destination).cloned()
    }

    /// Insert or replace a destination and persist the store.
    pub async fn set(
        &self,
        destination: DestinationId,
        entry: DestinationEntry,
    ) -> anyhow::Result<()> {
        self.entries.write().insert(destination, entry);
        self.save().await
    }

    /// Remove a destination and persist the store. Returns the removed
    /// entry, if any.
    pub async fn remove(
        &self,
        destination: DestinationId,
    ) -> anyhow::Result<Option<DestinationEntry>> {
        let removed = self.entries.write().remove(&destination);
        if removed.is_some() {
            self.save().await?;
        }
        Ok(removed)
    }

    async fn save(&self) -> anyhow::Result<()> {
        let serialized = {
            let entries = self.entries.read();
            serde_json::to_string_pretty(&*entries)?
        };
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename keeps a crash from truncating the store.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serialized).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            warn!("Failed to replace {}: {e}", self.path.display());
            return Err(e.into());
        }
        Ok(())
    }

    /// The file backing this store.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(room_id: u64) -> DestinationEntry {
        DestinationEntry {
            source: "bilibili".to_string(),
            room_id,
            pattern: "^【.*】".to_string(),
            blocked_senders: HashSet::from(["bilibili_1".to_string()]),
            hide_sender_name: false,
            schedules: vec![ScheduleEntry {
                cron: "0 0 3 * * *".to_string(),
                action: "reconnect".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn test_missing_file_yields_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = DestinationStore::load(dir.path().join("destinations.json"))
            .await
            .unwrap();
        assert!(store.all().is_empty());
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("destinations.json");

        let store = DestinationStore::load(&path).await.unwrap();
        store.set(-100123, entry(555)).await.unwrap();
        store.set(42, entry(10)).await.unwrap();

        let reloaded = DestinationStore::load(&path).await.unwrap();
        assert_eq!(reloaded.all().len(), 2);
        let loaded = reloaded.get(-100123).unwrap();
        assert_eq!(loaded.room_id, 555);
        assert_eq!(loaded.pattern, "^【.*】");
        assert!(loaded.blocked_senders.contains("bilibili_1"));
        assert_eq!(loaded.schedules.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("destinations.json");

        let store = DestinationStore::load(&path).await.unwrap();
        store.set(1, entry(555)).await.unwrap();
        assert!(store.remove(1).await.unwrap().is_some());
        assert!(store.remove(1).await.unwrap().is_none());

        let reloaded = DestinationStore::load(&path).await.unwrap();
        assert!(reloaded.all().is_empty());
    }

    #[test]
    fn test_entry_defaults() {
        let json = r#"{"source": "douyu", "room_id": 10}"#;
        let entry: DestinationEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.pattern, ".*");
        assert!(entry.blocked_senders.is_empty());
        assert!(!entry.hide_sender_name);
        assert!(entry.schedules.is_empty());
    }
}
