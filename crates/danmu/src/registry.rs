//! Registry of configured danmaku sources.

use std::sync::Arc;

use crate::source::DanmuSource;

/// Registry of configured danmaku sources.
#[derive(Default)]
pub struct SourceRegistry {
    sources: Vec<Arc<dyn DanmuSource>>,
}

impl SourceRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    /// Register a source.
    pub fn register(&mut self, source: Arc<dyn DanmuSource>) {
        self.sources.push(source);
    }

    /// Get the source with the given id.
    pub fn get(&self, source_id: &str) -> Option<Arc<dyn DanmuSource>> {
        self.sources
            .iter()
            .find(|s| s.source_id().eq_ignore_ascii_case(source_id))
            .cloned()
    }

    /// Whether a source with the given id is registered.
    pub fn contains(&self, source_id: &str) -> bool {
        self.get(source_id).is_some()
    }

    /// List all registered source ids.
    pub fn source_ids(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.source_id()).collect()
    }
}
