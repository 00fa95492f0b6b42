//! Application configuration.
//!
//! Loaded from a JSON file; secrets can be supplied (or overridden) through
//! environment variables so tokens never have to live in the config file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use relay_core::{DedupConfig, MultiplexerConfig, RateLimiterConfig, RouterConfig};

/// Environment variable overriding `bot_token`.
pub const ENV_BOT_TOKEN: &str = "RELAY_BOT_TOKEN";

/// One upstream danmaku-source server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source id, e.g. "bilibili"
    pub id: String,
    /// WebSocket endpoint, e.g. "ws://localhost:8001"
    pub endpoint: String,
    /// Shared secret sent as the `Authorization` header
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// Rate limiter section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub enabled: bool,
    /// Redis URL for the shared counter store; in-process counters when unset
    pub redis_url: Option<String>,
    pub global_max: u32,
    pub global_window_secs: u64,
    pub per_destination_max: u32,
    pub per_destination_window_secs: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            enabled: true,
            redis_url: None,
            global_max: 30,
            global_window_secs: 1,
            per_destination_max: 20,
            per_destination_window_secs: 60,
        }
    }
}

/// Statistics section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsSection {
    pub enabled: bool,
    /// Redis URL for shared counters; in-process counters when unset
    pub redis_url: Option<String>,
}

/// Dedup section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSection {
    pub window_secs: u64,
    pub retention_secs: u64,
}

impl Default for DedupSection {
    fn default() -> Self {
        Self {
            window_secs: 30,
            retention_secs: 600,
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory holding the destination store
    pub data_dir: PathBuf,
    /// Log file directory; console-only logging when unset
    pub logs_dir: Option<PathBuf>,
    /// Chat API bot token; overridable via `RELAY_BOT_TOKEN`
    pub bot_token: String,
    /// Chat API base URL
    pub api_base: String,
    /// Upstream danmaku-source servers
    pub sources: Vec<SourceConfig>,
    /// Upstream connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Delay between keys during a batch reconnect, in seconds
    pub batch_reconnect_delay_secs: u64,
    /// Cron schedule for the periodic batch reconnect; disabled when unset
    pub reconnect_cron: Option<String>,
    pub rate_limit: RateLimitSection,
    pub statistics: StatisticsSection,
    pub dedup: DedupSection,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            logs_dir: None,
            bot_token: String::new(),
            api_base: "https://api.telegram.org".to_string(),
            sources: Vec::new(),
            connect_timeout_secs: 10,
            batch_reconnect_delay_secs: 10,
            reconnect_cron: Some("0 0 3 * * *".to_string()),
            rate_limit: RateLimitSection::default(),
            statistics: StatisticsSection::default(),
            dedup: DedupSection::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file and apply environment overrides.
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        let mut config: Self = serde_json::from_str(&raw)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(token) = std::env::var(ENV_BOT_TOKEN)
            && !token.is_empty()
        {
            self.bot_token = token;
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.bot_token.is_empty() {
            anyhow::bail!("Bot token is not set; add bot_token or set {ENV_BOT_TOKEN}");
        }
        if self.sources.is_empty() {
            anyhow::bail!("No danmaku sources configured");
        }
        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.id.as_str()) {
                anyhow::bail!("Duplicate source id: {}", source.id);
            }
        }
        Ok(())
    }

    /// Router configuration derived from this file.
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            multiplexer: MultiplexerConfig {
                connect_timeout: Duration::from_secs(self.connect_timeout_secs),
                batch_reconnect_delay: Duration::from_secs(self.batch_reconnect_delay_secs),
            },
            dedup: DedupConfig {
                window: Duration::from_secs(self.dedup.window_secs),
                retention: Duration::from_secs(self.dedup.retention_secs),
                ..Default::default()
            },
        }
    }

    /// Rate limiter ceilings derived from this file.
    pub fn limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            enabled: self.rate_limit.enabled,
            global_max: self.rate_limit.global_max,
            global_window: Duration::from_secs(self.rate_limit.global_window_secs),
            per_destination_max: self.rate_limit.per_destination_max,
            per_destination_window: Duration::from_secs(
                self.rate_limit.per_destination_window_secs,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let json = r#"{
            "bot_token": "123:ABC",
            "sources": [
                {"id": "bilibili", "endpoint": "ws://localhost:8001", "auth_token": "secret"},
                {"id": "douyu", "endpoint": "ws://localhost:8002"}
            ]
        }"#;

        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].auth_token.as_deref(), Some("secret"));
        assert!(config.sources[1].auth_token.is_none());
        assert_eq!(config.connect_timeout_secs, 10);
        assert_eq!(config.rate_limit.global_max, 30);
        assert_eq!(config.reconnect_cron.as_deref(), Some("0 0 3 * * *"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_token() {
        let config = AppConfig {
            sources: vec![SourceConfig {
                id: "bilibili".to_string(),
                endpoint: "ws://localhost:8001".to_string(),
                auth_token: None,
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_sources() {
        let source = SourceConfig {
            id: "bilibili".to_string(),
            endpoint: "ws://localhost:8001".to_string(),
            auth_token: None,
        };
        let config = AppConfig {
            bot_token: "123:ABC".to_string(),
            sources: vec![source.clone(), source],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_configs() {
        let config = AppConfig {
            connect_timeout_secs: 5,
            ..Default::default()
        };
        let router = config.router_config();
        assert_eq!(router.multiplexer.connect_timeout, Duration::from_secs(5));
        assert_eq!(router.dedup.window, Duration::from_secs(30));

        let limiter = config.limiter_config();
        assert!(limiter.enabled);
        assert_eq!(limiter.per_destination_window, Duration::from_secs(60));
    }
}
