// Layered configuration: built-in defaults, then an optional TOML file, then
// KLINE__SECTION__FIELD environment variables.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_CONFIG_FILE: &str = "kline-analytics.toml";
pub const ENV_PREFIX: &str = "KLINE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_secs: u64,
    pub reference_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            reference_ttl_secs: 1800,
            sweep_interval_secs: 60,
            max_entries: 1000,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn reference_ttl(&self) -> Duration {
        Duration::from_secs(self.reference_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Push-feed endpoint; the instrument is appended as `?stock_code=`.
    pub ws_url: Option<String>,
    pub keepalive_secs: u64,
    pub base_delay_ms: u64,
    pub cap_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub connect_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ws_url: None,
            keepalive_secs: 30,
            base_delay_ms: 1000,
            cap_delay_ms: 16000,
            max_reconnect_attempts: 5,
            connect_timeout_ms: 5000,
        }
    }
}

impl StreamConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub fetch_timeout_ms: u64,
    /// Extra attempts after the first failed fetch.
    pub fetch_retries: u32,
    pub page_size: u32,
    pub sort_field: String,
    pub sort_direction: SortDirection,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: 10_000,
            fetch_retries: 1,
            page_size: 1000,
            sort_field: "tradingDate".to_string(),
            sort_direction: SortDirection::Asc,
        }
    }
}

impl QueryConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub cache: CacheConfig,
    pub stream: StreamConfig,
    pub query: QueryConfig,
}

impl AppConfig {
    /// Load configuration. An explicit `path` must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name(DEFAULT_CONFIG_FILE).required(false)),
        };

        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .context("Failed to read configuration")?;

        let cfg: AppConfig = settings
            .try_deserialize()
            .context("Failed to parse configuration")?;
        cfg.validate()?;

        debug!(?cfg, "Configuration loaded");
        info!(
            "Configuration: cache ttl={}s, stream={}, fetch timeout={}ms",
            cfg.cache.default_ttl_secs,
            cfg.stream.ws_url.as_deref().unwrap_or("<none>"),
            cfg.query.fetch_timeout_ms
        );
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.default_ttl_secs == 0 {
            bail!("cache.default_ttl_secs must be positive");
        }
        if self.cache.max_entries == 0 {
            bail!("cache.max_entries must be positive");
        }
        if self.stream.base_delay_ms == 0 || self.stream.cap_delay_ms < self.stream.base_delay_ms {
            bail!("stream delays must satisfy 0 < base_delay_ms <= cap_delay_ms");
        }
        if self.query.fetch_timeout_ms == 0 {
            bail!("query.fetch_timeout_ms must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.cache.default_ttl(), Duration::from_secs(300));
        assert_eq!(cfg.cache.reference_ttl(), Duration::from_secs(1800));
        assert_eq!(cfg.stream.keepalive(), Duration::from_secs(30));
        assert_eq!(cfg.stream.max_reconnect_attempts, 5);
        assert_eq!(cfg.query.sort_direction, SortDirection::Asc);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let path = std::env::temp_dir().join(format!("kline-config-{}.toml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[cache]\ndefault_ttl_secs = 120\n\n[stream]\nws_url = \"ws://localhost:9000/feed\"").unwrap();

        let cfg = AppConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(cfg.cache.default_ttl_secs, 120);
        assert_eq!(cfg.cache.max_entries, 1000);
        assert_eq!(cfg.stream.ws_url.as_deref(), Some("ws://localhost:9000/feed"));
    }

    #[test]
    fn test_rejects_inverted_delays() {
        let mut cfg = AppConfig::default();
        cfg.stream.cap_delay_ms = 10;
        assert!(cfg.validate().is_err());
    }
}
