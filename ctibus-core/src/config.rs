use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub redis: RedisConfig,
    pub concurrency: ConcurrencyConfig,
    pub stream: StreamConfig,
    pub session: SessionConfig,
    pub cluster: ClusterConfig,
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Base connection. Empty means local-only (in-memory) mode.
    pub url: String,
    /// Lock replicas used for quorum acquisition. Empty reuses `url`.
    pub lock_urls: Vec<String>,
    /// Optional namespace prepended to every key as `<namespace>:`
    pub namespace: String,
    pub connect_timeout_seconds: u64,
    /// Approximate max length of the live stream, 0 disables trimming
    pub trimming: usize,
    pub notification_trimming: usize,
    pub activity_trimming: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            lock_urls: Vec::new(),
            namespace: String::new(),
            connect_timeout_seconds: 5,
            trimming: 0,
            notification_trimming: 50_000,
            activity_trimming: 50_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub retry_jitter_ms: u64,
    pub max_ttl_ms: u64,
    pub extension_threshold_ms: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            retry_count: 100,
            retry_delay_ms: 250,
            retry_jitter_ms: 50,
            max_ttl_ms: 30_000,
            extension_threshold_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub name: String,
    pub notification_name: String,
    pub activity_name: String,
    pub batch_size: usize,
    pub block_ms: u64,
    pub reconnect_delay_ms: u64,
    pub with_internal: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: "stream.platform".to_string(),
            notification_name: "stream.notification".to_string(),
            activity_name: "stream.activity".to_string(),
            batch_size: 100,
            block_ms: 5_000,
            reconnect_delay_ms: 2_000,
            with_internal: false,
        }
    }
}

impl StreamConfig {
    #[must_use]
    pub const fn block_time(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub timeout_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 1_200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Generated at startup when empty
    pub node_id: String,
    pub heartbeat_interval_seconds: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            heartbeat_interval_seconds: 30,
        }
    }
}

/// Back-pressure thresholds for the synchronization use case
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub min_queue_size: usize,
    pub max_queue_size: usize,
    pub low_delay_ms: u64,
    pub high_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_queue_size: 100,
            max_queue_size: 500,
            low_delay_ms: 10,
            high_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // CTIBUS_REDIS__URL, CTIBUS_CONCURRENCY__MAX_TTL_MS, ...
        builder = builder.add_source(
            Environment::with_prefix("CTIBUS")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("redis.lock_urls")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Local-only mode: no Redis, every store lives in process memory
    #[must_use]
    pub fn is_local_only(&self) -> bool {
        self.redis.url.trim().is_empty()
    }

    /// Lock replica URLs, falling back to the base connection
    #[must_use]
    pub fn lock_urls(&self) -> Vec<String> {
        if self.redis.lock_urls.is_empty() {
            vec![self.redis.url.clone()]
        } else {
            self.redis.lock_urls.clone()
        }
    }

    /// Collect every configuration problem instead of stopping at the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let c = &self.concurrency;
        if c.max_ttl_ms == 0 {
            errors.push("concurrency.max_ttl_ms must be greater than 0".to_string());
        }
        if c.extension_threshold_ms.saturating_mul(2) >= c.max_ttl_ms {
            errors.push(format!(
                "concurrency.extension_threshold_ms ({}) must be less than half of max_ttl_ms ({})",
                c.extension_threshold_ms, c.max_ttl_ms
            ));
        }
        if c.retry_jitter_ms > c.retry_delay_ms {
            errors.push("concurrency.retry_jitter_ms must not exceed retry_delay_ms".to_string());
        }

        if self.stream.name.trim().is_empty() {
            errors.push("stream.name must not be empty".to_string());
        }
        if self.stream.batch_size == 0 {
            errors.push("stream.batch_size must be greater than 0".to_string());
        }

        let s = &self.sync;
        if s.min_queue_size >= s.max_queue_size {
            errors.push(format!(
                "sync.min_queue_size ({}) must be lower than sync.max_queue_size ({})",
                s.min_queue_size, s.max_queue_size
            ));
        }
        if s.low_delay_ms >= s.high_delay_ms {
            errors.push("sync.low_delay_ms must be lower than sync.high_delay_ms".to_string());
        }

        if self.session.timeout_seconds == 0 {
            errors.push("session.timeout_seconds must be greater than 0".to_string());
        }

        if !self.is_local_only() {
            for url in self.lock_urls() {
                if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                    errors.push(format!("invalid redis url: {url}"));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.concurrency.retry_count, 100);
        assert_eq!(config.concurrency.max_ttl_ms, 30_000);
        assert_eq!(config.stream.batch_size, 100);
        assert!(!config.is_local_only());
    }

    #[test]
    fn test_lock_urls_fallback_to_base() {
        let mut config = Config::default();
        assert_eq!(config.lock_urls(), vec!["redis://localhost:6379".to_string()]);

        config.redis.lock_urls = vec![
            "redis://a:6379".to_string(),
            "redis://b:6379".to_string(),
            "redis://c:6379".to_string(),
        ];
        assert_eq!(config.lock_urls().len(), 3);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.concurrency.extension_threshold_ms = 20_000;
        config.sync.min_queue_size = 600;
        config.stream.batch_size = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("extension_threshold_ms")));
        assert!(errors.iter().any(|e| e.contains("min_queue_size")));
    }

    #[test]
    fn test_local_only_skips_url_checks() {
        let mut config = Config::default();
        config.redis.url = String::new();
        assert!(config.is_local_only());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "redis:\n  namespace: tenant-a\n  trimming: 5000\nconcurrency:\n  retry_count: 3\nstream:\n  with_internal: true"
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.redis.namespace, "tenant-a");
        assert_eq!(config.redis.trimming, 5000);
        assert_eq!(config.concurrency.retry_count, 3);
        // Untouched sections keep their defaults
        assert_eq!(config.concurrency.retry_delay_ms, 250);
        assert!(config.stream.with_internal);
    }
}
