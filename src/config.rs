use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the aggregoor service.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Aggregation pipeline configuration.
    #[serde(default)]
    pub core: CoreConfig,

    /// Batched storage write queue configuration.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Physical storage unit lifecycle configuration.
    #[serde(default)]
    pub schema: SchemaConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Identifies this aggregation cluster in logs and diagnostics.
    #[serde(default)]
    pub meta_cluster_name: String,
}

/// Aggregation pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    /// How often the current cache generation is rotated and flushed
    /// toward storage. Default: 10s.
    #[serde(default = "default_core_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Shard count for the aggregation cache maps, rounded up to a power
    /// of two. Default: 64.
    #[serde(default = "default_cache_shards")]
    pub cache_shards: usize,

    /// Bounded capacity of the ingest event channel. Default: 65536.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Top-N capacity of each record buffer. Default: 50.
    #[serde(default = "default_recent_buffer_capacity")]
    pub recent_buffer_capacity: usize,

    /// Flush cycles a persist session survives without updates before it
    /// is evicted. Default: 3.
    #[serde(default = "default_session_slack_cycles")]
    pub session_slack_cycles: u64,
}

/// Batched storage write queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Bounded capacity of the write request channel. A full channel
    /// blocks producers rather than dropping. Default: 10000.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// Pending row count that triggers an immediate flush. Default: 2000.
    #[serde(default = "default_batch_threshold")]
    pub batch_threshold: usize,

    /// Maximum time rows wait below the threshold before a flush.
    /// Default: 2s.
    #[serde(default = "default_queue_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Maximum number of backend flushes in flight at once. Default: 2.
    #[serde(default = "default_max_concurrent_flushes")]
    pub max_concurrent_flushes: usize,

    /// Deadline for one grouped backend write. Default: 10s.
    #[serde(default = "default_flush_timeout", with = "humantime_serde")]
    pub flush_timeout: Duration,
}

/// Storage backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend selection. Default: memory.
    #[serde(default)]
    pub mode: StorageMode,

    /// HTTP document-store adapter configuration (used when mode = http).
    #[serde(default)]
    pub http: HttpStorageConfig,
}

/// Storage backends supported by the write pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    Memory,
    Http,
}

impl Default for StorageMode {
    fn default() -> Self {
        Self::Memory
    }
}

/// HTTP document-store adapter configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpStorageConfig {
    /// Document store base URL (e.g., "http://localhost:9200").
    #[serde(default)]
    pub endpoint: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Request body compression (none, gzip, zstd, zlib, snappy).
    /// Default: "none".
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Extra headers added to every storage request (e.g., authorization).
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Physical storage unit lifecycle configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaConfig {
    /// Day step for physical unit naming. Default: 1 (one unit per day).
    #[serde(default = "default_rollover_step_days")]
    pub rollover_step_days: u32,

    /// Days of data retained before a unit is deleted. Default: 7.
    #[serde(default = "default_ttl_days")]
    pub ttl_days: u32,

    /// Age in days past which per-day units are collapsed onto
    /// compression boundaries. Default: 3.
    #[serde(default = "default_compress_after_days")]
    pub compress_after_days: u32,

    /// Width in days of a compressed unit. Default: 1 (compression off).
    #[serde(default = "default_compress_step_days")]
    pub compress_step_days: u32,

    /// How often units are re-rolled and retention/compression run.
    /// Default: 1h.
    #[serde(default = "default_maintenance_interval", with = "humantime_serde")]
    pub maintenance_interval: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Enable the health metrics server. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. A ":port" value binds all interfaces.
    /// Default: ":9091".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_core_flush_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_cache_shards() -> usize {
    64
}

fn default_event_channel_capacity() -> usize {
    65536
}

fn default_recent_buffer_capacity() -> usize {
    50
}

fn default_session_slack_cycles() -> u64 {
    3
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_batch_threshold() -> usize {
    2_000
}

fn default_queue_flush_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_max_concurrent_flushes() -> usize {
    2
}

fn default_flush_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_rollover_step_days() -> u32 {
    1
}

fn default_ttl_days() -> u32 {
    7
}

fn default_compress_after_days() -> u32 {
    3
}

fn default_compress_step_days() -> u32 {
    1
}

fn default_maintenance_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9091".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            core: CoreConfig::default(),
            queue: QueueConfig::default(),
            storage: StorageConfig::default(),
            schema: SchemaConfig::default(),
            health: HealthConfig::default(),
            meta_cluster_name: String::new(),
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            flush_interval: default_core_flush_interval(),
            cache_shards: default_cache_shards(),
            event_channel_capacity: default_event_channel_capacity(),
            recent_buffer_capacity: default_recent_buffer_capacity(),
            session_slack_cycles: default_session_slack_cycles(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            batch_threshold: default_batch_threshold(),
            flush_interval: default_queue_flush_interval(),
            max_concurrent_flushes: default_max_concurrent_flushes(),
            flush_timeout: default_flush_timeout(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::default(),
            http: HttpStorageConfig::default(),
        }
    }
}

impl Default for HttpStorageConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            request_timeout: default_request_timeout(),
            compression: default_compression(),
            headers: HashMap::new(),
        }
    }
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            rollover_step_days: default_rollover_step_days(),
            ttl_days: default_ttl_days(),
            compress_after_days: default_compress_after_days(),
            compress_step_days: default_compress_step_days(),
            maintenance_interval: default_maintenance_interval(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.meta_cluster_name.is_empty() {
            bail!("meta_cluster_name is required");
        }

        if self.core.flush_interval.is_zero() {
            bail!("core.flush_interval must be positive");
        }
        if self.core.cache_shards == 0 {
            bail!("core.cache_shards must be positive");
        }
        if self.core.event_channel_capacity == 0 {
            bail!("core.event_channel_capacity must be positive");
        }
        if self.core.recent_buffer_capacity == 0 {
            bail!("core.recent_buffer_capacity must be positive");
        }
        if self.core.session_slack_cycles == 0 {
            bail!("core.session_slack_cycles must be positive");
        }

        if self.queue.capacity == 0 {
            bail!("queue.capacity must be positive");
        }
        if self.queue.batch_threshold == 0 {
            bail!("queue.batch_threshold must be positive");
        }
        if self.queue.batch_threshold > self.queue.capacity {
            bail!(
                "queue.batch_threshold {} must not exceed queue.capacity {}",
                self.queue.batch_threshold,
                self.queue.capacity
            );
        }
        if self.queue.max_concurrent_flushes == 0 {
            bail!("queue.max_concurrent_flushes must be positive");
        }
        if self.queue.flush_interval.is_zero() {
            bail!("queue.flush_interval must be positive");
        }
        if self.queue.flush_timeout.is_zero() {
            bail!("queue.flush_timeout must be positive");
        }

        // Validate the HTTP adapter config only when it is selected.
        if self.storage.mode == StorageMode::Http {
            if self.storage.http.endpoint.is_empty() {
                bail!("storage.http.endpoint is required when storage.mode = http");
            }
            if self.storage.http.request_timeout.is_zero() {
                bail!("storage.http.request_timeout must be positive");
            }

            let compression = &self.storage.http.compression;
            match compression.as_str() {
                "none" | "gzip" | "zstd" | "zlib" | "snappy" => {}
                _ => bail!("invalid compression type: {compression}"),
            }
        }

        if self.schema.rollover_step_days == 0 {
            bail!("schema.rollover_step_days must be positive");
        }
        if self.schema.ttl_days == 0 {
            bail!("schema.ttl_days must be positive");
        }
        if self.schema.compress_after_days == 0 {
            bail!("schema.compress_after_days must be positive");
        }
        if self.schema.compress_step_days == 0 {
            bail!("schema.compress_step_days must be positive");
        }
        if self.schema.maintenance_interval.is_zero() {
            bail!("schema.maintenance_interval must be positive");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid_config() -> Config {
        Config {
            meta_cluster_name: "test-cluster".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.core.flush_interval, Duration::from_secs(10));
        assert_eq!(cfg.core.cache_shards, 64);
        assert_eq!(cfg.core.event_channel_capacity, 65536);
        assert_eq!(cfg.core.recent_buffer_capacity, 50);
        assert_eq!(cfg.queue.capacity, 10_000);
        assert_eq!(cfg.queue.batch_threshold, 2_000);
        assert_eq!(cfg.queue.max_concurrent_flushes, 2);
        assert_eq!(cfg.storage.mode, StorageMode::Memory);
        assert_eq!(cfg.storage.http.compression, "none");
        assert_eq!(cfg.schema.rollover_step_days, 1);
        assert_eq!(cfg.schema.ttl_days, 7);
        assert_eq!(cfg.schema.compress_step_days, 1);
        assert!(cfg.health.enabled);
        assert_eq!(cfg.health.addr, ":9091");
    }

    #[test]
    fn test_validation_valid_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validation_missing_cluster_name() {
        let cfg = Config::default();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("meta_cluster_name"));
    }

    #[test]
    fn test_validation_zero_flush_interval() {
        let mut cfg = valid_config();
        cfg.core.flush_interval = Duration::ZERO;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("core.flush_interval"));
    }

    #[test]
    fn test_validation_batch_threshold_exceeds_capacity() {
        let mut cfg = valid_config();
        cfg.queue.capacity = 100;
        cfg.queue.batch_threshold = 101;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("batch_threshold"));

        cfg.queue.batch_threshold = 100;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_http_endpoint_required() {
        let mut cfg = valid_config();
        cfg.storage.mode = StorageMode::Http;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("storage.http.endpoint"));

        cfg.storage.http.endpoint = "http://localhost:9200".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_invalid_compression() {
        let mut cfg = valid_config();
        cfg.storage.mode = StorageMode::Http;
        cfg.storage.http.endpoint = "http://localhost:9200".to_string();
        cfg.storage.http.compression = "lz4".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("invalid compression type"));

        // Compression is only checked for the selected backend.
        cfg.storage.mode = StorageMode::Memory;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_zero_rollover_step() {
        let mut cfg = valid_config();
        cfg.schema.rollover_step_days = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("schema.rollover_step_days"));
    }

    #[test]
    fn test_validation_zero_session_slack() {
        let mut cfg = valid_config();
        cfg.core.session_slack_cycles = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("core.session_slack_cycles"));
    }

    #[test]
    fn test_load_minimal_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "meta_cluster_name: edge-eu-1").unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.meta_cluster_name, "edge-eu-1");
        assert_eq!(cfg.core.flush_interval, Duration::from_secs(10));
        assert_eq!(cfg.storage.mode, StorageMode::Memory);
    }

    #[test]
    fn test_load_full_yaml() {
        let yaml = r#"
log_level: debug
meta_cluster_name: edge-eu-1
core:
  flush_interval: 5s
  cache_shards: 32
  event_channel_capacity: 1024
  recent_buffer_capacity: 10
  session_slack_cycles: 2
queue:
  capacity: 500
  batch_threshold: 100
  flush_interval: 250ms
  max_concurrent_flushes: 4
  flush_timeout: 3s
storage:
  mode: http
  http:
    endpoint: http://store:9200
    request_timeout: 30s
    compression: zstd
    headers:
      authorization: Basic Zm9v
schema:
  rollover_step_days: 1
  ttl_days: 30
  compress_after_days: 7
  compress_step_days: 11
  maintenance_interval: 10m
health:
  enabled: false
  addr: ":9100"
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.core.flush_interval, Duration::from_secs(5));
        assert_eq!(cfg.core.cache_shards, 32);
        assert_eq!(cfg.queue.flush_interval, Duration::from_millis(250));
        assert_eq!(cfg.storage.mode, StorageMode::Http);
        assert_eq!(cfg.storage.http.endpoint, "http://store:9200");
        assert_eq!(cfg.storage.http.compression, "zstd");
        assert_eq!(
            cfg.storage.http.headers.get("authorization").map(String::as_str),
            Some("Basic Zm9v")
        );
        assert_eq!(cfg.schema.ttl_days, 30);
        assert_eq!(cfg.schema.compress_step_days, 11);
        assert_eq!(cfg.schema.maintenance_interval, Duration::from_secs(600));
        assert!(!cfg.health.enabled);
        assert_eq!(cfg.health.addr, ":9100");
    }

    #[test]
    fn test_load_rejects_invalid_config() {
        let yaml = r#"
meta_cluster_name: edge-eu-1
queue:
  capacity: 10
  batch_threshold: 20
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("batch_threshold"));
    }
}
