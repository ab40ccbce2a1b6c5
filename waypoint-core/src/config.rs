//! Configuration for the checkpoint manager and its collaborators
//!
//! Every component takes an explicit configuration struct at construction.
//! `Default` implementations are the documented defaults; nothing here reads
//! or mutates process-wide state. Durations serialize as integer milliseconds
//! so configs round-trip through JSON files cleanly.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::compression::CompressionAlgorithm;
use crate::{CheckpointError, Result};

/// Default size above which deflate compression is split across threads
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 1024 * 1024;

/// Whole milliseconds in `value`, saturating at `u64::MAX`
pub(crate) fn saturating_millis(value: Duration) -> u64 {
    u64::try_from(value.as_millis()).unwrap_or(u64::MAX)
}

/// Serde helpers for `Duration` as milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(super::saturating_millis(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_some(&super::super::saturating_millis(*d)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}

/// Compression settings used by the [`Compressor`](crate::compression::Compressor)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Algorithm to use; `auto` picks per payload by sampling its entropy
    pub algorithm: CompressionAlgorithm,
    /// Deflate level (0-9)
    pub level: u32,
    /// Payloads smaller than this are stored raw
    pub min_size: usize,
    /// Budget for a single compress or decompress call
    #[serde(with = "duration_ms")]
    pub max_compression_time: Duration,
    /// Split large deflate payloads across threads
    pub parallel: bool,
    /// Size above which parallel compression kicks in
    pub parallel_threshold: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Auto,
            level: 6,
            min_size: 1024,
            max_compression_time: Duration::from_secs(5),
            parallel: true,
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
        }
    }
}

impl CompressionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.level > 9 {
            return Err(CheckpointError::config(format!(
                "compression level must be between 0 and 9, got {}",
                self.level
            )));
        }
        if self.max_compression_time.is_zero() {
            return Err(CheckpointError::config(
                "max_compression_time must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Retention policy settings for the [`AutoCleaner`](crate::cleaner::AutoCleaner)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    /// Time between cleanup passes
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    /// Checkpoints older than this are eligible for deletion
    #[serde(with = "duration_ms")]
    pub max_age: Duration,
    /// Number of newest checkpoints every workflow keeps regardless of policy
    pub min_keep_count: usize,
    /// Aggregate backend size above which the size policy runs
    pub max_storage_size: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60 * 60),
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
            min_keep_count: 3,
            max_storage_size: 1024 * 1024 * 1024,
        }
    }
}

impl CleanupConfig {
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.interval.is_zero() {
            return Err(CheckpointError::config(
                "cleanup interval must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Settings for the [`CheckpointManager`](crate::manager::CheckpointManager)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Whether the orchestrator should checkpoint on a timer
    pub auto_save: bool,
    #[serde(with = "duration_ms")]
    pub save_interval: Duration,
    /// Per-workflow checkpoint cap; zero disables eviction
    pub max_checkpoints: usize,
    pub compression_enabled: bool,
    /// Age used by [`cleanup_expired`](crate::manager::CheckpointManager::cleanup_expired)
    pub retention_days: u32,
    pub save_before_step: bool,
    pub save_after_step: bool,
    /// Start an auto-cleaner alongside the manager
    pub auto_cleanup: bool,
    #[serde(with = "duration_ms")]
    pub cleanup_interval: Duration,
    /// Pending workflows awaiting cap eviction
    pub eviction_queue_capacity: usize,
    pub compression: CompressionConfig,
    pub cleanup: CleanupConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            auto_save: true,
            save_interval: Duration::from_secs(30),
            max_checkpoints: 10,
            compression_enabled: true,
            retention_days: 7,
            save_before_step: false,
            save_after_step: true,
            auto_cleanup: false,
            cleanup_interval: Duration::from_secs(60 * 60),
            eviction_queue_capacity: 64,
            compression: CompressionConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Load a configuration from a JSON file; missing fields take defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            CheckpointError::config(format!(
                "Failed to read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let config: ManagerConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Cleanup settings with the manager-level interval applied
    pub fn effective_cleanup(&self) -> CleanupConfig {
        CleanupConfig {
            interval: self.cleanup_interval,
            ..self.cleanup.clone()
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60)
    }

    pub fn validate(&self) -> Result<()> {
        if self.auto_save && self.save_interval.is_zero() {
            return Err(CheckpointError::config(
                "save_interval must be greater than zero when auto_save is enabled",
            ));
        }
        if self.auto_cleanup && self.cleanup_interval.is_zero() {
            return Err(CheckpointError::config(
                "cleanup_interval must be greater than zero when auto_cleanup is enabled",
            ));
        }
        if self.eviction_queue_capacity == 0 {
            return Err(CheckpointError::config(
                "eviction_queue_capacity must be at least 1",
            ));
        }
        self.compression.validate()?;
        // The manager's interval overrides `cleanup.interval`, and the loop
        // only needs one when it is started
        if self.auto_cleanup {
            self.effective_cleanup().validate()?;
        }
        Ok(())
    }
}

/// Settings for the [`BatchManager`](crate::batch::BatchManager)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Queue length that triggers an immediate flush
    pub batch_size: usize,
    /// Maximum time a request waits before its batch is flushed
    #[serde(with = "duration_ms")]
    pub flush_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_timeout: Duration::from_millis(100),
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(CheckpointError::config("batch_size must be at least 1"));
        }
        if self.flush_timeout.is_zero() {
            return Err(CheckpointError::config(
                "flush_timeout must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Enumeration of supported storage backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local map, lost on exit
    Memory,
    /// One file per key under a root directory
    Filesystem,
    /// Embedded SQLite database
    Sqlite,
    /// Networked Redis-compatible key-value store
    Redis,
}

/// Deployment shape of the networked key-value store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "mode")]
pub enum RedisTopology {
    Single,
    /// Urls point at sentinels which resolve the named master
    Sentinel { master_name: String },
    Cluster,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteOptions {
    /// Expiry applied to every write; `None` keeps rows forever
    #[serde(with = "duration_ms::option")]
    pub ttl: Option<Duration>,
    /// How often expired rows are purged
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisOptions {
    pub topology: RedisTopology,
    pub urls: Vec<String>,
    /// Namespace prepended to every key
    pub key_prefix: String,
    #[serde(with = "duration_ms::option")]
    pub ttl: Option<Duration>,
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            topology: RedisTopology::Single,
            urls: Vec::new(),
            key_prefix: "waypoint:".to_string(),
            ttl: None,
        }
    }
}

/// Configuration structure for storage backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// The storage backend to use
    pub backend: StorageBackend,
    /// Root directory (filesystem) or database file (sqlite)
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub sqlite: SqliteOptions,
    #[serde(default)]
    pub redis: RedisOptions,
}

impl StorageConfig {
    /// In-memory storage
    pub fn memory() -> Self {
        Self {
            backend: StorageBackend::Memory,
            path: None,
            sqlite: SqliteOptions::default(),
            redis: RedisOptions::default(),
        }
    }

    /// Filesystem storage rooted at `root`
    pub fn filesystem<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            backend: StorageBackend::Filesystem,
            path: Some(root.into()),
            ..Self::memory()
        }
    }

    /// SQLite storage in the database file at `path`
    pub fn sqlite<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            path: Some(path.into()),
            ..Self::memory()
        }
    }

    /// Single-node Redis storage
    pub fn redis<S: Into<String>>(url: S) -> Self {
        Self {
            backend: StorageBackend::Redis,
            redis: RedisOptions {
                urls: vec![url.into()],
                ..RedisOptions::default()
            },
            ..Self::memory()
        }
    }

    /// Parse a storage URI into a configuration
    ///
    /// Supports formats:
    /// - `memory://`
    /// - `file:///var/lib/checkpoints` or a bare path for filesystem storage
    /// - `sqlite:///var/lib/checkpoints.db` (or `sqlite://:memory:`)
    /// - `redis://host:6379/0` / `rediss://...` for a single node
    /// - `redis+sentinel://s1:26379,s2:26379/master-name`
    /// - `redis+cluster://n1:6379,n2:6379`
    pub fn from_uri(uri: &str) -> Result<Self> {
        if uri.is_empty() {
            return Err(CheckpointError::config("storage URI must not be empty"));
        }
        if uri == "memory://" || uri == "memory" {
            return Ok(Self::memory());
        }
        if let Some(path) = uri.strip_prefix("file://") {
            if path.is_empty() {
                return Err(CheckpointError::config("file URI is missing a path"));
            }
            return Ok(Self::filesystem(path));
        }
        if let Some(path) = uri.strip_prefix("sqlite://") {
            if path.is_empty() {
                return Err(CheckpointError::config("sqlite URI is missing a path"));
            }
            return Ok(Self::sqlite(path));
        }
        if uri.starts_with("redis://") || uri.starts_with("rediss://") {
            return Ok(Self::redis(uri));
        }
        if let Some(rest) = uri.strip_prefix("redis+sentinel://") {
            let (hosts, master) = rest.split_once('/').ok_or_else(|| {
                CheckpointError::config("sentinel URI is missing the master name")
            })?;
            if master.is_empty() {
                return Err(CheckpointError::config(
                    "sentinel URI is missing the master name",
                ));
            }
            let mut config = Self::redis_hosts(hosts)?;
            config.redis.topology = RedisTopology::Sentinel {
                master_name: master.to_string(),
            };
            return Ok(config);
        }
        if let Some(hosts) = uri.strip_prefix("redis+cluster://") {
            let mut config = Self::redis_hosts(hosts.trim_end_matches('/'))?;
            config.redis.topology = RedisTopology::Cluster;
            return Ok(config);
        }
        if uri.contains("://") {
            return Err(CheckpointError::config(format!(
                "unsupported storage URI scheme: {uri}"
            )));
        }
        // Treat as local path
        Ok(Self::filesystem(uri))
    }

    fn redis_hosts(hosts: &str) -> Result<Self> {
        let urls: Vec<String> = hosts
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(|h| format!("redis://{h}"))
            .collect();
        if urls.is_empty() {
            return Err(CheckpointError::config("redis URI lists no hosts"));
        }
        Ok(Self {
            backend: StorageBackend::Redis,
            redis: RedisOptions {
                urls,
                ..RedisOptions::default()
            },
            ..Self::memory()
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.backend {
            StorageBackend::Memory => {}
            StorageBackend::Filesystem | StorageBackend::Sqlite => {
                let missing = self
                    .path
                    .as_ref()
                    .map_or(true, |p| p.as_os_str().is_empty());
                if missing {
                    return Err(CheckpointError::config(format!(
                        "{:?} backend requires a path",
                        self.backend
                    )));
                }
                if self.sqlite.sweep_interval.is_zero() {
                    return Err(CheckpointError::config(
                        "sqlite sweep_interval must be greater than zero",
                    ));
                }
            }
            StorageBackend::Redis => {
                if self.redis.urls.is_empty() {
                    return Err(CheckpointError::config(
                        "redis backend requires at least one url",
                    ));
                }
                if let RedisTopology::Sentinel { master_name } = &self.redis.topology {
                    if master_name.is_empty() {
                        return Err(CheckpointError::config(
                            "sentinel topology requires a master name",
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::memory()
    }
}
