/*!
Storage backends for checkpoint persistence.

This module defines the storage abstraction (port) and its concrete
implementations (adapters). The checkpoint manager only ever sees a
[`StateStore`], so backends can be swapped by configuration.

Optional capabilities (batch writes, size statistics, TTL) are declared up
front through [`StoreCapabilities`] rather than discovered by probing.
*/

pub mod local;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::config::{StorageBackend, StorageConfig};
use crate::{CheckpointError, Result};

pub use local::FileStore;
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Optional features a backend supports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCapabilities {
    /// `batch_put` / `batch_delete` are implemented natively
    pub batch: bool,
    /// `stats` reports count and aggregate size
    pub stats: bool,
    /// Writes can expire
    pub ttl: bool,
}

/// Backend-reported usage figures
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Backend type, e.g. "memory" or "sqlite"
    pub backend: String,
    /// Number of stored keys
    pub count: u64,
    /// Sum of stored value sizes in bytes
    pub total_size: u64,
    /// Backend-specific extras
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

/// Uniform key/value persistence contract
///
/// Keys are colon-namespaced strings; values are opaque bytes. `list`
/// returns keys sorted lexicographically.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Store `value` under `key`, replacing any previous value
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Fetch the value stored under `key`; `NotFound` if absent
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Remove `key`; `NotFound` if absent
    async fn delete(&self, key: &str) -> Result<()>;

    /// All keys starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Release resources; further calls may fail with `Closed`
    async fn close(&self) -> Result<()>;

    /// Capabilities declared at construction
    fn capabilities(&self) -> StoreCapabilities;

    /// Short backend name for logs and stats
    fn backend_name(&self) -> &'static str;

    /// Write several values in one backend call
    async fn batch_put(&self, _items: &[(String, Vec<u8>)]) -> Result<()> {
        Err(CheckpointError::unsupported(format!(
            "{} store does not support batch writes",
            self.backend_name()
        )))
    }

    /// Delete several keys in one backend call; missing keys are ignored
    async fn batch_delete(&self, _keys: &[String]) -> Result<()> {
        Err(CheckpointError::unsupported(format!(
            "{} store does not support batch deletes",
            self.backend_name()
        )))
    }

    /// Count and aggregate size of stored values
    async fn stats(&self) -> Result<StoreStats> {
        Err(CheckpointError::unsupported(format!(
            "{} store does not report statistics",
            self.backend_name()
        )))
    }
}

/// Create a store from configuration
///
/// # Example
/// ```rust,no_run
/// use waypoint_core::{storage::open_store, StorageConfig};
///
/// # async fn demo() -> waypoint_core::Result<()> {
/// let store = open_store(&StorageConfig::from_uri("file:///var/lib/waypoint")?).await?;
/// store.put("checkpoint:w1:a", b"...").await?;
/// # Ok(())
/// # }
/// ```
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn StateStore>> {
    config.validate()?;

    let store: Arc<dyn StateStore> = match config.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::Filesystem => {
            let root = config
                .path
                .as_ref()
                .ok_or_else(|| CheckpointError::config("filesystem backend requires a path"))?;
            Arc::new(FileStore::new(root)?)
        }
        StorageBackend::Sqlite => open_sqlite(config)?,
        StorageBackend::Redis => open_redis(config).await?,
    };

    info!(backend = store.backend_name(), "Opened state store");
    Ok(store)
}

#[cfg(feature = "sqlite")]
fn open_sqlite(config: &StorageConfig) -> Result<Arc<dyn StateStore>> {
    let path = config
        .path
        .as_ref()
        .ok_or_else(|| CheckpointError::config("sqlite backend requires a path"))?;
    let store = if path.as_os_str() == ":memory:" {
        SqliteStore::in_memory(config.sqlite.clone())?
    } else {
        SqliteStore::open(path, config.sqlite.clone())?
    };
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
fn open_sqlite(_config: &StorageConfig) -> Result<Arc<dyn StateStore>> {
    Err(CheckpointError::config(
        "sqlite backend requested but waypoint-core was built without the `sqlite` feature",
    ))
}

#[cfg(feature = "redis")]
async fn open_redis(config: &StorageConfig) -> Result<Arc<dyn StateStore>> {
    Ok(Arc::new(RedisStore::connect(config.redis.clone()).await?))
}

#[cfg(not(feature = "redis"))]
async fn open_redis(_config: &StorageConfig) -> Result<Arc<dyn StateStore>> {
    Err(CheckpointError::config(
        "redis backend requested but waypoint-core was built without the `redis` feature",
    ))
}

/// Behaviour every backend must share, run against each one in its tests
#[cfg(test)]
pub(crate) mod contract {
    use super::*;

    pub async fn exercise_basic_operations(store: &dyn StateStore) {
        store.put("checkpoint:w1:a", b"alpha").await.unwrap();
        assert!(store.exists("checkpoint:w1:a").await.unwrap());
        assert_eq!(store.get("checkpoint:w1:a").await.unwrap(), b"alpha");

        store.put("checkpoint:w1:a", b"alpha-2").await.unwrap();
        assert_eq!(store.get("checkpoint:w1:a").await.unwrap(), b"alpha-2");

        store.delete("checkpoint:w1:a").await.unwrap();
        assert!(!store.exists("checkpoint:w1:a").await.unwrap());
    }

    pub async fn exercise_not_found(store: &dyn StateStore) {
        assert!(store.get("checkpoint:none:x").await.unwrap_err().is_not_found());
        assert!(store.delete("checkpoint:none:x").await.unwrap_err().is_not_found());
        assert!(!store.exists("checkpoint:none:x").await.unwrap());
    }

    pub async fn exercise_prefix_listing(store: &dyn StateStore) {
        for key in [
            "checkpoint:w2:b",
            "checkpoint:w1:c",
            "checkpoint:w1:a",
            "workflow:w1:latest",
            "checkpoint:w10:z",
        ] {
            store.put(key, key.as_bytes()).await.unwrap();
        }

        assert_eq!(
            store.list("checkpoint:w1:").await.unwrap(),
            vec!["checkpoint:w1:a".to_string(), "checkpoint:w1:c".to_string()]
        );
        assert_eq!(store.list("checkpoint:").await.unwrap().len(), 4);
        assert_eq!(store.list("").await.unwrap().len(), 5);
        assert!(store.list("nothing:").await.unwrap().is_empty());
    }

    pub async fn exercise_empty_value(store: &dyn StateStore) {
        store.put("checkpoint:w1:empty", b"").await.unwrap();
        assert!(store.get("checkpoint:w1:empty").await.unwrap().is_empty());
    }

    pub async fn exercise_batch(store: &dyn StateStore) {
        let items: Vec<(String, Vec<u8>)> = (0..5)
            .map(|i| (format!("checkpoint:wb:{i}"), vec![i as u8; 10]))
            .collect();
        store.batch_put(&items).await.unwrap();
        assert_eq!(store.list("checkpoint:wb:").await.unwrap().len(), 5);

        let keys: Vec<String> = items.iter().take(3).map(|(k, _)| k.clone()).collect();
        store.batch_delete(&keys).await.unwrap();
        assert_eq!(
            store.list("checkpoint:wb:").await.unwrap(),
            vec!["checkpoint:wb:3".to_string(), "checkpoint:wb:4".to_string()]
        );
    }

    pub async fn exercise_stats(store: &dyn StateStore) {
        store.put("checkpoint:ws:a", &[0u8; 100]).await.unwrap();
        store.put("checkpoint:ws:b", &[0u8; 50]).await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.total_size, 150);
        assert_eq!(stats.backend, store.backend_name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_memory_store() {
        let store = open_store(&StorageConfig::memory()).await.unwrap();
        assert_eq!(store.backend_name(), "memory");
        contract::exercise_basic_operations(store.as_ref()).await;
    }

    #[tokio::test]
    async fn test_open_filesystem_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(&StorageConfig::filesystem(dir.path())).await.unwrap();
        assert_eq!(store.backend_name(), "filesystem");
        contract::exercise_basic_operations(store.as_ref()).await;
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let mut config = StorageConfig::filesystem("/tmp");
        config.path = None;
        assert!(open_store(&config).await.is_err());
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_open_sqlite_in_memory() {
        let store = open_store(&StorageConfig::sqlite(":memory:")).await.unwrap();
        assert_eq!(store.backend_name(), "sqlite");
        assert!(store.capabilities().batch);
    }
}
