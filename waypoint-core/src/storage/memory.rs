/*!
In-process storage adapter.
*/

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{StateStore, StoreCapabilities, StoreStats};
use crate::{CheckpointError, Result};

/// Map-backed store that lives as long as the process
///
/// Values are copied on the way in and out, so callers never share buffers
/// with the store. Intended for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CheckpointError::Closed("memory store is closed".to_string()));
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.ensure_open()?;
        Ok(self.entries.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.ensure_open()?;
        Ok(self.entries.write().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.write()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.read()?
            .get(key)
            .cloned()
            .ok_or_else(|| CheckpointError::not_found(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.write()?
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| CheckpointError::not_found(key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.read()?;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.read()?.contains_key(key))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            batch: true,
            stats: true,
            ttl: false,
        }
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn batch_put(&self, items: &[(String, Vec<u8>)]) -> Result<()> {
        let mut entries = self.write()?;
        for (key, value) in items {
            entries.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn batch_delete(&self, keys: &[String]) -> Result<()> {
        let mut entries = self.write()?;
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let entries = self.read()?;
        Ok(StoreStats {
            backend: self.backend_name().to_string(),
            count: entries.len() as u64,
            total_size: entries.values().map(|v| v.len() as u64).sum(),
            details: Default::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::contract;

    #[tokio::test]
    async fn test_memory_store_contract() {
        contract::exercise_basic_operations(&MemoryStore::new()).await;
        contract::exercise_not_found(&MemoryStore::new()).await;
        contract::exercise_prefix_listing(&MemoryStore::new()).await;
        contract::exercise_empty_value(&MemoryStore::new()).await;
        contract::exercise_batch(&MemoryStore::new()).await;
        contract::exercise_stats(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_values_are_copied() {
        let store = MemoryStore::new();
        let mut value = b"original".to_vec();
        store.put("k", &value).await.unwrap();
        value[0] = b'X';

        let mut fetched = store.get("k").await.unwrap();
        assert_eq!(fetched, b"original");
        fetched[0] = b'Y';
        assert_eq!(store.get("k").await.unwrap(), b"original");
    }

    #[tokio::test]
    async fn test_closed_store_rejects_operations() {
        let store = MemoryStore::new();
        store.put("k", b"v").await.unwrap();
        store.close().await.unwrap();

        assert!(matches!(store.get("k").await, Err(CheckpointError::Closed(_))));
        assert!(matches!(store.put("k", b"v").await, Err(CheckpointError::Closed(_))));
    }

    #[tokio::test]
    async fn test_concurrent_writers() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.put(&format!("checkpoint:w:{i:02}"), &[i as u8]).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.list("checkpoint:w:").await.unwrap().len(), 16);
    }
}
