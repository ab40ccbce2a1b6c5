/*!
Checkpoint persistence on top of a [`StateStore`].

The repository owns the key layout and the envelope codec. It is shared by
the [`CheckpointManager`](crate::manager::CheckpointManager) and the
[`AutoCleaner`](crate::cleaner::AutoCleaner) so both read and delete through
the same store with the same encoding.
*/

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::checkpoint::{
    all_checkpoints_prefix, checkpoint_key, latest_pointer_key, parse_checkpoint_key,
    workflow_checkpoint_prefix, Checkpoint, CheckpointInfo, LatestPointer,
};
use crate::envelope::CheckpointCodec;
use crate::storage::{StateStore, StoreStats};
use crate::{CheckpointError, Result};

/// Encoded checkpoint ready to be written
#[derive(Debug, Clone)]
pub struct EncodedCheckpoint {
    pub key: String,
    pub bytes: Vec<u8>,
}

/// Reads and writes checkpoints and latest pointers
pub struct CheckpointRepository {
    store: Arc<dyn StateStore>,
    codec: CheckpointCodec,
}

impl std::fmt::Debug for CheckpointRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointRepository")
            .field("backend", &self.store.backend_name())
            .field("codec", &self.codec)
            .finish()
    }
}

impl CheckpointRepository {
    pub fn new(store: Arc<dyn StateStore>, codec: CheckpointCodec) -> Self {
        Self { store, codec }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn codec(&self) -> &CheckpointCodec {
        &self.codec
    }

    /// Encode `checkpoint` into its stored form
    pub async fn encode(&self, checkpoint: &Checkpoint) -> Result<EncodedCheckpoint> {
        Ok(EncodedCheckpoint {
            key: checkpoint.key(),
            bytes: self.codec.encode(checkpoint).await?,
        })
    }

    /// Write the data row, then the latest pointer
    ///
    /// The two writes are separate store calls. A concurrent reader on a
    /// weakly consistent backend can briefly see the pointer before the data.
    pub async fn write(&self, checkpoint: &Checkpoint) -> Result<u64> {
        let encoded = self.encode(checkpoint).await?;
        let size = encoded.bytes.len() as u64;
        self.store.put(&encoded.key, &encoded.bytes).await?;
        self.write_pointer(&checkpoint.workflow_id, &checkpoint.id, checkpoint.created_at())
            .await?;
        debug!(
            workflow_id = %checkpoint.workflow_id,
            checkpoint_id = %checkpoint.id,
            bytes = size,
            "Wrote checkpoint"
        );
        Ok(size)
    }

    pub async fn write_pointer(
        &self,
        workflow_id: &str,
        checkpoint_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let (key, bytes) = pointer_entry(workflow_id, checkpoint_id, timestamp)?;
        self.store.put(&key, &bytes).await
    }

    /// Latest pointer for `workflow_id`; `NotFound` when none exists
    pub async fn read_pointer(&self, workflow_id: &str) -> Result<LatestPointer> {
        let raw = self.store.get(&latest_pointer_key(workflow_id)).await?;
        serde_json::from_slice(&raw).map_err(|e| {
            CheckpointError::corrupted(format!(
                "latest pointer for workflow {workflow_id} is unreadable: {e}"
            ))
        })
    }

    /// Remove the latest pointer; a missing pointer is not an error
    pub async fn delete_pointer(&self, workflow_id: &str) -> Result<()> {
        match self.store.delete(&latest_pointer_key(workflow_id)).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    pub async fn read(&self, workflow_id: &str, checkpoint_id: &str) -> Result<Checkpoint> {
        let raw = self
            .store
            .get(&checkpoint_key(workflow_id, checkpoint_id))
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    CheckpointError::not_found(format!(
                        "checkpoint {checkpoint_id} of workflow {workflow_id}"
                    ))
                } else {
                    e
                }
            })?;
        self.codec.decode(&raw).await
    }

    pub async fn delete(&self, workflow_id: &str, checkpoint_id: &str) -> Result<()> {
        self.store
            .delete(&checkpoint_key(workflow_id, checkpoint_id))
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    CheckpointError::not_found(format!(
                        "checkpoint {checkpoint_id} of workflow {workflow_id}"
                    ))
                } else {
                    e
                }
            })
    }

    /// Checkpoints of one workflow, newest first
    pub async fn list(&self, workflow_id: &str) -> Result<Vec<CheckpointInfo>> {
        let keys = self.store.list(&workflow_checkpoint_prefix(workflow_id)).await?;
        let mut infos = self.load_infos(keys).await?;
        sort_newest_first(&mut infos);
        Ok(infos)
    }

    /// Checkpoints of every workflow, newest first
    pub async fn list_all(&self) -> Result<Vec<CheckpointInfo>> {
        let keys = self.store.list(&all_checkpoints_prefix()).await?;
        let mut infos = self.load_infos(keys).await?;
        sort_newest_first(&mut infos);
        Ok(infos)
    }

    /// Distinct workflow ids that have at least one checkpoint key
    pub async fn workflow_ids(&self) -> Result<Vec<String>> {
        let keys = self.store.list(&all_checkpoints_prefix()).await?;
        let ids: BTreeSet<String> = keys
            .iter()
            .filter_map(|key| parse_checkpoint_key(key))
            .map(|(workflow_id, _)| workflow_id.to_string())
            .collect();
        Ok(ids.into_iter().collect())
    }

    /// Decode each key into an info; undecodable or vanished records are skipped
    async fn load_infos(&self, keys: Vec<String>) -> Result<Vec<CheckpointInfo>> {
        let mut infos = Vec::with_capacity(keys.len());
        for key in keys {
            if parse_checkpoint_key(&key).is_none() {
                continue;
            }
            let raw = match self.store.get(&key).await {
                Ok(raw) => raw,
                // Deleted between list and get
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            match self.codec.decode(&raw).await {
                Ok(checkpoint) => {
                    infos.push(CheckpointInfo::from_checkpoint(&checkpoint, raw.len() as u64))
                }
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable checkpoint"),
            }
        }
        Ok(infos)
    }

    /// Point `workflow_id`'s latest pointer at a checkpoint that still exists
    ///
    /// If the current target was deleted, the pointer moves to the newest
    /// remaining checkpoint, or is removed when none remain.
    pub async fn repair_pointer(&self, workflow_id: &str) -> Result<()> {
        let pointer = match self.read_pointer(workflow_id).await {
            Ok(pointer) => Some(pointer),
            Err(e) if e.is_not_found() => None,
            Err(e) if e.is_corruption() => None,
            Err(e) => return Err(e),
        };
        if let Some(pointer) = &pointer {
            let target = checkpoint_key(workflow_id, &pointer.checkpoint_id);
            if self.store.exists(&target).await? {
                return Ok(());
            }
        }

        match self.list(workflow_id).await?.first() {
            Some(newest) => {
                debug!(workflow_id, checkpoint_id = %newest.id, "Repointing latest checkpoint");
                self.write_pointer(workflow_id, &newest.id, newest.timestamp)
                    .await
            }
            None if pointer.is_some() => {
                debug!(workflow_id, "Removing latest pointer of emptied workflow");
                self.delete_pointer(workflow_id).await
            }
            None => Ok(()),
        }
    }

    /// Best-effort pointer repair for every workflow in `workflow_ids`
    pub async fn repair_pointers<'a, I>(&self, workflow_ids: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for workflow_id in workflow_ids {
            if let Err(e) = self.repair_pointer(workflow_id).await {
                warn!(workflow_id = %workflow_id, error = %e, "Failed to repair latest pointer");
            }
        }
    }

    /// Backend statistics when the store reports them
    pub async fn stats(&self) -> Result<Option<StoreStats>> {
        if !self.store.capabilities().stats {
            return Ok(None);
        }
        self.store.stats().await.map(Some)
    }
}

/// Key and encoded value of a latest pointer record
pub(crate) fn pointer_entry(
    workflow_id: &str,
    checkpoint_id: &str,
    timestamp: DateTime<Utc>,
) -> Result<(String, Vec<u8>)> {
    let pointer = LatestPointer {
        checkpoint_id: checkpoint_id.to_string(),
        timestamp,
    };
    Ok((latest_pointer_key(workflow_id), serde_json::to_vec(&pointer)?))
}

fn sort_newest_first(infos: &mut [CheckpointInfo]) {
    infos.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
}

/// Group infos by workflow, preserving their order within each group
pub fn group_by_workflow(infos: &[CheckpointInfo]) -> BTreeMap<&str, Vec<&CheckpointInfo>> {
    let mut groups: BTreeMap<&str, Vec<&CheckpointInfo>> = BTreeMap::new();
    for info in infos {
        groups.entry(info.workflow_id.as_str()).or_default().push(info);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Compressor;
    use crate::config::CompressionConfig;
    use crate::storage::MemoryStore;
    use chrono::Duration;
    use serde_json::json;

    fn repository(compress: bool) -> (Arc<MemoryStore>, CheckpointRepository) {
        let store = Arc::new(MemoryStore::new());
        let compressor = Arc::new(Compressor::new(CompressionConfig::default()).unwrap());
        let repo = CheckpointRepository::new(store.clone(), CheckpointCodec::new(compressor, compress));
        (store, repo)
    }

    fn checkpoint(workflow: &str, id: &str, age_minutes: i64) -> Checkpoint {
        let mut cp = Checkpoint::new(workflow, "node", json!({"id": id}))
            .with_id(id)
            .with_timestamp(Utc::now() - Duration::minutes(age_minutes));
        cp.assign_defaults();
        cp
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (_store, repo) = repository(true);
        let cp = checkpoint("w1", "a", 0);
        repo.write(&cp).await.unwrap();

        assert_eq!(repo.read("w1", "a").await.unwrap(), cp);
        assert_eq!(repo.read_pointer("w1").await.unwrap().checkpoint_id, "a");
    }

    #[tokio::test]
    async fn test_list_newest_first_and_skips_corrupt() {
        let (store, repo) = repository(false);
        repo.write(&checkpoint("w1", "old", 30)).await.unwrap();
        repo.write(&checkpoint("w1", "new", 1)).await.unwrap();
        store.put("checkpoint:w1:broken", b"{not json").await.unwrap();

        let ids: Vec<String> = repo.list("w1").await.unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["new", "old"]);
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let (_store, repo) = repository(true);
        assert!(repo.read("w1", "nope").await.unwrap_err().is_not_found());
        assert!(repo.read_pointer("w1").await.unwrap_err().is_not_found());
        assert!(repo.delete("w1", "nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_repair_pointer_moves_to_newest_remaining() {
        let (_store, repo) = repository(true);
        repo.write(&checkpoint("w1", "a", 20)).await.unwrap();
        repo.write(&checkpoint("w1", "b", 10)).await.unwrap();
        repo.write(&checkpoint("w1", "c", 0)).await.unwrap();

        repo.delete("w1", "c").await.unwrap();
        repo.repair_pointer("w1").await.unwrap();
        assert_eq!(repo.read_pointer("w1").await.unwrap().checkpoint_id, "b");

        repo.delete("w1", "a").await.unwrap();
        repo.delete("w1", "b").await.unwrap();
        repo.repair_pointer("w1").await.unwrap();
        assert!(repo.read_pointer("w1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_workflow_ids_are_distinct() {
        let (store, repo) = repository(false);
        repo.write(&checkpoint("beta", "1", 0)).await.unwrap();
        repo.write(&checkpoint("alpha", "1", 0)).await.unwrap();
        repo.write(&checkpoint("alpha", "2", 0)).await.unwrap();
        store.put("unrelated:key", b"x").await.unwrap();

        assert_eq!(repo.workflow_ids().await.unwrap(), vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_stats_reported_when_capable() {
        let (_store, repo) = repository(false);
        repo.write(&checkpoint("w1", "a", 0)).await.unwrap();
        let stats = repo.stats().await.unwrap().unwrap();
        // data row plus latest pointer
        assert_eq!(stats.count, 2);
    }
}
