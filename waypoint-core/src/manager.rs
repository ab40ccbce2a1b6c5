/*!
Checkpoint manager: the main entry point of the engine.

The manager orchestrates id/version assignment, the envelope codec, the key
layout and latest-pointer tracking on top of any [`StateStore`]. It also owns
the two background tasks attached to a store:

- a bounded eviction worker that trims workflows down to `max_checkpoints`
  after saves, and
- an optional [`AutoCleaner`] running the retention policies.

All operations on one manager are ordered by a single read-write lock: saves,
deletes and cleanups are exclusive, loads and listings are shared.
*/

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::checkpoint::{
    checkpoint_key, validate_segment, workflow_checkpoint_prefix, Checkpoint, CheckpointInfo,
    CheckpointType,
};
use crate::cleaner::AutoCleaner;
use crate::compression::{CompressionStats, Compressor};
use crate::config::{ManagerConfig, StorageConfig};
use crate::envelope::CheckpointCodec;
use crate::performance::PerformanceManager;
use crate::repository::{pointer_entry, CheckpointRepository};
use crate::storage::{open_store, StateStore, StoreCapabilities, StoreStats};
use crate::{CheckpointError, Result};

struct ManagerInner {
    repository: Arc<CheckpointRepository>,
    config: ManagerConfig,
    op_lock: Arc<RwLock<()>>,
    evictions: Mutex<Option<mpsc::Sender<String>>>,
    eviction_worker: Mutex<Option<JoinHandle<()>>>,
    cleaner: AutoCleaner,
    performance: Arc<PerformanceManager>,
    closed: AtomicBool,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.cleaner.cancel();
    }
}

/// Saves, loads and manages workflow checkpoints
///
/// Cloning is cheap and yields another handle to the same manager.
///
/// # Example
/// ```rust,no_run
/// use serde_json::json;
/// use waypoint_core::{Checkpoint, CheckpointManager, ManagerConfig, StorageConfig};
///
/// # async fn demo() -> waypoint_core::Result<()> {
/// let manager =
///     CheckpointManager::open(&StorageConfig::memory(), ManagerConfig::default()).await?;
///
/// let saved = manager
///     .save(Checkpoint::new("order-42", "charge-card", json!({"attempt": 1})))
///     .await?;
/// let latest = manager.load("order-42").await?;
/// assert_eq!(latest.id, saved.id);
///
/// manager.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CheckpointManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("repository", &self.inner.repository)
            .field("config", &self.inner.config)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl CheckpointManager {
    /// Create a manager over an already opened store
    ///
    /// Must be called inside a Tokio runtime: the eviction worker (when
    /// `max_checkpoints > 0`) and the auto-cleaner (when `auto_cleanup` is
    /// set) are spawned here.
    ///
    /// # Errors
    /// * `CheckpointError::Config` - If the configuration is invalid or no runtime is available
    pub fn new(store: Arc<dyn StateStore>, config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            CheckpointError::config("checkpoint manager must be created inside a Tokio runtime")
        })?;

        let compressor = Arc::new(Compressor::new(config.compression.clone())?);
        let codec = CheckpointCodec::new(compressor, config.compression_enabled);
        let repository = Arc::new(CheckpointRepository::new(store, codec));
        let op_lock = Arc::new(RwLock::new(()));

        let (evictions, eviction_worker) = if config.max_checkpoints > 0 {
            let (tx, rx) = mpsc::channel(config.eviction_queue_capacity);
            let worker = runtime.spawn(run_eviction_worker(
                Arc::clone(&repository),
                Arc::clone(&op_lock),
                config.max_checkpoints,
                rx,
            ));
            (Some(tx), Some(worker))
        } else {
            (None, None)
        };

        let cleaner = AutoCleaner::with_lock(
            Arc::clone(&repository),
            config.effective_cleanup(),
            Arc::clone(&op_lock),
        );
        if config.auto_cleanup {
            if cleaner.config().enabled {
                cleaner.start()?;
            } else {
                info!("auto_cleanup requested but cleanup policies are disabled");
            }
        }

        info!(
            backend = repository.store().backend_name(),
            compression = config.compression_enabled,
            max_checkpoints = config.max_checkpoints,
            auto_cleanup = cleaner.is_running(),
            "Checkpoint manager started"
        );

        Ok(Self {
            inner: Arc::new(ManagerInner {
                repository,
                config,
                op_lock,
                evictions: Mutex::new(evictions),
                eviction_worker: Mutex::new(eviction_worker),
                cleaner,
                performance: Arc::new(new_performance_manager()?),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Open the store described by `storage` and create a manager over it
    pub async fn open(storage: &StorageConfig, config: ManagerConfig) -> Result<Self> {
        let store = open_store(storage).await?;
        Self::new(store, config)
    }

    /// Persist a checkpoint and make it the workflow's latest
    ///
    /// Missing id, timestamp and version are filled in first; the returned
    /// checkpoint carries the assigned values. When a checkpoint cap is
    /// configured, excess checkpoints of the workflow are evicted in the
    /// background after this call returns.
    ///
    /// # Errors
    /// * `CheckpointError::Validation` - If the checkpoint is not storable
    /// * `CheckpointError::Storage` - If the backend write fails
    /// * `CheckpointError::Closed` - If the manager has been closed
    pub async fn save(&self, mut checkpoint: Checkpoint) -> Result<Checkpoint> {
        self.ensure_open()?;
        checkpoint.assign_defaults();
        checkpoint.validate()?;

        let start = Instant::now();
        let written = {
            let _guard = self.inner.op_lock.write().await;
            self.inner.repository.write(&checkpoint).await
        };
        self.inner
            .performance
            .record_save(start.elapsed(), written.as_ref().ok().copied());
        let size = written?;

        info!(
            workflow_id = %checkpoint.workflow_id,
            checkpoint_id = %checkpoint.id,
            node = %checkpoint.current_node,
            bytes = size,
            "Checkpoint saved"
        );
        self.schedule_eviction(&checkpoint.workflow_id);
        Ok(checkpoint)
    }

    /// The workflow's latest checkpoint, resolved through its pointer
    ///
    /// # Errors
    /// * `CheckpointError::NotFound` - If the workflow has no latest pointer or its target is gone
    /// * `CheckpointError::Corrupted` - If the stored checkpoint cannot be decoded
    pub async fn load(&self, workflow_id: &str) -> Result<Checkpoint> {
        self.ensure_open()?;
        let start = Instant::now();
        let loaded = {
            let _guard = self.inner.op_lock.read().await;
            self.load_latest(workflow_id).await
        };
        self.inner
            .performance
            .record_load(start.elapsed(), loaded.is_ok());
        loaded
    }

    async fn load_latest(&self, workflow_id: &str) -> Result<Checkpoint> {
        let pointer = self
            .inner
            .repository
            .read_pointer(workflow_id)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    CheckpointError::not_found(format!("no checkpoints for workflow {workflow_id}"))
                } else {
                    e
                }
            })?;
        let checkpoint = self
            .inner
            .repository
            .read(workflow_id, &pointer.checkpoint_id)
            .await?;
        debug!(workflow_id, checkpoint_id = %checkpoint.id, "Loaded latest checkpoint");
        Ok(checkpoint)
    }

    /// A specific checkpoint by id
    pub async fn load_by_id(&self, workflow_id: &str, checkpoint_id: &str) -> Result<Checkpoint> {
        self.ensure_open()?;
        let start = Instant::now();
        let loaded = {
            let _guard = self.inner.op_lock.read().await;
            self.inner.repository.read(workflow_id, checkpoint_id).await
        };
        self.inner
            .performance
            .record_load(start.elapsed(), loaded.is_ok());
        loaded
    }

    /// Checkpoints of one workflow, newest first
    ///
    /// Records that fail to decode are skipped.
    pub async fn list(&self, workflow_id: &str) -> Result<Vec<CheckpointInfo>> {
        self.ensure_open()?;
        let _guard = self.inner.op_lock.read().await;
        self.inner.repository.list(workflow_id).await
    }

    /// Workflow ids that currently have at least one checkpoint
    pub async fn list_workflows(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let _guard = self.inner.op_lock.read().await;
        self.inner.repository.workflow_ids().await
    }

    /// Remove one checkpoint
    ///
    /// If it was the workflow's latest, the pointer moves to the newest
    /// remaining checkpoint, or is removed when none remain.
    pub async fn delete(&self, workflow_id: &str, checkpoint_id: &str) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.inner.op_lock.write().await;
        self.inner.repository.delete(workflow_id, checkpoint_id).await?;
        self.repair_pointer(workflow_id).await;
        debug!(workflow_id, checkpoint_id, "Checkpoint deleted");
        Ok(())
    }

    /// Remove every checkpoint of a workflow and its latest pointer
    ///
    /// Returns how many checkpoint records were removed.
    pub async fn delete_all(&self, workflow_id: &str) -> Result<usize> {
        self.ensure_open()?;
        validate_segment("workflow_id", workflow_id)?;

        let _guard = self.inner.op_lock.write().await;
        let store = self.inner.repository.store();
        let keys = store.list(&workflow_checkpoint_prefix(workflow_id)).await?;

        let deleted = if keys.is_empty() {
            0
        } else if store.capabilities().batch {
            store.batch_delete(&keys).await?;
            keys.len()
        } else {
            let mut deleted = 0;
            for key in &keys {
                match store.delete(key).await {
                    Ok(()) => deleted += 1,
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
            deleted
        };

        self.inner.repository.delete_pointer(workflow_id).await?;
        info!(workflow_id, deleted, "Deleted all checkpoints of workflow");
        Ok(deleted)
    }

    /// Delete checkpoints of every workflow created before `now - older_than`
    ///
    /// Individual delete failures are logged and skipped. Returns how many
    /// checkpoints were removed.
    pub async fn cleanup(&self, older_than: Duration) -> Result<usize> {
        self.ensure_open()?;
        let age = chrono::Duration::from_std(older_than).map_err(|e| {
            CheckpointError::validation(format!("cleanup age out of range: {e}"))
        })?;
        let Some(cutoff) = Utc::now().checked_sub_signed(age) else {
            return Ok(0);
        };

        let _guard = self.inner.op_lock.write().await;
        let infos = self.inner.repository.list_all().await?;

        let mut deleted = 0;
        let mut touched = BTreeSet::new();
        for info in infos.iter().filter(|info| info.timestamp < cutoff) {
            match self.inner.repository.delete(&info.workflow_id, &info.id).await {
                Ok(()) => deleted += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(
                        workflow_id = %info.workflow_id,
                        checkpoint_id = %info.id,
                        error = %e,
                        "Failed to delete expired checkpoint"
                    );
                    continue;
                }
            }
            touched.insert(info.workflow_id.clone());
        }
        self.inner.repository.repair_pointers(&touched).await;

        info!(deleted, cutoff = %cutoff, "Cleanup completed");
        Ok(deleted)
    }

    /// [`cleanup`](Self::cleanup) with the configured retention period
    pub async fn cleanup_expired(&self) -> Result<usize> {
        self.cleanup(self.inner.config.retention()).await
    }

    /// Trim a workflow to its newest `max_checkpoints` right away
    ///
    /// Saves schedule this in the background; calling it directly is useful
    /// when eviction must be complete before continuing. Returns how many
    /// checkpoints were removed; always zero when no cap is configured.
    pub async fn evict_excess(&self, workflow_id: &str) -> Result<usize> {
        self.ensure_open()?;
        let max = self.inner.config.max_checkpoints;
        if max == 0 {
            return Ok(0);
        }
        let _guard = self.inner.op_lock.write().await;
        evict_oldest(&self.inner.repository, workflow_id, max).await
    }

    /// Whether an orchestrator should take a checkpoint of this type now
    ///
    /// Manual checkpoints are always taken. Step checkpoints follow the
    /// before/after-step flags. Automatic checkpoints require `auto_save` and
    /// at least `save_interval` since `last_saved`.
    pub fn should_checkpoint(
        &self,
        checkpoint_type: CheckpointType,
        last_saved: Option<DateTime<Utc>>,
    ) -> bool {
        let config = &self.inner.config;
        match checkpoint_type {
            CheckpointType::Manual => true,
            CheckpointType::BeforeStep => config.save_before_step,
            CheckpointType::AfterStep => config.save_after_step,
            CheckpointType::Auto => {
                if !config.auto_save {
                    return false;
                }
                match last_saved {
                    None => true,
                    Some(at) => (Utc::now() - at)
                        .to_std()
                        .map_or(false, |elapsed| elapsed >= config.save_interval),
                }
            }
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// The retention cleaner bound to this manager's store
    ///
    /// It runs in the background only when `auto_cleanup` is configured, but
    /// [`run_once`](AutoCleaner::run_once) can be called at any time.
    pub fn cleaner(&self) -> &AutoCleaner {
        &self.inner.cleaner
    }

    pub fn performance(&self) -> &Arc<PerformanceManager> {
        &self.inner.performance
    }

    pub fn compression_stats(&self) -> CompressionStats {
        self.inner.repository.codec().compressor().stats()
    }

    pub fn store_capabilities(&self) -> StoreCapabilities {
        self.inner.repository.store().capabilities()
    }

    /// Backend statistics, or `None` when the backend does not report them
    pub async fn store_stats(&self) -> Result<Option<StoreStats>> {
        self.ensure_open()?;
        self.inner.repository.stats().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stop background work and close the store
    ///
    /// Queued evictions are drained before the store closes. Later calls on
    /// any handle fail with `CheckpointError::Closed`; closing twice is a
    /// no-op.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.cleaner.stop().await;

        // Dropping the sender lets the worker finish what is queued and exit
        drop(lock(&self.inner.evictions).take());
        let worker = lock(&self.inner.eviction_worker).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Eviction worker ended abnormally");
            }
        }

        let _guard = self.inner.op_lock.write().await;
        self.inner.repository.store().close().await?;
        info!("Checkpoint manager closed");
        Ok(())
    }

    /// Write several checkpoints with one backend batch call
    ///
    /// Each workflow's pointer moves to its last checkpoint in `checkpoints`.
    /// Checkpoints that fail validation or encoding fail individually; a
    /// failed batch write fails every remaining entry.
    pub(crate) async fn save_many(&self, checkpoints: Vec<Checkpoint>) -> Vec<Result<Checkpoint>> {
        let total = checkpoints.len();
        if self.ensure_open().is_err() {
            return (0..total).map(|_| Err(closed_error())).collect();
        }

        let mut results: Vec<Option<Result<Checkpoint>>> = (0..total).map(|_| None).collect();
        let mut staged = Vec::with_capacity(total);
        let mut items = Vec::with_capacity(total + 1);
        let mut pointers: HashMap<String, (String, DateTime<Utc>)> = HashMap::new();

        for (index, mut checkpoint) in checkpoints.into_iter().enumerate() {
            checkpoint.assign_defaults();
            if let Err(e) = checkpoint.validate() {
                results[index] = Some(Err(e));
                continue;
            }
            match self.inner.repository.encode(&checkpoint).await {
                Ok(encoded) => {
                    let size = encoded.bytes.len() as u64;
                    items.push((encoded.key, encoded.bytes));
                    pointers.insert(
                        checkpoint.workflow_id.clone(),
                        (checkpoint.id.clone(), checkpoint.created_at()),
                    );
                    staged.push((index, checkpoint, size));
                }
                Err(e) => results[index] = Some(Err(e)),
            }
        }

        if !staged.is_empty() {
            let start = Instant::now();
            let written = match pointer_items(&pointers) {
                Ok(pointer_items) => {
                    items.extend(pointer_items);
                    let _guard = self.inner.op_lock.write().await;
                    self.inner.repository.store().batch_put(&items).await
                }
                Err(e) => Err(e),
            };
            let elapsed = start.elapsed();

            match written {
                Ok(()) => {
                    debug!(count = staged.len(), "Batch of checkpoints saved");
                    for (index, checkpoint, size) in staged {
                        self.inner.performance.record_save(elapsed, Some(size));
                        results[index] = Some(Ok(checkpoint));
                    }
                    for workflow_id in pointers.keys() {
                        self.schedule_eviction(workflow_id);
                    }
                }
                Err(e) => {
                    warn!(count = staged.len(), error = %e, "Batch checkpoint write failed");
                    let message = e.to_string();
                    for (index, _, _) in staged {
                        self.inner.performance.record_save(elapsed, None);
                        results[index] = Some(Err(CheckpointError::storage(format!(
                            "batch write failed: {message}"
                        ))));
                    }
                }
            }
        }

        results
            .into_iter()
            .map(|result| {
                result.unwrap_or_else(|| {
                    Err(CheckpointError::storage("batch entry was not processed"))
                })
            })
            .collect()
    }

    /// Delete several checkpoints with one backend batch call
    ///
    /// Ids that do not exist are ignored by the backend.
    pub(crate) async fn delete_many(&self, targets: Vec<(String, String)>) -> Vec<Result<()>> {
        let total = targets.len();
        if self.ensure_open().is_err() {
            return (0..total).map(|_| Err(closed_error())).collect();
        }

        let keys: Vec<String> = targets
            .iter()
            .map(|(workflow_id, checkpoint_id)| checkpoint_key(workflow_id, checkpoint_id))
            .collect();

        let _guard = self.inner.op_lock.write().await;
        match self.inner.repository.store().batch_delete(&keys).await {
            Ok(()) => {
                let workflows: BTreeSet<String> =
                    targets.into_iter().map(|(workflow_id, _)| workflow_id).collect();
                self.inner.repository.repair_pointers(&workflows).await;
                debug!(count = total, "Batch of checkpoints deleted");
                (0..total).map(|_| Ok(())).collect()
            }
            Err(e) => {
                warn!(count = total, error = %e, "Batch checkpoint delete failed");
                let message = e.to_string();
                (0..total)
                    .map(|_| Err(CheckpointError::storage(format!("batch delete failed: {message}"))))
                    .collect()
            }
        }
    }

    fn schedule_eviction(&self, workflow_id: &str) {
        if self.inner.config.max_checkpoints == 0 {
            return;
        }
        let evictions = lock(&self.inner.evictions);
        let Some(sender) = evictions.as_ref() else {
            return;
        };
        match sender.try_send(workflow_id.to_string()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(workflow_id, "Eviction queue full, skipping cap enforcement for this save");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(workflow_id, "Eviction worker stopped");
            }
        }
    }

    async fn repair_pointer(&self, workflow_id: &str) {
        if let Err(e) = self.inner.repository.repair_pointer(workflow_id).await {
            warn!(workflow_id, error = %e, "Failed to repair latest pointer");
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(closed_error())
        } else {
            Ok(())
        }
    }
}

fn closed_error() -> CheckpointError {
    CheckpointError::Closed("checkpoint manager is closed".to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn pointer_items(
    pointers: &HashMap<String, (String, DateTime<Utc>)>,
) -> Result<Vec<(String, Vec<u8>)>> {
    pointers
        .iter()
        .map(|(workflow_id, (checkpoint_id, timestamp))| {
            pointer_entry(workflow_id, checkpoint_id, *timestamp)
        })
        .collect()
}

#[cfg(feature = "metrics")]
fn new_performance_manager() -> Result<PerformanceManager> {
    Ok(PerformanceManager::with_metrics(
        crate::observability::CheckpointMetrics::new()?,
    ))
}

#[cfg(not(feature = "metrics"))]
fn new_performance_manager() -> Result<PerformanceManager> {
    Ok(PerformanceManager::new())
}

/// Delete everything beyond the newest `max` checkpoints of a workflow
async fn evict_oldest(
    repository: &CheckpointRepository,
    workflow_id: &str,
    max: usize,
) -> Result<usize> {
    let infos = repository.list(workflow_id).await?;
    if infos.len() <= max {
        return Ok(0);
    }

    let mut evicted = 0;
    for info in &infos[max..] {
        match repository.delete(workflow_id, &info.id).await {
            Ok(()) => evicted += 1,
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(
                workflow_id,
                checkpoint_id = %info.id,
                error = %e,
                "Failed to evict checkpoint"
            ),
        }
    }
    if evicted > 0 {
        repository.repair_pointer(workflow_id).await?;
        debug!(workflow_id, evicted, "Evicted checkpoints over the cap");
    }
    Ok(evicted)
}

async fn run_eviction_worker(
    repository: Arc<CheckpointRepository>,
    op_lock: Arc<RwLock<()>>,
    max: usize,
    mut queue: mpsc::Receiver<String>,
) {
    while let Some(workflow_id) = queue.recv().await {
        let _guard = op_lock.write().await;
        if let Err(e) = evict_oldest(&repository, &workflow_id, max).await {
            warn!(workflow_id = %workflow_id, error = %e, "Background eviction failed");
        }
    }
    debug!("Eviction worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn config(max_checkpoints: usize) -> ManagerConfig {
        ManagerConfig {
            max_checkpoints,
            ..ManagerConfig::default()
        }
    }

    fn manager(max_checkpoints: usize) -> CheckpointManager {
        CheckpointManager::new(Arc::new(MemoryStore::new()), config(max_checkpoints)).unwrap()
    }

    fn at(minutes_ago: i64) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::minutes(minutes_ago)
    }

    #[tokio::test]
    async fn test_save_assigns_defaults() {
        let manager = manager(0);
        let saved = manager
            .save(Checkpoint::new("w1", "start", json!({"step": 1})))
            .await
            .unwrap();

        assert!(!saved.id.is_empty());
        assert_eq!(saved.version, 1);
        assert!(saved.timestamp.is_some());
        assert_eq!(manager.load("w1").await.unwrap(), saved);
    }

    #[tokio::test]
    async fn test_save_rejects_invalid() {
        let manager = manager(0);
        let err = manager
            .save(Checkpoint::new("", "start", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Validation(_)));

        let err = manager
            .save(Checkpoint::new("w1", "start", serde_json::Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Validation(_)));
    }

    #[tokio::test]
    async fn test_load_without_pointer_is_not_found() {
        let manager = manager(0);
        assert!(manager.load("ghost").await.unwrap_err().is_not_found());
        assert!(manager.load_by_id("ghost", "x").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_repoints_latest() {
        let manager = manager(0);
        let a = manager
            .save(Checkpoint::new("w1", "a", json!(1)).with_timestamp(at(2)))
            .await
            .unwrap();
        let b = manager
            .save(Checkpoint::new("w1", "b", json!(2)).with_timestamp(at(1)))
            .await
            .unwrap();

        manager.delete("w1", &b.id).await.unwrap();
        assert_eq!(manager.load("w1").await.unwrap().id, a.id);

        manager.delete("w1", &a.id).await.unwrap();
        assert!(manager.load("w1").await.unwrap_err().is_not_found());
        assert!(manager.delete("w1", &a.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_all_clears_pointer() {
        let manager = manager(0);
        for i in 0..3 {
            manager
                .save(Checkpoint::new("w1", "n", json!(i)))
                .await
                .unwrap();
        }
        manager.save(Checkpoint::new("w2", "n", json!(0))).await.unwrap();

        assert_eq!(manager.delete_all("w1").await.unwrap(), 3);
        assert!(manager.list("w1").await.unwrap().is_empty());
        assert!(manager.load("w1").await.unwrap_err().is_not_found());
        assert_eq!(manager.list("w2").await.unwrap().len(), 1);

        // Nothing left to delete is not an error
        assert_eq!(manager.delete_all("w1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_evict_excess_keeps_newest() {
        let manager = manager(2);
        let mut ids = Vec::new();
        for minutes in [4, 3, 2, 1] {
            let saved = manager
                .save(Checkpoint::new("w1", "n", json!(minutes)).with_timestamp(at(minutes)))
                .await
                .unwrap();
            ids.push(saved.id);
        }
        manager.evict_excess("w1").await.unwrap();

        let remaining: Vec<String> = manager
            .list("w1")
            .await
            .unwrap()
            .into_iter()
            .map(|info| info.id)
            .collect();
        assert_eq!(remaining, vec![ids[3].clone(), ids[2].clone()]);
        assert_eq!(manager.load("w1").await.unwrap().id, ids[3]);
    }

    #[tokio::test]
    async fn test_cleanup_spans_workflows() {
        let manager = manager(0);
        manager
            .save(Checkpoint::new("w1", "n", json!(1)).with_timestamp(at(120)))
            .await
            .unwrap();
        let fresh = manager
            .save(Checkpoint::new("w1", "n", json!(2)).with_timestamp(at(1)))
            .await
            .unwrap();
        manager
            .save(Checkpoint::new("w2", "n", json!(3)).with_timestamp(at(90)))
            .await
            .unwrap();

        let deleted = manager.cleanup(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(manager.list_workflows().await.unwrap(), vec!["w1"]);
        assert_eq!(manager.load("w1").await.unwrap().id, fresh.id);
        assert!(manager.load("w2").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_should_checkpoint() {
        let manager = manager(0);
        assert!(manager.should_checkpoint(CheckpointType::Manual, Some(Utc::now())));
        assert!(manager.should_checkpoint(CheckpointType::AfterStep, None));
        assert!(!manager.should_checkpoint(CheckpointType::BeforeStep, None));
        assert!(manager.should_checkpoint(CheckpointType::Auto, None));
        assert!(!manager.should_checkpoint(CheckpointType::Auto, Some(Utc::now())));
        assert!(manager.should_checkpoint(CheckpointType::Auto, Some(at(1))));
    }

    #[tokio::test]
    async fn test_close_rejects_further_calls() {
        let manager = manager(5);
        manager.save(Checkpoint::new("w1", "n", json!(1))).await.unwrap();
        manager.close().await.unwrap();
        manager.close().await.unwrap();

        assert!(matches!(
            manager.load("w1").await.unwrap_err(),
            CheckpointError::Closed(_)
        ));
        assert!(matches!(
            manager.save(Checkpoint::new("w1", "n", json!(2))).await.unwrap_err(),
            CheckpointError::Closed(_)
        ));
    }

    #[tokio::test]
    async fn test_save_many_moves_pointer_to_last() {
        let manager = manager(0);
        let results = manager
            .save_many(vec![
                Checkpoint::new("w1", "a", json!(1)),
                Checkpoint::new("", "bad", json!(2)),
                Checkpoint::new("w1", "b", json!(3)).with_id("last"),
            ])
            .await;

        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(CheckpointError::Validation(_))));
        assert_eq!(results[2].as_ref().unwrap().id, "last");
        assert_eq!(manager.load("w1").await.unwrap().id, "last");
        assert_eq!(manager.performance().stats().save.count, 2);
    }

    #[tokio::test]
    async fn test_delete_many_repairs_pointer() {
        let manager = manager(0);
        let a = manager
            .save(Checkpoint::new("w1", "a", json!(1)).with_timestamp(at(2)))
            .await
            .unwrap();
        let b = manager
            .save(Checkpoint::new("w1", "b", json!(2)).with_timestamp(at(1)))
            .await
            .unwrap();

        let results = manager
            .delete_many(vec![
                ("w1".to_string(), b.id.clone()),
                ("w1".to_string(), "missing".to_string()),
            ])
            .await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(manager.load("w1").await.unwrap().id, a.id);
    }

    #[tokio::test]
    async fn test_performance_recorded() {
        let manager = manager(0);
        manager.save(Checkpoint::new("w1", "n", json!(1))).await.unwrap();
        manager.load("w1").await.unwrap();
        let _ = manager.load("missing").await;

        let stats = manager.performance().stats();
        assert_eq!(stats.save.count, 1);
        assert_eq!(stats.load.count, 2);
        assert_eq!(stats.load.failures, 1);
        assert!(stats.bytes_saved > 0);
    }

    #[test]
    fn test_new_requires_runtime() {
        let err = CheckpointManager::new(Arc::new(MemoryStore::new()), config(0)).unwrap_err();
        assert!(matches!(err, CheckpointError::Config(_)));
    }

    #[tokio::test]
    async fn test_zero_cleanup_interval_without_auto_cleanup() {
        let config = ManagerConfig {
            auto_cleanup: false,
            cleanup_interval: Duration::ZERO,
            max_checkpoints: 0,
            ..ManagerConfig::default()
        };
        let manager = CheckpointManager::new(Arc::new(MemoryStore::new()), config).unwrap();
        assert!(!manager.cleaner().is_running());
        // Manual passes still work; only the loop needs an interval
        manager.cleaner().run_once().await.unwrap();
        assert!(matches!(
            manager.cleaner().start(),
            Err(CheckpointError::Config(_))
        ));

        let err = CheckpointManager::new(
            Arc::new(MemoryStore::new()),
            ManagerConfig {
                auto_cleanup: true,
                cleanup_interval: Duration::ZERO,
                ..ManagerConfig::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, CheckpointError::Config(_)));
    }
}
