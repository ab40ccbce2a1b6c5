/*!
Background retention sweeper.

One pass runs three policies in order, each counted separately:

1. **Age**: checkpoints older than `max_age` are deleted.
2. **Count**: each workflow is trimmed to its newest `min_keep_count`.
3. **Size**: only when the backend reports more than `max_storage_size`
   bytes, the oldest checkpoints go first, at most
   [`SIZE_POLICY_MAX_DELETIONS`] per pass.

No policy ever takes a workflow below `min_keep_count`. Individual delete
failures are logged and counted; an error listing or sizing the store aborts
the pass and is reported to the caller (or logged by the scheduler loop,
which keeps ticking).
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointInfo;
use crate::config::{duration_ms, CleanupConfig};
use crate::repository::{group_by_workflow, CheckpointRepository};
use crate::{CheckpointError, Result};

/// Upper bound on size-policy deletions in a single pass
pub const SIZE_POLICY_MAX_DELETIONS: usize = 10;

/// Outcome of one cleanup pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub age_deleted: usize,
    pub count_deleted: usize,
    pub size_deleted: usize,
    /// Deletes that failed and were skipped
    pub failed: usize,
    /// Whether the backend was over its size budget this pass
    pub size_policy_triggered: bool,
}

impl CleanupReport {
    pub fn total_deleted(&self) -> usize {
        self.age_deleted + self.count_deleted + self.size_deleted
    }
}

/// Cumulative figures across every pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanerStats {
    pub runs: u64,
    pub failed_runs: u64,
    pub total_age_deleted: u64,
    pub total_count_deleted: u64,
    pub total_size_deleted: u64,
    pub last_report: Option<CleanupReport>,
    pub last_error: Option<String>,
}

struct Running {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

struct CleanerInner {
    repository: Arc<CheckpointRepository>,
    config: CleanupConfig,
    /// Held exclusively for the duration of a pass when shared with a manager
    op_lock: Option<Arc<RwLock<()>>>,
    running: Mutex<Option<Running>>,
    stats: Mutex<CleanerStats>,
}

/// Retention policy engine running on a fixed interval
///
/// Cloning yields another handle to the same cleaner.
#[derive(Clone)]
pub struct AutoCleaner {
    inner: Arc<CleanerInner>,
}

impl std::fmt::Debug for AutoCleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoCleaner")
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .finish()
    }
}

impl AutoCleaner {
    pub fn new(repository: Arc<CheckpointRepository>, config: CleanupConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(repository, config, None))
    }

    /// Share a manager's operation lock so passes never interleave with saves
    ///
    /// The interval is checked by [`start`](Self::start), so a manager that
    /// never starts the loop can still run manual passes.
    pub(crate) fn with_lock(
        repository: Arc<CheckpointRepository>,
        config: CleanupConfig,
        op_lock: Arc<RwLock<()>>,
    ) -> Self {
        Self::build(repository, config, Some(op_lock))
    }

    fn build(
        repository: Arc<CheckpointRepository>,
        config: CleanupConfig,
        op_lock: Option<Arc<RwLock<()>>>,
    ) -> Self {
        Self {
            inner: Arc::new(CleanerInner {
                repository,
                config,
                op_lock,
                running: Mutex::new(None),
                stats: Mutex::new(CleanerStats::default()),
            }),
        }
    }

    pub fn config(&self) -> &CleanupConfig {
        &self.inner.config
    }

    /// Start the background loop; the first pass runs one interval from now
    ///
    /// Fails when cleanup is disabled, when already running, or outside a
    /// Tokio runtime.
    pub fn start(&self) -> Result<()> {
        if !self.inner.config.enabled {
            return Err(CheckpointError::config("auto-cleanup is disabled"));
        }
        self.inner.config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            CheckpointError::config("auto-cleaner must be started inside a Tokio runtime")
        })?;

        let mut running = self.lock_running();
        if running.is_some() {
            return Err(CheckpointError::validation("auto-cleaner is already running"));
        }

        let shutdown = CancellationToken::new();
        let cleaner = self.clone();
        let token = shutdown.clone();
        let interval = self.inner.config.interval;
        let handle = runtime.spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = cleaner.run_once().await {
                            error!(error = %e, "Cleanup pass failed");
                        }
                    }
                }
            }
            debug!("Auto-cleaner loop stopped");
        });

        *running = Some(Running { shutdown, handle });
        info!(interval = ?interval, "Auto-cleaner started");
        Ok(())
    }

    /// Stop the background loop and wait for an in-flight pass to finish
    ///
    /// A no-op when not running.
    pub async fn stop(&self) {
        let running = self.lock_running().take();
        if let Some(Running { shutdown, handle }) = running {
            shutdown.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Auto-cleaner task ended abnormally");
            }
            info!("Auto-cleaner stopped");
        }
    }

    /// Signal the loop to stop without waiting for it
    pub(crate) fn cancel(&self) {
        if let Some(running) = self.lock_running().take() {
            running.shutdown.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    pub fn stats(&self) -> CleanerStats {
        self.inner
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run one pass of all three policies now
    pub async fn run_once(&self) -> Result<CleanupReport> {
        let _guard = match &self.inner.op_lock {
            Some(lock) => Some(lock.write().await),
            None => None,
        };

        let result = self.run_policies().await;

        let mut stats = self.inner.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.runs += 1;
        match &result {
            Ok(report) => {
                stats.total_age_deleted += report.age_deleted as u64;
                stats.total_count_deleted += report.count_deleted as u64;
                stats.total_size_deleted += report.size_deleted as u64;
                stats.last_report = Some(report.clone());
                stats.last_error = None;
            }
            Err(e) => {
                stats.failed_runs += 1;
                stats.last_error = Some(e.to_string());
            }
        }
        result
    }

    async fn run_policies(&self) -> Result<CleanupReport> {
        let started_at = Utc::now();
        let start = Instant::now();
        let config = &self.inner.config;
        let repository = &self.inner.repository;

        let mut remaining = repository.list_all().await?;
        let mut touched = BTreeSet::new();
        let mut failed = 0;

        let age_victims = age_policy(&remaining, started_at, config);
        let age_deleted = self
            .delete_all(&age_victims, &mut remaining, &mut touched, &mut failed)
            .await;

        let count_victims = count_policy(&remaining, config.min_keep_count);
        let count_deleted = self
            .delete_all(&count_victims, &mut remaining, &mut touched, &mut failed)
            .await;

        let mut size_deleted = 0;
        let size_policy_triggered = match repository.stats().await? {
            Some(stats) if stats.total_size > config.max_storage_size => {
                let size_victims = size_policy(&remaining, config.min_keep_count);
                size_deleted = self
                    .delete_all(&size_victims, &mut remaining, &mut touched, &mut failed)
                    .await;
                true
            }
            Some(_) => false,
            None => {
                debug!(
                    backend = repository.store().backend_name(),
                    "Backend reports no size; skipping size policy"
                );
                false
            }
        };

        repository.repair_pointers(&touched).await;

        let report = CleanupReport {
            started_at,
            duration: start.elapsed(),
            age_deleted,
            count_deleted,
            size_deleted,
            failed,
            size_policy_triggered,
        };
        if report.total_deleted() > 0 || failed > 0 {
            info!(
                age_deleted,
                count_deleted,
                size_deleted,
                failed,
                duration = ?report.duration,
                "Cleanup pass completed"
            );
        } else {
            debug!(duration = ?report.duration, "Cleanup pass found nothing to delete");
        }
        Ok(report)
    }

    /// Delete `victims`, dropping each from `remaining`; returns how many went
    async fn delete_all(
        &self,
        victims: &[CheckpointInfo],
        remaining: &mut Vec<CheckpointInfo>,
        touched: &mut BTreeSet<String>,
        failed: &mut usize,
    ) -> usize {
        let mut deleted = 0;
        for victim in victims {
            match self
                .inner
                .repository
                .delete(&victim.workflow_id, &victim.id)
                .await
            {
                Ok(()) => deleted += 1,
                // Someone else got there first; the record is gone either way
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(
                        workflow_id = %victim.workflow_id,
                        checkpoint_id = %victim.id,
                        error = %e,
                        "Failed to delete checkpoint during cleanup"
                    );
                    *failed += 1;
                    continue;
                }
            }
            touched.insert(victim.workflow_id.clone());
            remaining.retain(|info| !(info.workflow_id == victim.workflow_id && info.id == victim.id));
        }
        deleted
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.inner.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Checkpoints past `max_age`, sparing each workflow's newest `min_keep_count`
///
/// `infos` must be sorted newest first.
fn age_policy(
    infos: &[CheckpointInfo],
    now: DateTime<Utc>,
    config: &CleanupConfig,
) -> Vec<CheckpointInfo> {
    let Some(cutoff) = chrono::Duration::from_std(config.max_age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
    else {
        return Vec::new();
    };

    group_by_workflow(infos)
        .into_values()
        .flat_map(|group| group.into_iter().skip(config.min_keep_count))
        .filter(|info| info.timestamp < cutoff)
        .cloned()
        .collect()
}

/// Everything beyond each workflow's newest `min_keep_count`; zero disables
fn count_policy(infos: &[CheckpointInfo], min_keep_count: usize) -> Vec<CheckpointInfo> {
    if min_keep_count == 0 {
        return Vec::new();
    }
    group_by_workflow(infos)
        .into_values()
        .flat_map(|group| group.into_iter().skip(min_keep_count))
        .cloned()
        .collect()
}

/// Oldest checkpoints first, bounded per pass, never below the floor
fn size_policy(infos: &[CheckpointInfo], min_keep_count: usize) -> Vec<CheckpointInfo> {
    let mut per_workflow: HashMap<&str, usize> = HashMap::new();
    for info in infos {
        *per_workflow.entry(info.workflow_id.as_str()).or_default() += 1;
    }

    let mut oldest_first: Vec<&CheckpointInfo> = infos.iter().collect();
    oldest_first.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

    let mut victims = Vec::new();
    for info in oldest_first {
        if victims.len() >= SIZE_POLICY_MAX_DELETIONS {
            break;
        }
        let Some(count) = per_workflow.get_mut(info.workflow_id.as_str()) else {
            continue;
        };
        if *count <= min_keep_count {
            continue;
        }
        *count -= 1;
        victims.push(info.clone());
    }
    victims
}
