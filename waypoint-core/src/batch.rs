//! Request coalescing in front of a [`CheckpointManager`]
//!
//! Callers submit single saves and deletes; a background task flushes the
//! queue when it reaches `batch_size` or every `flush_timeout`, whichever
//! comes first. Against a backend with native batch support a flush issues
//! one batch write and one batch delete; otherwise each request goes through
//! the manager individually. Every caller waits on its own reply channel.
//!
//! Dropping a pending `save` or `delete` future stops the caller waiting but
//! does not withdraw the request: it is still written at the next flush.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::checkpoint::Checkpoint;
use crate::config::BatchConfig;
use crate::manager::CheckpointManager;
use crate::{CheckpointError, Result};

enum PendingOp {
    Save {
        checkpoint: Checkpoint,
        reply: oneshot::Sender<Result<Checkpoint>>,
    },
    Delete {
        workflow_id: String,
        checkpoint_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Counters across every flush
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    pub flushes: u64,
    pub saves: u64,
    pub deletes: u64,
    /// Backend batch calls issued
    pub native_batches: u64,
    /// Requests served one at a time through the manager
    pub individual_ops: u64,
    pub failures: u64,
}

struct BatchInner {
    manager: CheckpointManager,
    config: BatchConfig,
    queue: Mutex<Vec<PendingOp>>,
    closed: AtomicBool,
    flush_requested: Notify,
    /// One flush at a time keeps request order per workflow
    flushing: tokio::sync::Mutex<()>,
    stats: Mutex<BatchStats>,
}

/// Queues checkpoint writes and applies them in batches
pub struct BatchManager {
    inner: Arc<BatchInner>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    _shutdown_guard: DropGuard,
}

impl std::fmt::Debug for BatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchManager")
            .field("config", &self.inner.config)
            .field("pending", &self.pending())
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl BatchManager {
    /// Start a batch manager over `manager`; needs a Tokio runtime
    pub fn new(manager: CheckpointManager, config: BatchConfig) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            CheckpointError::config("batch manager must be created inside a Tokio runtime")
        })?;

        let inner = Arc::new(BatchInner {
            manager,
            config,
            queue: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            flush_requested: Notify::new(),
            flushing: tokio::sync::Mutex::new(()),
            stats: Mutex::new(BatchStats::default()),
        });

        let shutdown = CancellationToken::new();
        let worker = runtime.spawn(run_flush_loop(Arc::clone(&inner), shutdown.clone()));
        debug!(
            batch_size = inner.config.batch_size,
            flush_timeout = ?inner.config.flush_timeout,
            native = inner.manager.store_capabilities().batch,
            "Batch manager started"
        );

        Ok(Self {
            inner,
            _shutdown_guard: shutdown.clone().drop_guard(),
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue a save and wait for its batch to be written
    pub async fn save(&self, checkpoint: Checkpoint) -> Result<Checkpoint> {
        let (reply, response) = oneshot::channel();
        self.enqueue(PendingOp::Save { checkpoint, reply })?;
        response.await.map_err(|_| dropped_request())?
    }

    /// Queue a delete and wait for its batch to be applied
    ///
    /// With native batching, deleting an id that does not exist succeeds.
    pub async fn delete(&self, workflow_id: &str, checkpoint_id: &str) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.enqueue(PendingOp::Delete {
            workflow_id: workflow_id.to_string(),
            checkpoint_id: checkpoint_id.to_string(),
            reply,
        })?;
        response.await.map_err(|_| dropped_request())?
    }

    /// Flush everything queued now; returns how many requests were applied
    pub async fn flush(&self) -> usize {
        self.inner.flush().await
    }

    /// Requests waiting for the next flush
    pub fn pending(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    pub fn stats(&self) -> BatchStats {
        lock(&self.inner.stats).clone()
    }

    /// Stop accepting requests and drain the queue
    ///
    /// Every request queued before this call is applied and answered. Later
    /// submissions fail with `CheckpointError::Closed`.
    pub async fn stop(&self) {
        {
            let _queue = lock(&self.inner.queue);
            if self.inner.closed.swap(true, Ordering::SeqCst) {
                return;
            }
        }
        self.shutdown.cancel();

        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Batch flush task ended abnormally");
            }
        }
        // The loop drains on exit; this covers a loop that died early
        self.inner.flush().await;
        info!("Batch manager stopped");
    }

    fn enqueue(&self, op: PendingOp) -> Result<()> {
        let queued = {
            let mut queue = lock(&self.inner.queue);
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(CheckpointError::Closed(
                    "batch manager is stopped".to_string(),
                ));
            }
            queue.push(op);
            queue.len()
        };
        if queued >= self.inner.config.batch_size {
            self.inner.flush_requested.notify_one();
        }
        Ok(())
    }
}

impl BatchInner {
    async fn flush(&self) -> usize {
        let _flushing = self.flushing.lock().await;
        let pending = std::mem::take(&mut *lock(&self.queue));
        if pending.is_empty() {
            return 0;
        }
        let total = pending.len();

        let mut saves = Vec::new();
        let mut deletes = Vec::new();
        for op in pending {
            match op {
                PendingOp::Save { checkpoint, reply } => saves.push((checkpoint, reply)),
                PendingOp::Delete {
                    workflow_id,
                    checkpoint_id,
                    reply,
                } => deletes.push(((workflow_id, checkpoint_id), reply)),
            }
        }

        let native = self.manager.store_capabilities().batch;
        let mut stats = BatchStats {
            flushes: 1,
            saves: saves.len() as u64,
            deletes: deletes.len() as u64,
            ..BatchStats::default()
        };

        for chunk in into_chunks(saves, self.config.batch_size) {
            let (checkpoints, replies): (Vec<_>, Vec<_>) = chunk.into_iter().unzip();
            let results = if native {
                stats.native_batches += 1;
                self.manager.save_many(checkpoints).await
            } else {
                stats.individual_ops += checkpoints.len() as u64;
                let mut results = Vec::with_capacity(checkpoints.len());
                for checkpoint in checkpoints {
                    results.push(self.manager.save(checkpoint).await);
                }
                results
            };
            stats.failures += deliver(replies, results);
        }

        for chunk in into_chunks(deletes, self.config.batch_size) {
            let (targets, replies): (Vec<_>, Vec<_>) = chunk.into_iter().unzip();
            let results = if native {
                stats.native_batches += 1;
                self.manager.delete_many(targets).await
            } else {
                stats.individual_ops += targets.len() as u64;
                let mut results = Vec::with_capacity(targets.len());
                for (workflow_id, checkpoint_id) in targets {
                    results.push(self.manager.delete(&workflow_id, &checkpoint_id).await);
                }
                results
            };
            stats.failures += deliver(replies, results);
        }

        debug!(
            requests = total,
            native,
            failures = stats.failures,
            "Batch flushed"
        );
        let mut totals = lock(&self.stats);
        totals.flushes += stats.flushes;
        totals.saves += stats.saves;
        totals.deletes += stats.deletes;
        totals.native_batches += stats.native_batches;
        totals.individual_ops += stats.individual_ops;
        totals.failures += stats.failures;
        total
    }
}

async fn run_flush_loop(inner: Arc<BatchInner>, shutdown: CancellationToken) {
    let period = inner.config.flush_timeout;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = inner.flush_requested.notified() => {}
            _ = ticker.tick() => {}
        }
        inner.flush().await;
    }
    inner.flush().await;
    debug!("Batch flush loop stopped");
}

/// Send each result to its caller; returns how many were errors
fn deliver<T>(replies: Vec<oneshot::Sender<Result<T>>>, results: Vec<Result<T>>) -> u64 {
    let mut failures = 0;
    for (reply, result) in replies.into_iter().zip(results) {
        if result.is_err() {
            failures += 1;
        }
        // The caller may have stopped waiting
        let _ = reply.send(result);
    }
    failures
}

fn into_chunks<T>(mut items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let mut chunks = Vec::new();
    while items.len() > size {
        let rest = items.split_off(size);
        chunks.push(items);
        items = rest;
    }
    if !items.is_empty() {
        chunks.push(items);
    }
    chunks
}

fn dropped_request() -> CheckpointError {
    CheckpointError::Cancelled("batch request dropped before completion".to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
