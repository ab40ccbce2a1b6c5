/*!
# Waypoint Core Engine

Checkpoint persistence for resumable workflows.

This crate saves durable, timestamped snapshots of workflow execution state
and restores them after a crash or restart, with support for:

- Pluggable storage backends (memory, filesystem, SQLite, Redis) behind one
  [`StateStore`] contract
- Policy-driven compression (deflate, LZW, or per-payload entropy selection)
  bounded by a deadline
- Per-workflow checkpoint caps and background retention policies
- Request batching and latency tracking

## Architecture

The core follows hexagonal architecture principles:
- [`CheckpointManager`] holds the domain logic: ids, versions, key layout and
  the latest pointer of each workflow
- Storage backends are adapters selected by [`StorageConfig`]
- The [`AutoCleaner`] and [`BatchManager`] build on the manager's store

## Usage

```rust,no_run
use serde_json::json;
use waypoint_core::{Checkpoint, CheckpointManager, ManagerConfig, StorageConfig};

# async fn demo() -> waypoint_core::Result<()> {
let storage = StorageConfig::from_uri("file:///var/lib/waypoint")?;
let manager = CheckpointManager::open(&storage, ManagerConfig::default()).await?;

// Save a checkpoint after a step completes
let checkpoint = Checkpoint::new("order-42", "charge-card", json!({"attempt": 1}))
    .with_completed_nodes(["validate", "reserve"]);
manager.save(checkpoint).await?;

// Resume from the latest checkpoint
let latest = manager.load("order-42").await?;
println!("resuming at {}", latest.current_node);

manager.close().await?;
# Ok(())
# }
```
*/

pub mod batch;
pub mod checkpoint;
pub mod cleaner;
pub mod compression;
pub mod config;
pub mod envelope;
pub mod error;
pub mod manager;
pub mod observability;
pub mod performance;
pub mod repository;
pub mod storage;

pub use batch::{BatchManager, BatchStats};
pub use checkpoint::{Checkpoint, CheckpointInfo, CheckpointType, LatestPointer};
pub use cleaner::{AutoCleaner, CleanerStats, CleanupReport};
pub use compression::{CompressedData, CompressionAlgorithm, CompressionStats, Compressor};
pub use config::{
    BatchConfig, CleanupConfig, CompressionConfig, ManagerConfig, RedisOptions, RedisTopology,
    SqliteOptions, StorageBackend, StorageConfig,
};
pub use envelope::{CheckpointCodec, StoredEnvelope};
pub use error::{CheckpointError, Result};
pub use manager::CheckpointManager;
pub use performance::{OperationStats, PerformanceManager, PerformanceStats};
pub use storage::{open_store, FileStore, MemoryStore, StateStore, StoreCapabilities, StoreStats};
