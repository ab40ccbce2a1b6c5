/*!
Integration tests for checkpoint caps and retention policies.
*/

use chrono::{Duration as ChronoDuration, Utc};
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use waypoint_core::{
    Checkpoint, CheckpointManager, CleanupConfig, ManagerConfig, MemoryStore,
};

fn hours_ago(hours: i64) -> chrono::DateTime<Utc> {
    Utc::now() - ChronoDuration::hours(hours)
}

#[tokio::test]
async fn test_cap_enforced_in_background() {
    let config = ManagerConfig {
        max_checkpoints: 3,
        ..ManagerConfig::default()
    };
    let manager = CheckpointManager::new(Arc::new(MemoryStore::new()), config).unwrap();

    let mut saved = Vec::new();
    for i in 0..8i64 {
        let checkpoint = Checkpoint::new("capped", "n", json!({"i": i}))
            .with_timestamp(Utc::now() - ChronoDuration::seconds(100 - i));
        saved.push(manager.save(checkpoint).await.unwrap().id);
    }

    // Eviction runs after saves return; poll until it settles
    let mut remaining = Vec::new();
    for _ in 0..200 {
        remaining = manager
            .list("capped")
            .await
            .unwrap()
            .into_iter()
            .map(|info| info.id)
            .collect::<Vec<_>>();
        if remaining.len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let newest: Vec<String> = saved.iter().rev().take(3).cloned().collect();
    assert_eq!(remaining, newest);
    assert_eq!(manager.load("capped").await.unwrap().id, saved[7]);
}

#[tokio::test]
async fn test_cap_is_per_workflow() {
    let store = Arc::new(MemoryStore::new());
    let config = ManagerConfig {
        max_checkpoints: 2,
        ..ManagerConfig::default()
    };
    let manager = CheckpointManager::new(store.clone(), config).unwrap();

    for workflow in ["a", "b"] {
        for i in 0..4i64 {
            manager
                .save(
                    Checkpoint::new(workflow, "n", json!(i))
                        .with_timestamp(Utc::now() - ChronoDuration::seconds(10 - i)),
                )
                .await
                .unwrap();
        }
    }
    // Close drains queued evictions before releasing the store
    manager.close().await.unwrap();

    let inspector = CheckpointManager::new(store, ManagerConfig::default()).unwrap();
    assert_eq!(inspector.list("a").await.unwrap().len(), 2);
    assert_eq!(inspector.list("b").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_explicit_eviction_is_synchronous() {
    let store = Arc::new(MemoryStore::new());
    let uncapped = CheckpointManager::new(
        store.clone(),
        ManagerConfig {
            max_checkpoints: 0,
            ..ManagerConfig::default()
        },
    )
    .unwrap();
    for i in 0..5i64 {
        uncapped
            .save(Checkpoint::new("w", "n", json!(i)).with_timestamp(hours_ago(5 - i)))
            .await
            .unwrap();
    }

    let capped = CheckpointManager::new(
        store,
        ManagerConfig {
            max_checkpoints: 2,
            ..ManagerConfig::default()
        },
    )
    .unwrap();
    assert_eq!(capped.evict_excess("w").await.unwrap(), 3);
    assert_eq!(capped.list("w").await.unwrap().len(), 2);
    assert_eq!(capped.evict_excess("w").await.unwrap(), 0);
}

#[tokio::test]
async fn test_manager_cleaner_enforces_policies() {
    let config = ManagerConfig {
        max_checkpoints: 0,
        cleanup: CleanupConfig {
            max_age: Duration::from_secs(24 * 3600),
            min_keep_count: 2,
            ..CleanupConfig::default()
        },
        ..ManagerConfig::default()
    };
    let manager = CheckpointManager::new(Arc::new(MemoryStore::new()), config).unwrap();

    for (workflow, ages) in [("old", vec![100, 90, 80, 70]), ("busy", vec![5, 4, 3, 2, 1])] {
        for age in ages {
            manager
                .save(Checkpoint::new(workflow, "n", json!(age)).with_timestamp(hours_ago(age)))
                .await
                .unwrap();
        }
    }

    let report = manager.cleaner().run_once().await.unwrap();
    // "old" loses everything but its floor to age; "busy" is trimmed by count
    assert_eq!(report.age_deleted, 2);
    assert_eq!(report.count_deleted, 3);
    assert_eq!(manager.list("old").await.unwrap().len(), 2);
    assert_eq!(manager.list("busy").await.unwrap().len(), 2);
    assert_eq!(manager.cleaner().stats().runs, 1);
}

#[tokio::test]
async fn test_auto_cleanup_runs_in_background() {
    let config = ManagerConfig {
        max_checkpoints: 0,
        auto_cleanup: true,
        cleanup_interval: Duration::from_millis(20),
        cleanup: CleanupConfig {
            max_age: Duration::from_secs(3600),
            min_keep_count: 1,
            ..CleanupConfig::default()
        },
        ..ManagerConfig::default()
    };
    let manager = CheckpointManager::new(Arc::new(MemoryStore::new()), config).unwrap();
    assert!(manager.cleaner().is_running());

    for age in [30, 20, 10] {
        manager
            .save(Checkpoint::new("w", "n", json!(age)).with_timestamp(hours_ago(age)))
            .await
            .unwrap();
    }

    for _ in 0..200 {
        if manager.list("w").await.unwrap().len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(manager.list("w").await.unwrap().len(), 1);

    manager.close().await.unwrap();
    assert!(!manager.cleaner().is_running());
}

fn run_retention_pass(
    workflows: &BTreeMap<String, Vec<i64>>,
    max_age_hours: u64,
    min_keep: usize,
) -> (BTreeMap<String, usize>, BTreeMap<String, Vec<i64>>) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async {
        let config = ManagerConfig {
            max_checkpoints: 0,
            cleanup: CleanupConfig {
                max_age: Duration::from_secs(max_age_hours * 3600),
                min_keep_count: min_keep,
                max_storage_size: u64::MAX,
                ..CleanupConfig::default()
            },
            ..ManagerConfig::default()
        };
        let manager = CheckpointManager::new(Arc::new(MemoryStore::new()), config).unwrap();

        let mut before = BTreeMap::new();
        for (workflow, ages) in workflows {
            for age in ages {
                manager
                    .save(
                        Checkpoint::new(workflow.as_str(), "n", json!(age))
                            .with_timestamp(hours_ago(*age)),
                    )
                    .await
                    .unwrap();
            }
            before.insert(workflow.clone(), ages.len());
        }

        manager.cleaner().run_once().await.unwrap();

        let mut after = BTreeMap::new();
        for workflow in workflows.keys() {
            let ages: Vec<i64> = manager
                .list(workflow)
                .await
                .unwrap()
                .into_iter()
                .map(|info| (Utc::now() - info.timestamp).num_hours())
                .collect();
            after.insert(workflow.clone(), ages);
        }
        (before, after)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_retention_invariants(
        workflows in proptest::collection::btree_map(
            "[a-z]{1,6}",
            proptest::collection::vec(1i64..400, 1..8),
            1..4,
        ),
        max_age_hours in 1u64..300,
        min_keep in 0usize..4,
    ) {
        let (before, after) = run_retention_pass(&workflows, max_age_hours, min_keep);

        for (workflow, remaining) in &after {
            let started_with = before[workflow];
            // Never below the floor unless it started below it
            prop_assert!(remaining.len() >= min_keep.min(started_with));
            if min_keep > 0 {
                prop_assert!(remaining.len() <= min_keep);
            }
            // Anything past max_age survives only to protect the floor
            let expired = remaining.iter().filter(|age| **age >= max_age_hours as i64).count();
            if expired > 0 {
                prop_assert!(min_keep > 0 && remaining.len() <= min_keep);
            }
        }
    }
}
