/*!
SQLite storage adapter.

Keys live in a single table with creation/update timestamps and an optional
expiry. The connection runs in WAL mode and is shared behind a mutex; every
call hops onto the blocking pool. Busy/locked errors are retried with a short
backoff before surfacing.

When a TTL is configured, expired rows are invisible to reads immediately
and physically removed by a background sweep.
*/

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use waypoint_retry::{local_storage_backoff_policy, retry_blocking, RetryPolicy};

use super::{StateStore, StoreCapabilities, StoreStats};
use crate::config::SqliteOptions;
use crate::{CheckpointError, Result};

/// Current schema version
const SCHEMA_VERSION: i32 = 1;

/// Attempts for an operation that keeps hitting SQLITE_BUSY
const BUSY_RETRY_ATTEMPTS: usize = 5;

/// Time SQLite itself waits on a lock before reporting busy
const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

type SharedConnection = Arc<Mutex<Option<Connection>>>;

/// SQLite-backed store
///
/// # Example
/// ```rust,no_run
/// use waypoint_core::config::SqliteOptions;
/// use waypoint_core::storage::{SqliteStore, StateStore};
///
/// # async fn demo() -> waypoint_core::Result<()> {
/// let store = SqliteStore::open("/var/lib/waypoint/checkpoints.db", SqliteOptions::default())?;
/// store.put("checkpoint:w1:a", b"state").await?;
/// assert_eq!(store.get("checkpoint:w1:a").await?, b"state");
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SqliteStore {
    conn: SharedConnection,
    options: SqliteOptions,
    retry: Arc<RetryPolicy>,
    shutdown: CancellationToken,
    _sweeper: Option<DropGuard>,
}

impl SqliteStore {
    /// Open (creating if needed) the database file at `path`
    pub fn open<P: AsRef<Path>>(path: P, options: SqliteOptions) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                CheckpointError::storage(format!(
                    "Failed to create directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| sql_error(&format!("Failed to open {}", path.display()), e))?;
        info!(path = %path.display(), "Opened sqlite store");
        Self::setup_connection(conn, options)
    }

    /// Private in-memory database, useful for tests
    pub fn in_memory(options: SqliteOptions) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| sql_error("Failed to open in-memory database", e))?;
        Self::setup_connection(conn, options)
    }

    fn setup_connection(conn: Connection, options: SqliteOptions) -> Result<Self> {
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(|e| sql_error("Failed to set WAL mode", e))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| sql_error("Failed to set synchronous mode", e))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| sql_error("Failed to set busy timeout", e))?;

        init_schema(&conn)?;

        let conn: SharedConnection = Arc::new(Mutex::new(Some(conn)));
        let shutdown = CancellationToken::new();
        let sweeper = options
            .ttl
            .and_then(|_| spawn_sweeper(conn.clone(), options.sweep_interval, shutdown.clone()))
            .map(|_| shutdown.clone().drop_guard());

        Ok(Self {
            conn,
            options,
            retry: Arc::new(RetryPolicy::new(
                local_storage_backoff_policy(),
                BUSY_RETRY_ATTEMPTS,
            )),
            shutdown,
            _sweeper: sweeper,
        })
    }

    /// Delete every expired row now; returns how many were removed
    pub async fn purge_expired(&self) -> Result<usize> {
        self.with_conn("sqlite.purge_expired", purge_expired).await
    }

    fn expires_at(&self) -> Option<i64> {
        self.options.ttl.map(|ttl| {
            let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            now_millis().saturating_add(ttl_ms)
        })
    }

    async fn with_conn<T, F>(&self, op: &'static str, mut f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnMut(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        let retry = self.retry.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            let conn = guard
                .as_mut()
                .ok_or_else(|| CheckpointError::Closed("sqlite store is closed".to_string()))?;
            retry_blocking(op, &retry, |_| f(conn))
        })
        .await?
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
        [],
    )
    .map_err(|e| sql_error("Failed to create schema_version table", e))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .map_err(|e| sql_error("Failed to read schema version", e))?;

    if current > SCHEMA_VERSION {
        return Err(CheckpointError::storage(format!(
            "database schema version {current} is newer than supported version {SCHEMA_VERSION}"
        )));
    }
    if current < 1 {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS state_store (
                key TEXT PRIMARY KEY,
                data BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                expires_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_state_store_expires_at
            ON state_store(expires_at) WHERE expires_at IS NOT NULL;

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )
        .map_err(|e| sql_error("Failed to apply v1 migration", e))?;
        debug!(version = SCHEMA_VERSION, "Applied sqlite schema migration");
    }
    Ok(())
}

fn spawn_sweeper(
    conn: SharedConnection,
    interval: Duration,
    shutdown: CancellationToken,
) -> Option<()> {
    let handle = tokio::runtime::Handle::try_current().ok()?;
    handle.spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let conn = conn.clone();
                    let swept = tokio::task::spawn_blocking(move || {
                        let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
                        match guard.as_mut() {
                            Some(conn) => purge_expired(conn).map(Some),
                            None => Ok(None),
                        }
                    })
                    .await;
                    match swept {
                        Ok(Ok(Some(removed))) if removed > 0 => {
                            debug!(removed, "Swept expired sqlite rows");
                        }
                        Ok(Ok(Some(_))) => {}
                        Ok(Ok(None)) => break,
                        Ok(Err(e)) => warn!(error = %e, "Expired row sweep failed"),
                        Err(e) => warn!(error = %e, "Expired row sweep task failed"),
                    }
                }
            }
        }
    });
    Some(())
}

fn purge_expired(conn: &mut Connection) -> Result<usize> {
    conn.execute(
        "DELETE FROM state_store WHERE expires_at IS NOT NULL AND expires_at <= ?1",
        params![now_millis()],
    )
    .map_err(|e| sql_error("Failed to purge expired rows", e))
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Map a rusqlite error; busy and locked become transient timeouts
fn sql_error(context: &str, err: rusqlite::Error) -> CheckpointError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) =>
        {
            CheckpointError::Timeout(format!("{context}: {err}"))
        }
        _ => CheckpointError::storage(format!("{context}: {err}")),
    }
}

const UPSERT_SQL: &str = "INSERT INTO state_store (key, data, created_at, updated_at, expires_at)
     VALUES (?1, ?2, ?3, ?3, ?4)
     ON CONFLICT(key) DO UPDATE SET
         data = excluded.data,
         updated_at = excluded.updated_at,
         expires_at = excluded.expires_at";

#[async_trait]
impl StateStore for SqliteStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let key = key.to_string();
        let data = value.to_vec();
        let expires_at = self.expires_at();

        self.with_conn("sqlite.put", move |conn| {
            let mut stmt = conn
                .prepare_cached(UPSERT_SQL)
                .map_err(|e| sql_error("Failed to prepare upsert", e))?;
            stmt.execute(params![key, data, now_millis(), expires_at])
                .map_err(|e| sql_error("Failed to write row", e))?;
            Ok(())
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let key = key.to_string();
        self.with_conn("sqlite.get", move |conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT data FROM state_store
                     WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                )
                .map_err(|e| sql_error("Failed to prepare select", e))?;
            stmt.query_row(params![key, now_millis()], |row| row.get::<_, Vec<u8>>(0))
                .optional()
                .map_err(|e| sql_error("Failed to read row", e))?
                .ok_or_else(|| CheckpointError::not_found(key.clone()))
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.with_conn("sqlite.delete", move |conn| {
            let mut stmt = conn
                .prepare_cached(
                    "DELETE FROM state_store
                     WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                )
                .map_err(|e| sql_error("Failed to prepare delete", e))?;
            let removed = stmt
                .execute(params![key, now_millis()])
                .map_err(|e| sql_error("Failed to delete row", e))?;
            if removed == 0 {
                return Err(CheckpointError::not_found(key.clone()));
            }
            Ok(())
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.to_string();
        self.with_conn("sqlite.list", move |conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT key FROM state_store
                     WHERE key >= ?1 AND (expires_at IS NULL OR expires_at > ?2)
                     ORDER BY key",
                )
                .map_err(|e| sql_error("Failed to prepare list", e))?;
            let rows = stmt
                .query_map(params![prefix, now_millis()], |row| row.get::<_, String>(0))
                .map_err(|e| sql_error("Failed to list keys", e))?;

            let mut keys = Vec::new();
            for row in rows {
                let key = row.map_err(|e| sql_error("Key row error", e))?;
                // Rows are ordered, so the first non-match ends the prefix range
                if !key.starts_with(&prefix) {
                    break;
                }
                keys.push(key);
            }
            Ok(keys)
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.with_conn("sqlite.exists", move |conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT 1 FROM state_store
                     WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                )
                .map_err(|e| sql_error("Failed to prepare exists", e))?;
            stmt.exists(params![key, now_millis()])
                .map_err(|e| sql_error("Failed to check key", e))
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let taken = conn.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(conn) = taken {
                conn.close()
                    .map_err(|(_, e)| sql_error("Failed to close database", e))?;
                debug!("Closed sqlite store");
            }
            Ok(())
        })
        .await?
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            batch: true,
            stats: true,
            ttl: true,
        }
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn batch_put(&self, items: &[(String, Vec<u8>)]) -> Result<()> {
        let items = items.to_vec();
        let expires_at = self.expires_at();

        self.with_conn("sqlite.batch_put", move |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| sql_error("Failed to begin transaction", e))?;
            {
                let mut stmt = tx
                    .prepare_cached(UPSERT_SQL)
                    .map_err(|e| sql_error("Failed to prepare upsert", e))?;
                let now = now_millis();
                for (key, data) in &items {
                    stmt.execute(params![key, data, now, expires_at])
                        .map_err(|e| sql_error("Failed to write row", e))?;
                }
            }
            tx.commit()
                .map_err(|e| sql_error("Failed to commit batch", e))
        })
        .await
    }

    async fn batch_delete(&self, keys: &[String]) -> Result<()> {
        let keys = keys.to_vec();
        self.with_conn("sqlite.batch_delete", move |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| sql_error("Failed to begin transaction", e))?;
            {
                let mut stmt = tx
                    .prepare_cached("DELETE FROM state_store WHERE key = ?1")
                    .map_err(|e| sql_error("Failed to prepare delete", e))?;
                for key in &keys {
                    stmt.execute(params![key])
                        .map_err(|e| sql_error("Failed to delete row", e))?;
                }
            }
            tx.commit()
                .map_err(|e| sql_error("Failed to commit batch", e))
        })
        .await
    }

    async fn stats(&self) -> Result<StoreStats> {
        let ttl = self.options.ttl;
        self.with_conn("sqlite.stats", move |conn| {
            let (count, total_size): (i64, i64) = conn
                .query_row(
                    "SELECT COUNT(*), COALESCE(SUM(LENGTH(data)), 0) FROM state_store
                     WHERE expires_at IS NULL OR expires_at > ?1",
                    params![now_millis()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(|e| sql_error("Failed to compute stats", e))?;

            let mut details = BTreeMap::new();
            details.insert("schema_version".to_string(), SCHEMA_VERSION.to_string());
            if let Some(ttl) = ttl {
                details.insert("ttl_ms".to_string(), ttl.as_millis().to_string());
            }
            Ok(StoreStats {
                backend: "sqlite".to_string(),
                count: count.max(0) as u64,
                total_size: total_size.max(0) as u64,
                details,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::contract;
    use tempfile::TempDir;

    fn store() -> SqliteStore {
        SqliteStore::in_memory(SqliteOptions::default()).unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_store_contract() {
        contract::exercise_basic_operations(&store()).await;
        contract::exercise_not_found(&store()).await;
        contract::exercise_prefix_listing(&store()).await;
        contract::exercise_empty_value(&store()).await;
        contract::exercise_batch(&store()).await;
        contract::exercise_stats(&store()).await;
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("waypoint.db");
        {
            let store = SqliteStore::open(&path, SqliteOptions::default()).unwrap();
            store.put("checkpoint:w1:a", b"durable").await.unwrap();
            store.close().await.unwrap();
        }
        let store = SqliteStore::open(&path, SqliteOptions::default()).unwrap();
        assert_eq!(store.get("checkpoint:w1:a").await.unwrap(), b"durable");
    }

    #[tokio::test]
    async fn test_ttl_hides_expired_rows() {
        let store = SqliteStore::in_memory(SqliteOptions {
            ttl: Some(Duration::from_millis(50)),
            sweep_interval: Duration::from_secs(3600),
        })
        .unwrap();
        store.put("checkpoint:w1:a", b"short-lived").await.unwrap();
        assert!(store.exists("checkpoint:w1:a").await.unwrap());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.get("checkpoint:w1:a").await.unwrap_err().is_not_found());
        assert!(store.list("checkpoint:").await.unwrap().is_empty());
        assert_eq!(store.stats().await.unwrap().count, 0);
        assert_eq!(store.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_background_sweep_removes_expired_rows() {
        let store = SqliteStore::in_memory(SqliteOptions {
            ttl: Some(Duration::from_millis(10)),
            sweep_interval: Duration::from_millis(30),
        })
        .unwrap();
        store.put("checkpoint:w1:a", b"x").await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_operations() {
        let store = store();
        store.close().await.unwrap();
        assert!(matches!(
            store.put("k", b"v").await,
            Err(CheckpointError::Closed(_))
        ));
        // Closing twice is harmless
        store.close().await.unwrap();
    }

    #[test]
    fn test_busy_maps_to_transient_timeout() {
        use waypoint_retry::RetryableError;

        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        let err = sql_error("write", busy);
        assert!(matches!(err, CheckpointError::Timeout(_)));
        assert!(err.is_transient());

        let other = sql_error("write", rusqlite::Error::InvalidQuery);
        assert!(matches!(other, CheckpointError::Storage(_)));
    }
}
