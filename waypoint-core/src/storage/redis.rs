/*!
Networked key-value storage adapter (Redis protocol).

One constructor covers three deployment shapes:
- single node, through a reconnecting connection manager
- sentinel, where the configured urls are sentinels that resolve the master
- cluster, through the async cluster client

Every key is namespaced under the configured prefix. A sorted set per store
(`<prefix>__keys`) indexes the live keys so prefix listing is a single
lexicographic range query on any topology. In cluster mode the prefix is
wrapped in a hash tag so data keys and the index share one slot, which also
keeps pipelines single-node.
*/

use async_trait::async_trait;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{Cmd, Pipeline, RedisError, RedisFuture, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use waypoint_retry::{network_storage_backoff_policy, retry_async, RetryPolicy};

use super::{StateStore, StoreCapabilities, StoreStats};
use crate::config::{saturating_millis, RedisOptions, RedisTopology};
use crate::{CheckpointError, Result};

const INDEX_SUFFIX: &str = "__keys";
const NETWORK_RETRY_ATTEMPTS: usize = 3;

/// Connection over whichever topology was configured
#[derive(Clone)]
enum RedisConnection {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

impl ConnectionLike for RedisConnection {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        match self {
            Self::Single(conn) => conn.req_packed_command(cmd),
            Self::Cluster(conn) => conn.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        match self {
            Self::Single(conn) => conn.req_packed_commands(cmd, offset, count),
            Self::Cluster(conn) => conn.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            Self::Single(conn) => conn.get_db(),
            Self::Cluster(conn) => conn.get_db(),
        }
    }
}

/// Redis-backed store
pub struct RedisStore {
    conn: RedisConnection,
    namespace: String,
    index_key: String,
    ttl_ms: Option<u64>,
    topology: RedisTopology,
    retry: RetryPolicy,
    closed: AtomicBool,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("namespace", &self.namespace)
            .field("topology", &self.topology)
            .field("ttl_ms", &self.ttl_ms)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect according to `options.topology`
    pub async fn connect(options: RedisOptions) -> Result<Self> {
        if options.urls.is_empty() {
            return Err(CheckpointError::config("redis backend requires at least one url"));
        }

        let conn = match &options.topology {
            RedisTopology::Single => connect_single(&options.urls[0]).await?,
            RedisTopology::Sentinel { master_name } => {
                let master = resolve_sentinel_master(&options.urls, master_name).await?;
                info!(master = %master, "Resolved sentinel master");
                connect_single(&master).await?
            }
            RedisTopology::Cluster => {
                let client = ClusterClient::new(options.urls.clone())
                    .map_err(|e| redis_error("Failed to create cluster client", e))?;
                let conn = client
                    .get_async_connection()
                    .await
                    .map_err(|e| redis_error("Failed to connect to cluster", e))?;
                RedisConnection::Cluster(conn)
            }
        };

        let namespace = namespace_for(&options.topology, &options.key_prefix);
        info!(
            namespace = %namespace,
            topology = ?options.topology,
            "Connected redis store"
        );
        Ok(Self {
            index_key: format!("{namespace}{INDEX_SUFFIX}"),
            namespace,
            conn,
            ttl_ms: options.ttl.map(|ttl| saturating_millis(ttl).max(1)),
            topology: options.topology,
            retry: RetryPolicy::new(network_storage_backoff_policy(), NETWORK_RETRY_ATTEMPTS),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CheckpointError::Closed("redis store is closed".to_string()));
        }
        Ok(())
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    /// Queue a write of `key` plus its index entry onto `pipe`
    fn queue_put(&self, pipe: &mut Pipeline, key: &str, value: &[u8]) {
        let set = pipe.cmd("SET").arg(self.namespaced(key)).arg(value);
        if let Some(ttl) = self.ttl_ms {
            set.arg("PX").arg(ttl);
        }
        set.ignore();
        pipe.cmd("ZADD").arg(&self.index_key).arg(0).arg(key).ignore();
    }

    /// Run `pipe` with retries, decoding the result as `T`
    async fn run<T: redis::FromRedisValue>(&self, op: &'static str, pipe: &Pipeline) -> Result<T> {
        self.ensure_open()?;
        retry_async(op, &self.retry, |_| {
            let mut conn = self.conn.clone();
            async move {
                pipe.query_async::<_, T>(&mut conn)
                    .await
                    .map_err(|e| redis_error(op, e))
            }
        })
        .await
    }

    /// Index members under `prefix`, in byte order
    async fn indexed_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let (min, max) = lex_range(prefix);
        let mut pipe = redis::pipe();
        pipe.cmd("ZRANGEBYLEX").arg(&self.index_key).arg(min).arg(max);
        let (keys,): (Vec<String>,) = self.run("redis.list", &pipe).await?;
        Ok(keys)
    }
}

async fn connect_single(url: &str) -> Result<RedisConnection> {
    let client = redis::Client::open(url).map_err(|e| redis_error("Invalid redis url", e))?;
    let manager = client
        .get_connection_manager()
        .await
        .map_err(|e| redis_error("Failed to connect to redis", e))?;
    Ok(RedisConnection::Single(manager))
}

/// Ask each sentinel in turn for the current master address
async fn resolve_sentinel_master(sentinels: &[String], master_name: &str) -> Result<String> {
    let mut last_error = None;
    for url in sentinels {
        let attempt = async {
            let client = redis::Client::open(url.as_str())?;
            let mut conn = client.get_multiplexed_async_connection().await?;
            redis::cmd("SENTINEL")
                .arg("get-master-addr-by-name")
                .arg(master_name)
                .query_async::<_, Option<(String, u16)>>(&mut conn)
                .await
        };
        match attempt.await {
            Ok(Some((host, port))) => {
                let scheme = if url.starts_with("rediss://") { "rediss" } else { "redis" };
                return Ok(format!("{scheme}://{host}:{port}/"));
            }
            Ok(None) => {
                warn!(sentinel = %url, master = master_name, "Sentinel does not know master");
            }
            Err(e) => {
                warn!(sentinel = %url, error = %e, "Sentinel unreachable");
                last_error = Some(e);
            }
        }
    }
    Err(match last_error {
        Some(e) => redis_error("No sentinel could resolve the master", e),
        None => CheckpointError::storage(format!("no sentinel knows master {master_name:?}")),
    })
}

fn namespace_for(topology: &RedisTopology, prefix: &str) -> String {
    match topology {
        RedisTopology::Cluster if !prefix.is_empty() => format!("{{{prefix}}}"),
        RedisTopology::Cluster => "{waypoint}".to_string(),
        _ => prefix.to_string(),
    }
}

/// ZRANGEBYLEX bounds selecting every member starting with `prefix`
fn lex_range(prefix: &str) -> (Vec<u8>, Vec<u8>) {
    if prefix.is_empty() {
        return (b"-".to_vec(), b"+".to_vec());
    }
    let mut min = Vec::with_capacity(prefix.len() + 1);
    min.push(b'[');
    min.extend_from_slice(prefix.as_bytes());

    // 0xFF never appears in UTF-8, so it sorts after every extension of prefix
    let mut max = Vec::with_capacity(prefix.len() + 2);
    max.push(b'(');
    max.extend_from_slice(prefix.as_bytes());
    max.push(0xFF);
    (min, max)
}

/// Connection-level failures are transient; everything else is a storage error
fn redis_error(context: &str, err: RedisError) -> CheckpointError {
    if err.is_timeout() || err.is_connection_dropped() || err.is_io_error() {
        CheckpointError::Timeout(format!("{context}: {err}"))
    } else {
        CheckpointError::storage(format!("{context}: {err}"))
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut pipe = redis::pipe();
        self.queue_put(&mut pipe, key, value);
        self.run::<()>("redis.put", &pipe).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let mut pipe = redis::pipe();
        pipe.cmd("GET").arg(self.namespaced(key));
        let (value,): (Option<Vec<u8>>,) = self.run("redis.get", &pipe).await?;
        value.ok_or_else(|| CheckpointError::not_found(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.cmd("DEL").arg(self.namespaced(key));
        pipe.cmd("ZREM").arg(&self.index_key).arg(key).ignore();
        let (removed,): (i64,) = self.run("redis.delete", &pipe).await?;
        if removed == 0 {
            return Err(CheckpointError::not_found(key));
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let indexed = self.indexed_keys(prefix).await?;
        if indexed.is_empty() {
            return Ok(indexed);
        }

        // Expired or externally deleted keys linger in the index until seen here
        let mut pipe = redis::pipe();
        for key in &indexed {
            pipe.cmd("EXISTS").arg(self.namespaced(key));
        }
        let present: Vec<i64> = self.run("redis.list", &pipe).await?;

        let (live, stale): (Vec<_>, Vec<_>) = indexed
            .into_iter()
            .zip(present)
            .partition(|(_, exists)| *exists > 0);

        if !stale.is_empty() {
            let mut prune = redis::pipe();
            let zrem = prune.cmd("ZREM").arg(&self.index_key);
            for (key, _) in &stale {
                zrem.arg(key);
            }
            zrem.ignore();
            if let Err(e) = self.run::<()>("redis.prune_index", &prune).await {
                warn!(error = %e, stale = stale.len(), "Failed to prune key index");
            } else {
                debug!(stale = stale.len(), "Pruned stale key index entries");
            }
        }

        Ok(live.into_iter().map(|(key, _)| key).collect())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut pipe = redis::pipe();
        pipe.cmd("EXISTS").arg(self.namespaced(key));
        let (count,): (i64,) = self.run("redis.exists", &pipe).await?;
        Ok(count > 0)
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(namespace = %self.namespace, "Closed redis store");
        }
        Ok(())
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            batch: true,
            stats: true,
            ttl: true,
        }
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn batch_put(&self, items: &[(String, Vec<u8>)]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for (key, value) in items {
            self.queue_put(&mut pipe, key, value);
        }
        self.run::<()>("redis.batch_put", &pipe).await
    }

    async fn batch_delete(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("DEL").arg(self.namespaced(key)).ignore();
        }
        let zrem = pipe.cmd("ZREM").arg(&self.index_key);
        for key in keys {
            zrem.arg(key);
        }
        zrem.ignore();
        self.run::<()>("redis.batch_delete", &pipe).await
    }

    async fn stats(&self) -> Result<StoreStats> {
        let keys = self.list("").await?;
        let total_size = if keys.is_empty() {
            0
        } else {
            let mut pipe = redis::pipe();
            for key in &keys {
                pipe.cmd("STRLEN").arg(self.namespaced(key));
            }
            let sizes: Vec<u64> = self.run("redis.stats", &pipe).await?;
            sizes.iter().sum()
        };

        let mut details = BTreeMap::new();
        details.insert("namespace".to_string(), self.namespace.clone());
        details.insert("topology".to_string(), format!("{:?}", self.topology));
        Ok(StoreStats {
            backend: self.backend_name().to_string(),
            count: keys.len() as u64,
            total_size,
            details,
        })
    }
}
