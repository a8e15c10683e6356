//! Redis-side clients: the command primitive (connection + pool) and the
//! Sentinel fan-out client built on top of it.

pub mod client;
pub mod sentinel;

pub use client::{parse_info, RedisClient, RedisPool, RespValue, NO_ONE};
pub use sentinel::{MonitorConfig, SentinelClient, SentinelGroup};

use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Redis side-effects and probes as seen by the service. Tests substitute
/// a recording stub; production uses [`PooledRedisOps`].
#[async_trait]
pub trait RedisOps: Send + Sync {
    /// `INFO` against `addr`, parsed.
    async fn info(&self, addr: &str) -> Result<HashMap<String, String>>;

    /// `INFO` against a sentinel. Sentinels never carry the product auth.
    async fn info_no_auth(&self, addr: &str) -> Result<HashMap<String, String>>;

    /// `INFO` + `INFO keyspace` against `addr`, parsed.
    async fn info_full(&self, addr: &str) -> Result<HashMap<String, String>>;

    /// Point `addr` at `master` (`NO:ONE` = become master).
    async fn set_master(&self, addr: &str, master: &str) -> Result<()>;

    /// Point `addr` at `master` and force a full resync.
    async fn force_full_sync(&self, addr: &str, master: &str) -> Result<()>;

    /// Release pooled resources. Called exactly once when the owning
    /// service closes.
    fn close(&self) {}
}

/// Production [`RedisOps`]: probes go through shared pools (one carrying
/// the product auth for group servers, one bare for sentinels), while
/// replication changes use a dedicated short-lived connection with a wider
/// deadline.
pub struct PooledRedisOps {
    pool: RedisPool,
    sentinel_pool: RedisPool,
    auth: String,
    action_timeout: Duration,
}

impl PooledRedisOps {
    pub fn new(auth: &str, probe_timeout: Duration, action_timeout: Duration) -> Self {
        Self {
            pool: RedisPool::new(auth, probe_timeout),
            sentinel_pool: RedisPool::new("", probe_timeout),
            auth: auth.to_string(),
            action_timeout,
        }
    }

    pub fn pool(&self) -> &RedisPool {
        &self.pool
    }
}

#[async_trait]
impl RedisOps for PooledRedisOps {
    async fn info(&self, addr: &str) -> Result<HashMap<String, String>> {
        let mut client = self.pool.get_client(addr).await?;
        let result = client.info().await;
        self.pool.put_client(client);
        result
    }

    async fn info_no_auth(&self, addr: &str) -> Result<HashMap<String, String>> {
        let mut client = self.sentinel_pool.get_client(addr).await?;
        let result = client.info().await;
        self.sentinel_pool.put_client(client);
        result
    }

    async fn info_full(&self, addr: &str) -> Result<HashMap<String, String>> {
        let (_, map) = self.pool.info_full(addr).await?;
        Ok(map)
    }

    async fn set_master(&self, addr: &str, master: &str) -> Result<()> {
        let mut client = RedisClient::connect(addr, &self.auth, self.action_timeout).await?;
        client.set_master(master).await
    }

    async fn force_full_sync(&self, addr: &str, master: &str) -> Result<()> {
        let mut client = RedisClient::connect(addr, &self.auth, self.action_timeout).await?;
        client.force_full_sync_from_master(master).await
    }

    fn close(&self) {
        self.pool.close();
        self.sentinel_pool.close();
    }
}

/// Memoises `INFO` per address for the duration of one master-switch pass,
/// so run-id lookups hit each server at most once.
pub struct InfoCache {
    ops: Arc<dyn RedisOps>,
    cache: Mutex<HashMap<String, Option<HashMap<String, String>>>>,
}

impl InfoCache {
    pub fn new(ops: Arc<dyn RedisOps>) -> Self {
        Self {
            ops,
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn get(&self, addr: &str) -> Option<HashMap<String, String>> {
        if let Some(entry) = self.cache.lock().get(addr) {
            return entry.clone();
        }
        let fetched = self.ops.info(addr).await.ok();
        self.cache
            .lock()
            .insert(addr.to_string(), fetched.clone());
        fetched
    }

    /// The server's per-boot run id, used to recognise a replica across
    /// address reuse. Empty lookup failures yield `None`.
    pub async fn get_run_id(&self, addr: &str) -> Option<String> {
        self.get(addr).await?.get("run_id").cloned()
    }
}
