//! Sentinel set management and the HA reactor.
//!
//! The reactor owns two cooperating tasks per sentinel set: a subscriber
//! that camps on `+switch-master` across the fleet, and a resolver that on
//! every trigger fetches the quorum view of current masters and reconciles
//! the groups against it. Re-watching a new sentinel set first cancels the
//! old handle.

use crate::error::{CacheMgrError, Result};
use crate::model::group_masters;
use crate::redis::{InfoCache, MonitorConfig, RedisClient, SentinelClient, SentinelGroup};
use crate::service::{Service, ServiceState};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// How long one subscribe attempt camps on the fleet before rotating.
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(15 * 60);
/// Floor between subscribe retries after a failure.
const SUBSCRIBE_RETRY_FLOOR: Duration = Duration::from_secs(10);
/// Per-attempt timeout and floor for the resolver's masters fetches.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);
/// Attempts per trigger; successful fetches accepted per trigger.
const RESOLVE_MAX_ATTEMPTS: usize = 10;
const RESOLVE_MAX_SUCCESS: usize = 2;

/// The sentinel fleet operations the service depends on. Production hands
/// out [`SentinelClient`]s; tests substitute recorders.
#[async_trait]
pub trait SentinelOps: Send + Sync {
    async fn masters(
        &self,
        sentinels: &[String],
        timeout: Duration,
    ) -> Result<HashMap<String, String>>;

    async fn monitor_groups(
        &self,
        sentinels: &[String],
        timeout: Duration,
        config: &MonitorConfig,
        groups: &HashMap<String, String>,
    ) -> Result<()>;

    async fn remove_groups(
        &self,
        sentinels: &[String],
        timeout: Duration,
        groups: &HashSet<String>,
    ) -> Result<()>;

    async fn remove_groups_all(&self, sentinels: &[String], timeout: Duration) -> Result<()>;

    async fn flush_config(&self, sentinel: &str, timeout: Duration) -> Result<()>;

    async fn masters_and_slaves(
        &self,
        sentinel: &str,
        timeout: Duration,
    ) -> Result<HashMap<String, SentinelGroup>>;

    async fn subscribe(
        &self,
        sentinels: &[String],
        timeout: Duration,
        on_majority_subscribed: Box<dyn Fn() + Send + Sync>,
    ) -> bool;

    fn cancel(&self);
    fn is_cancelled(&self) -> bool;
}

#[async_trait]
impl SentinelOps for SentinelClient {
    async fn masters(
        &self,
        sentinels: &[String],
        timeout: Duration,
    ) -> Result<HashMap<String, String>> {
        SentinelClient::masters(self, sentinels, timeout).await
    }

    async fn monitor_groups(
        &self,
        sentinels: &[String],
        timeout: Duration,
        config: &MonitorConfig,
        groups: &HashMap<String, String>,
    ) -> Result<()> {
        SentinelClient::monitor_groups(self, sentinels, timeout, config, groups).await
    }

    async fn remove_groups(
        &self,
        sentinels: &[String],
        timeout: Duration,
        groups: &HashSet<String>,
    ) -> Result<()> {
        SentinelClient::remove_groups(self, sentinels, timeout, groups).await
    }

    async fn remove_groups_all(&self, sentinels: &[String], timeout: Duration) -> Result<()> {
        SentinelClient::remove_groups_all(self, sentinels, timeout).await
    }

    async fn flush_config(&self, sentinel: &str, timeout: Duration) -> Result<()> {
        SentinelClient::flush_config(self, sentinel, timeout).await
    }

    async fn masters_and_slaves(
        &self,
        sentinel: &str,
        timeout: Duration,
    ) -> Result<HashMap<String, SentinelGroup>> {
        SentinelClient::masters_and_slaves(self, sentinel, timeout).await
    }

    async fn subscribe(
        &self,
        sentinels: &[String],
        timeout: Duration,
        on_majority_subscribed: Box<dyn Fn() + Send + Sync>,
    ) -> bool {
        SentinelClient::subscribe(self, sentinels, timeout, move || on_majority_subscribed()).await
    }

    fn cancel(&self) {
        SentinelClient::cancel(self)
    }

    fn is_cancelled(&self) -> bool {
        SentinelClient::is_cancelled(self)
    }
}

/// Each call produces a fresh, independently cancellable handle.
pub type SentinelFactory = Arc<dyn Fn() -> Arc<dyn SentinelOps> + Send + Sync>;

pub fn new_sentinel_factory(product: &str, auth: &str) -> SentinelFactory {
    let product = product.to_string();
    let auth = auth.to_string();
    Arc::new(move || Arc::new(SentinelClient::new(&product, &auth)) as Arc<dyn SentinelOps>)
}

impl Service {
    fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            quorum: self.config.sentinel_quorum,
            parallel_syncs: self.config.sentinel_parallel_syncs,
            down_after: self.config.sentinel_down_after,
            failover_timeout: self.config.sentinel_failover_timeout,
            notification_script: self.config.sentinel_notification_script.clone(),
            client_reconfig_script: self.config.sentinel_client_reconfig_script.clone(),
        }
    }

    pub async fn add_sentinel(&self, addr: &str) -> Result<()> {
        if addr.is_empty() {
            return Err(CacheMgrError::InvalidArgument(
                "invalid sentinel address".into(),
            ));
        }

        let _st = self.state.lock().await;
        let mut sentinel = self.sentinel_mapper.info();
        if sentinel.servers.iter().any(|s| s == addr) {
            return Err(CacheMgrError::AlreadyExists {
                kind: "sentinel",
                name: addr.to_string(),
            });
        }

        let client = (self.sentinel_factory)();
        client
            .flush_config(addr, self.config.sentinel_client_timeout)
            .await?;

        sentinel.servers.push(addr.to_string());
        sentinel.out_of_sync = true;
        self.sentinel_mapper.update(&sentinel).await
    }

    /// Remove a sentinel from the set. Its monitors for this product are
    /// removed best-effort; with `force` a failure there only logs.
    pub async fn del_sentinel(&self, addr: &str, force: bool) -> Result<()> {
        if addr.is_empty() {
            return Err(CacheMgrError::InvalidArgument(
                "invalid sentinel address".into(),
            ));
        }

        let _st = self.state.lock().await;
        let mut sentinel = self.sentinel_mapper.info();
        let index = sentinel
            .servers
            .iter()
            .position(|s| s == addr)
            .ok_or_else(|| CacheMgrError::NotFound {
                kind: "sentinel",
                name: addr.to_string(),
            })?;

        sentinel.out_of_sync = true;
        self.sentinel_mapper.update(&sentinel).await?;

        let client = (self.sentinel_factory)();
        if let Err(e) = client
            .remove_groups_all(
                std::slice::from_ref(&sentinel.servers[index]),
                self.config.sentinel_client_timeout,
            )
            .await
        {
            warn!(sentinel = %addr, error = %e, "removing monitors from sentinel failed");
            if !force {
                return Err(CacheMgrError::Sentinel(format!(
                    "remove sentinel {} failed",
                    addr
                )));
            }
        }

        sentinel.servers.remove(index);
        self.sentinel_mapper.update(&sentinel).await
    }

    /// Rebuild every sentinel's monitor set from the current topology and
    /// restart the HA reactor against the (unchanged) server list. Clears
    /// the out-of-sync flag only after everything succeeded.
    pub async fn resync_sentinels(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        let groups = self.group_mapper.info();
        let mut sentinel = self.sentinel_mapper.info();

        sentinel.out_of_sync = true;
        self.sentinel_mapper.update(&sentinel).await?;

        let client = (self.sentinel_factory)();
        if let Err(e) = client
            .remove_groups_all(&sentinel.servers, self.config.sentinel_client_timeout)
            .await
        {
            error!(error = %e, "removing stale monitors failed");
        }
        if let Err(e) = client
            .monitor_groups(
                &sentinel.servers,
                self.config.sentinel_client_timeout,
                &self.monitor_config(),
                &group_masters(&groups),
            )
            .await
        {
            error!(error = %e, "installing monitors failed");
            return Err(e);
        }
        self.rewatch_sentinels(sentinel.servers.clone(), &mut st);

        sentinel.out_of_sync = false;
        self.sentinel_mapper.update(&sentinel).await
    }

    /// Pass-through `INFO` from one sentinel (unauthenticated).
    pub async fn sentinel_info(&self, addr: &str) -> Result<String> {
        let mut client = RedisClient::connect(addr, "", Duration::from_secs(1)).await?;
        let reply = client.command(&["INFO"]).await?;
        reply
            .as_text()
            .ok_or_else(|| CacheMgrError::RedisProtocol("INFO reply is not a string".into()))
    }

    /// What one sentinel currently monitors for this product.
    pub async fn sentinel_monitored_info(
        &self,
        addr: &str,
    ) -> Result<HashMap<String, SentinelGroup>> {
        let client = (self.sentinel_factory)();
        client
            .masters_and_slaves(addr, self.config.sentinel_client_timeout)
            .await
    }

    /// Flip the sentinel record out of sync; called by every topology
    /// change so operators see the drift until the next resync.
    pub(crate) async fn mark_sentinel_out_of_sync(&self) -> Result<()> {
        let mut sentinel = self.sentinel_mapper.info();
        if sentinel.servers.is_empty() {
            return Ok(());
        }
        sentinel.out_of_sync = true;
        self.sentinel_mapper
            .update(&sentinel)
            .await
            .map_err(|e| CacheMgrError::Internal(format!("update sentinel fail: {}", e)))
    }

    /// Cancel the previous HA monitor and, for a non-empty sentinel set,
    /// start the subscriber and resolver tasks against the new one.
    pub(crate) fn rewatch_sentinels(&self, servers: Vec<String>, st: &mut ServiceState) {
        if let Some(old) = st.ha_monitor.take() {
            old.cancel();
        }

        if servers.is_empty() {
            st.ha_masters = None;
            info!("ha reactor idle: no sentinels configured");
            return;
        }

        let monitor = (self.sentinel_factory)();
        st.ha_monitor = Some(monitor.clone());
        info!(sentinels = ?servers, "ha reactor watching sentinels");

        let (trigger_tx, mut trigger_rx) = mpsc::channel::<()>(1);

        // Subscriber: camp on +switch-master; every notification (and the
        // moment majority is first reached) pokes the resolver.
        {
            let monitor = monitor.clone();
            let servers = servers.clone();
            let trigger_tx = trigger_tx.clone();
            tokio::spawn(async move {
                while !monitor.is_cancelled() {
                    let retry_at = Instant::now() + SUBSCRIBE_RETRY_FLOOR;
                    let on_majority = {
                        let trigger_tx = trigger_tx.clone();
                        Box::new(move || {
                            let _ = trigger_tx.try_send(());
                        }) as Box<dyn Fn() + Send + Sync>
                    };
                    let notified = monitor
                        .subscribe(&servers, SUBSCRIBE_TIMEOUT, on_majority)
                        .await;
                    if notified {
                        let _ = trigger_tx.try_send(());
                    } else {
                        delay_until(retry_at, monitor.as_ref()).await;
                    }
                }
            });
        }

        // Resolver: per trigger, fetch the quorum master view a bounded
        // number of times and reconcile.
        let Some(service) = self.handle() else {
            return;
        };
        {
            let monitor = monitor.clone();
            tokio::spawn(async move {
                while trigger_rx.recv().await.is_some() {
                    let mut success = 0usize;
                    let mut attempts = 0usize;
                    while attempts != RESOLVE_MAX_ATTEMPTS
                        && !monitor.is_cancelled()
                        && success != RESOLVE_MAX_SUCCESS
                    {
                        match monitor.masters(&servers, RESOLVE_TIMEOUT).await {
                            Ok(masters) => {
                                if !monitor.is_cancelled() {
                                    if let Err(e) = service.switch_masters(masters).await {
                                        error!(error = %e, "applying sentinel master view failed");
                                    }
                                }
                                success += 1;
                            }
                            Err(e) => {
                                error!(error = %e, "fetching group masters failed");
                            }
                        }
                        delay_until(Instant::now() + RESOLVE_TIMEOUT, monitor.as_ref()).await;
                        attempts += 1;
                    }
                }
            });
        }
    }

    /// Store the sentinel-reported master map and reconcile each group
    /// against it. Runs under the service lock, so it cannot race an
    /// operator promotion.
    pub async fn switch_masters(&self, masters: HashMap<String, String>) -> Result<()> {
        let mut st = self.state.lock().await;
        self.check_closed()?;

        st.ha_masters = Some(masters.clone());
        if masters.is_empty() {
            return Ok(());
        }

        let cache = InfoCache::new(self.redis.clone());
        for (group_name, master_addr) in &masters {
            if let Err(e) = self
                .try_switch_group_master(group_name, master_addr, &cache, &mut st)
                .await
            {
                error!(group = %group_name, error = %e, "switching group master failed");
            }
        }
        Ok(())
    }

    /// Reorder one group so the sentinel-elected master sits at index 0.
    ///
    /// The new master is located by exact address first; failing that, by
    /// run-id, which recognises the promoted server even when its address
    /// was reused after failover.
    async fn try_switch_group_master(
        &self,
        group_name: &str,
        master_addr: &str,
        cache: &InfoCache,
        st: &mut ServiceState,
    ) -> Result<()> {
        let groups = self.group_mapper.info();
        let mut group = groups
            .get(group_name)
            .cloned()
            .ok_or_else(|| CacheMgrError::NotFound {
                kind: "group",
                name: group_name.to_string(),
            })?;

        let mut index = group.server_index(master_addr);
        if index.is_none() {
            let wanted = cache.get_run_id(master_addr).await;
            if wanted.is_some() {
                for (i, server) in group.servers.iter().enumerate() {
                    if cache.get_run_id(&server.addr).await == wanted {
                        index = Some(i);
                        break;
                    }
                }
            }
        }

        let index = index.ok_or_else(|| {
            CacheMgrError::NotFound {
                kind: "server",
                name: format!("{} (group {})", master_addr, group_name),
            }
        })?;
        if index == 0 {
            return Ok(());
        }

        warn!(
            group = %group_name,
            new_master = %group.servers[index].addr,
            "switching group master after failover"
        );

        group.servers.swap(0, index);
        group.out_of_sync = true;
        self.group_mapper.update(&group).await?;
        self.refresh_gslb_backend_info(st).await
    }
}

/// Sleep until `deadline`, polling for cancellation once a second.
async fn delay_until(deadline: Instant, monitor: &dyn SentinelOps) {
    while !monitor.is_cancelled() {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        let step = (deadline - now).min(Duration::from_secs(1));
        tokio::time::sleep(step).await;
    }
}
