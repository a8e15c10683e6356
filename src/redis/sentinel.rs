//! Sentinel fan-out client.
//!
//! Every external operation takes the full sentinel endpoint list, fans one
//! worker out per endpoint, and combines the replies: quorum-based for
//! reads that must be authoritative (`masters`, `subscribe`), best-effort
//! last-error for writes (`monitor_groups`, `remove_groups`).
//!
//! Group names are namespaced on the wire as `<product>-<group>`; replies
//! are filtered back down to this client's product. Cancellation is
//! distinguished from failure everywhere: a cancelled worker reports
//! nothing instead of an error.

use crate::error::{CacheMgrError, Result};
use crate::redis::client::{RedisClient, RespValue};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Sentinel monitor settings pushed by `monitor_groups`. Zero or empty
/// values are left at the sentinel's own defaults.
#[derive(Debug, Clone, Default)]
pub struct MonitorConfig {
    pub quorum: u32,
    pub parallel_syncs: u32,
    pub down_after: Duration,
    pub failover_timeout: Duration,
    pub notification_script: String,
    pub client_reconfig_script: String,
}

/// One monitored group as a sentinel reports it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SentinelGroup {
    pub master: HashMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub slaves: Vec<HashMap<String, String>>,
}

#[derive(Debug, Clone)]
struct SentinelMaster {
    addr: String,
    epoch: i64,
}

#[derive(Clone)]
pub struct SentinelClient {
    product: String,
    auth: String,
    token: CancellationToken,
}

impl SentinelClient {
    pub fn new(product: &str, auth: &str) -> Self {
        Self {
            product: product.to_string(),
            auth: auth.to_string(),
            token: CancellationToken::new(),
        }
    }

    /// Cancel every in-flight and future operation of this client and its
    /// clones.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The on-wire monitor name for a group of this product.
    pub fn node_name(&self, group: &str) -> String {
        format!("{}-{}", self.product, group)
    }

    /// Strip the product prefix; `None` when the name belongs to another
    /// product.
    fn group_of(&self, name: &str) -> Option<String> {
        let suffix = name.strip_prefix(&self.product)?;
        let group = suffix.strip_prefix('-')?;
        if group.is_empty() {
            None
        } else {
            Some(group.to_string())
        }
    }

    fn majority(total: usize) -> usize {
        total / 2 + 1
    }

    /// Spawn one worker per sentinel and hand back the result channel.
    /// This is the single fan-out shape every operation goes through.
    fn dispatch_all<T, F, Fut>(&self, sentinels: &[String], make: F) -> mpsc::Receiver<T>
    where
        T: Send + 'static,
        F: Fn(String) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(sentinels.len().max(1));
        for sentinel in sentinels {
            let tx = tx.clone();
            let fut = make(sentinel.clone());
            tokio::spawn(async move {
                let _ = tx.send(fut.await).await;
            });
        }
        rx
    }

    /// Run `work` against one sentinel unless cancelled first. Cancellation
    /// yields `Ok(None)`.
    async fn guarded<T, Fut>(&self, work: Fut) -> Result<Option<T>>
    where
        Fut: Future<Output = Result<T>>,
    {
        tokio::select! {
            _ = self.token.cancelled() => Ok(None),
            result = work => result.map(Some),
        }
    }

    // ---- masters ----------------------------------------------------

    /// Query `SENTINEL masters` across the fleet and keep, per group, the
    /// master with the highest config epoch among the voters. Fails unless
    /// a majority of sentinels replied.
    pub async fn masters(
        &self,
        sentinels: &[String],
        timeout: Duration,
    ) -> Result<HashMap<String, String>> {
        if self.token.is_cancelled() {
            return Err(CacheMgrError::Sentinel("masters cancelled".into()));
        }
        let total = sentinels.len();
        let majority = Self::majority(total);
        let client_timeout = timeout + Duration::from_secs(5);

        let mut rx = self.dispatch_all(sentinels, |sentinel| {
            let this = self.clone();
            async move {
                match this
                    .guarded(this.masters_dispatch(&sentinel, client_timeout))
                    .await
                {
                    Ok(m) => m,
                    Err(e) => {
                        error!(sentinel = %sentinel, error = %e, "sentinel masters failed");
                        None
                    }
                }
            }
        });

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut masters = HashMap::new();
        let mut current: HashMap<String, SentinelMaster> = HashMap::new();
        let mut voted = 0usize;
        let mut alive = total;
        while alive > 0 {
            tokio::select! {
                _ = self.token.cancelled() => {
                    return Err(CacheMgrError::Sentinel("masters cancelled".into()));
                }
                _ = &mut deadline => {
                    warn!(voted, total, "sentinel masters deadline reached");
                    break;
                }
                reply = rx.recv() => {
                    alive -= 1;
                    if let Some(Some(m)) = reply {
                        for (group, master) in m {
                            let better = current
                                .get(&group)
                                .map(|cur| cur.epoch < master.epoch)
                                .unwrap_or(true);
                            if better {
                                masters.insert(group.clone(), master.addr.clone());
                                current.insert(group, master);
                            }
                        }
                        voted += 1;
                    }
                }
            }
        }

        if voted < majority {
            return Err(CacheMgrError::LostMajority { voted, total });
        }
        Ok(masters)
    }

    async fn masters_dispatch(
        &self,
        sentinel: &str,
        timeout: Duration,
    ) -> Result<HashMap<String, SentinelMaster>> {
        let mut client = RedisClient::connect(sentinel, "", timeout).await?;
        let raw = self.masters_command(&mut client).await?;
        let mut masters = HashMap::new();
        for (group, info) in raw {
            let epoch: i64 = match info.get("config-epoch").map(|e| e.parse()) {
                Some(Ok(epoch)) => epoch,
                _ => {
                    warn!(
                        sentinel,
                        group,
                        epoch = info.get("config-epoch").map(String::as_str),
                        "sentinel master entry has unparsable config-epoch, skipped"
                    );
                    continue;
                }
            };
            let (ip, port) = (
                info.get("ip").cloned().unwrap_or_default(),
                info.get("port").cloned().unwrap_or_default(),
            );
            if ip.is_empty() || port.is_empty() {
                warn!(sentinel, group, "sentinel master entry missing ip:port, skipped");
                continue;
            }
            masters.insert(
                group,
                SentinelMaster {
                    addr: format!("{}:{}", ip, port),
                    epoch,
                },
            );
        }
        Ok(masters)
    }

    /// `SENTINEL masters`, filtered to this product, keyed by bare group
    /// name.
    async fn masters_command(
        &self,
        client: &mut RedisClient,
    ) -> Result<HashMap<String, HashMap<String, String>>> {
        let reply = client.command(&["SENTINEL", "masters"]).await?;
        let entries = reply
            .as_array()
            .ok_or_else(|| CacheMgrError::RedisProtocol("SENTINEL masters: not an array".into()))?;
        let mut masters = HashMap::new();
        for entry in entries {
            let info = entry.as_string_map().ok_or_else(|| {
                CacheMgrError::RedisProtocol("SENTINEL masters: bad entry".into())
            })?;
            if let Some(group) = info.get("name").and_then(|n| self.group_of(n)) {
                masters.insert(group, info);
            }
        }
        Ok(masters)
    }

    // ---- monitor / remove -------------------------------------------

    /// Install monitors for `groups` (name -> master addr) on every
    /// sentinel. Addresses are resolved once up front; per-sentinel work is
    /// pipelined per phase. Best-effort: the last per-sentinel error is
    /// returned, success of at least one sentinel does not mask it.
    pub async fn monitor_groups(
        &self,
        sentinels: &[String],
        timeout: Duration,
        config: &MonitorConfig,
        groups: &HashMap<String, String>,
    ) -> Result<()> {
        let mut resolved: HashMap<String, (String, String)> = HashMap::new();
        for (group, addr) in groups {
            if self.token.is_cancelled() {
                return Err(CacheMgrError::Sentinel("monitor cancelled".into()));
            }
            let mut addrs = tokio::net::lookup_host(addr.as_str()).await.map_err(|e| {
                warn!(addr = %addr, error = %e, "sentinel monitor: resolving master failed");
                CacheMgrError::Network(format!("resolve {}: {}", addr, e))
            })?;
            let socket = addrs
                .next()
                .ok_or_else(|| CacheMgrError::Network(format!("resolve {}: no address", addr)))?;
            resolved.insert(
                group.clone(),
                (socket.ip().to_string(), socket.port().to_string()),
            );
        }

        let client_timeout = timeout + Duration::from_secs(5);
        let config = Arc::new(config.clone());
        let resolved = Arc::new(resolved);
        let rx = self.dispatch_all(sentinels, |sentinel| {
            let this = self.clone();
            let config = config.clone();
            let resolved = resolved.clone();
            async move {
                let result = this
                    .guarded(this.monitor_dispatch(&sentinel, client_timeout, &config, &resolved))
                    .await;
                match result {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        error!(sentinel = %sentinel, error = %e, "sentinel monitor failed");
                        Err(e)
                    }
                }
            }
        });
        self.collect_last_error(rx, sentinels.len(), timeout).await
    }

    async fn monitor_dispatch(
        &self,
        sentinel: &str,
        timeout: Duration,
        config: &MonitorConfig,
        groups: &HashMap<String, (String, String)>,
    ) -> Result<()> {
        let mut client = RedisClient::connect(sentinel, "", timeout).await?;

        let names: Vec<String> = groups.keys().map(|g| self.node_name(g)).collect();
        self.remove_command(&mut client, &names).await?;

        // Monitor phase: one round trip for the whole batch.
        let quorum = config.quorum.to_string();
        for (group, (ip, port)) in groups {
            let name = self.node_name(group);
            client
                .send(&[
                    "SENTINEL",
                    "monitor",
                    name.as_str(),
                    ip.as_str(),
                    port.as_str(),
                    quorum.as_str(),
                ])
                .await?;
        }
        if !groups.is_empty() {
            client.flush().await?;
        }
        for _ in groups {
            client.receive().await?;
        }

        // Set phase: per-group option list, again one round trip.
        let parallel = config.parallel_syncs.to_string();
        let down_after = config.down_after.as_millis().to_string();
        let failover = config.failover_timeout.as_millis().to_string();
        for group in groups.keys() {
            let name = self.node_name(group);
            let mut args: Vec<&str> = vec!["SENTINEL", "set", name.as_str()];
            if config.parallel_syncs != 0 {
                args.extend(["parallel-syncs", parallel.as_str()]);
            }
            if !config.down_after.is_zero() {
                args.extend(["down-after-milliseconds", down_after.as_str()]);
            }
            if !config.failover_timeout.is_zero() {
                args.extend(["failover-timeout", failover.as_str()]);
            }
            if !self.auth.is_empty() {
                args.extend(["auth-pass", self.auth.as_str()]);
            }
            if !config.notification_script.is_empty() {
                args.extend(["notification-script", config.notification_script.as_str()]);
            }
            if !config.client_reconfig_script.is_empty() {
                args.extend([
                    "client-reconfig-script",
                    config.client_reconfig_script.as_str(),
                ]);
            }
            client.send(&args).await?;
        }
        if !groups.is_empty() {
            client.flush().await?;
        }
        for _ in groups {
            client.receive().await?;
        }
        Ok(())
    }

    /// Remove the monitors for an explicit set of groups on every sentinel.
    pub async fn remove_groups(
        &self,
        sentinels: &[String],
        timeout: Duration,
        groups: &HashSet<String>,
    ) -> Result<()> {
        let names: Vec<String> = groups.iter().map(|g| self.node_name(g)).collect();
        let names = Arc::new(names);
        let client_timeout = timeout + Duration::from_secs(5);
        let rx = self.dispatch_all(sentinels, |sentinel| {
            let this = self.clone();
            let names = names.clone();
            async move {
                let result = this
                    .guarded(async {
                        let mut client = RedisClient::connect(&sentinel, "", client_timeout).await?;
                        this.remove_command(&mut client, &names).await
                    })
                    .await;
                match result {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        error!(sentinel = %sentinel, error = %e, "sentinel remove failed");
                        Err(e)
                    }
                }
            }
        });
        self.collect_last_error(rx, sentinels.len(), timeout).await
    }

    /// Remove every monitor of this product on every sentinel, discovering
    /// the set from each sentinel's own master list.
    pub async fn remove_groups_all(&self, sentinels: &[String], timeout: Duration) -> Result<()> {
        let client_timeout = timeout + Duration::from_secs(5);
        let rx = self.dispatch_all(sentinels, |sentinel| {
            let this = self.clone();
            async move {
                let result = this
                    .guarded(async {
                        let mut client = RedisClient::connect(&sentinel, "", client_timeout).await?;
                        let masters = this.masters_command(&mut client).await?;
                        let names: Vec<String> =
                            masters.keys().map(|g| this.node_name(g)).collect();
                        this.remove_command(&mut client, &names).await
                    })
                    .await;
                match result {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        error!(sentinel = %sentinel, error = %e, "sentinel remove-all failed");
                        Err(e)
                    }
                }
            }
        });
        self.collect_last_error(rx, sentinels.len(), timeout).await
    }

    /// Which of `names` this sentinel currently monitors.
    async fn exists_command(
        &self,
        client: &mut RedisClient,
        names: &[String],
    ) -> Result<HashMap<String, bool>> {
        let mut exists = HashMap::with_capacity(names.len());
        for name in names {
            let reply = client
                .command(&["SENTINEL", "get-master-addr-by-name", name.as_str()])
                .await?;
            exists.insert(name.clone(), reply != RespValue::Nil);
        }
        Ok(exists)
    }

    async fn remove_command(&self, client: &mut RedisClient, names: &[String]) -> Result<()> {
        let exists = self.exists_command(client, names).await?;
        let mut pending = 0usize;
        for name in names {
            if !exists.get(name).copied().unwrap_or(false) {
                continue;
            }
            client.send(&["SENTINEL", "remove", name.as_str()]).await?;
            pending += 1;
        }
        if pending != 0 {
            client.flush().await?;
        }
        for _ in 0..pending {
            client.receive().await?;
        }
        Ok(())
    }

    /// Drain worker results, keeping the last error. The overall deadline
    /// still applies; timing out with a recorded error returns that error.
    async fn collect_last_error(
        &self,
        mut rx: mpsc::Receiver<Result<()>>,
        total: usize,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = tokio::time::sleep(timeout + Duration::from_secs(5));
        tokio::pin!(deadline);
        let mut last: Option<CacheMgrError> = None;
        for _ in 0..total {
            tokio::select! {
                _ = &mut deadline => {
                    return Err(last.unwrap_or_else(|| {
                        CacheMgrError::Timeout("sentinel fan-out".into())
                    }));
                }
                reply = rx.recv() => match reply {
                    Some(Err(e)) => last = Some(e),
                    Some(Ok(())) => {}
                    None => break,
                },
            }
        }
        match last {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ---- subscribe --------------------------------------------------

    /// Subscribe to `+switch-master` on every sentinel. Fires
    /// `on_majority_subscribed` exactly once, when the number of acked
    /// subscriptions first reaches majority. Returns `true` as soon as any
    /// sentinel reports a switch for this product; `false` on majority
    /// loss, deadline, or cancellation.
    pub async fn subscribe(
        &self,
        sentinels: &[String],
        timeout: Duration,
        on_majority_subscribed: impl Fn() + Send + Sync + 'static,
    ) -> bool {
        let total = sentinels.len();
        let majority = Self::majority(total);
        let client_timeout = timeout + Duration::from_secs(5);

        let subscribed = Arc::new(AtomicUsize::new(0));
        let callback = Arc::new(on_majority_subscribed);

        let mut rx = self.dispatch_all(sentinels, |sentinel| {
            let this = self.clone();
            let subscribed = subscribed.clone();
            let callback = callback.clone();
            async move {
                let ack = move || {
                    if subscribed.fetch_add(1, Ordering::SeqCst) + 1 == majority {
                        callback();
                    }
                };
                match this
                    .guarded(this.subscribe_dispatch(&sentinel, client_timeout, ack))
                    .await
                {
                    Ok(Some(notified)) => notified,
                    Ok(None) => false,
                    Err(e) => {
                        error!(sentinel = %sentinel, error = %e, "sentinel subscribe failed");
                        false
                    }
                }
            }
        });

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut alive = total;
        while alive >= majority {
            tokio::select! {
                _ = self.token.cancelled() => return false,
                _ = &mut deadline => return false,
                reply = rx.recv() => {
                    match reply {
                        Some(true) => {
                            info!("sentinel subscribe notified +switch-master");
                            return true;
                        }
                        Some(false) => alive -= 1,
                        None => return false,
                    }
                }
            }
        }
        warn!(alive, total, "sentinel subscribe lost majority");
        false
    }

    /// Returns `Ok(true)` once a `+switch-master` for this product arrives.
    async fn subscribe_dispatch(
        &self,
        sentinel: &str,
        timeout: Duration,
        on_subscribed: impl Fn(),
    ) -> Result<bool> {
        let mut client = RedisClient::connect(sentinel, "", timeout).await?;
        let ack = client.command(&["SUBSCRIBE", "+switch-master"]).await?;
        let ok = ack
            .as_array()
            .filter(|items| items.len() == 3)
            .map(|items| {
                items[0].as_text().as_deref() == Some("subscribe")
                    && items[1].as_text().as_deref() == Some("+switch-master")
            })
            .unwrap_or(false);
        if !ok {
            return Err(CacheMgrError::RedisProtocol(format!(
                "unexpected subscribe ack: {:?}",
                ack
            )));
        }
        on_subscribed();

        loop {
            let message = client.receive().await?;
            let items = message.as_array().ok_or_else(|| {
                CacheMgrError::RedisProtocol("subscribe: message is not an array".into())
            })?;
            if items.len() < 3 || items[0].as_text().as_deref() != Some("message") {
                return Err(CacheMgrError::RedisProtocol(format!(
                    "unexpected pubsub frame: {:?}",
                    message
                )));
            }
            if items[1].as_text().as_deref() != Some("+switch-master") {
                continue;
            }
            let payload = items[2].as_text().unwrap_or_default();
            info!(sentinel, payload = %payload, "sentinel switch-master event");
            let name = payload.split(' ').next().unwrap_or("");
            if self.group_of(name).is_some() {
                return Ok(true);
            }
        }
    }

    // ---- single-sentinel helpers ------------------------------------

    /// `SENTINEL flushconfig` against one sentinel.
    pub async fn flush_config(&self, sentinel: &str, timeout: Duration) -> Result<()> {
        let mut client = RedisClient::connect(sentinel, "", timeout).await?;
        client.command(&["SENTINEL", "flushconfig"]).await?;
        Ok(())
    }

    /// Masters and their slaves as one sentinel sees them, keyed by the
    /// on-wire monitor name.
    pub async fn masters_and_slaves(
        &self,
        sentinel: &str,
        timeout: Duration,
    ) -> Result<HashMap<String, SentinelGroup>> {
        let mut client = RedisClient::connect(sentinel, "", timeout).await?;
        self.masters_and_slaves_client(&mut client).await
    }

    /// Same as [`Self::masters_and_slaves`] over an existing connection;
    /// used by the stats pipeline which already holds a pooled client.
    pub async fn masters_and_slaves_client(
        &self,
        client: &mut RedisClient,
    ) -> Result<HashMap<String, SentinelGroup>> {
        let masters = self.masters_command(client).await?;
        let mut results = HashMap::with_capacity(masters.len());
        for (group, master) in masters {
            let name = self.node_name(&group);
            let reply = client.command(&["SENTINEL", "slaves", name.as_str()]).await?;
            let mut slaves = Vec::new();
            if let Some(entries) = reply.as_array() {
                for entry in entries {
                    if let Some(map) = entry.as_string_map() {
                        slaves.push(map);
                    }
                }
            }
            results.insert(
                name,
                SentinelGroup {
                    master,
                    slaves,
                },
            );
        }
        Ok(results)
    }
}
