//! etcd-backed store client.
//!
//! etcd v3 has a flat keyspace, so the directory-shaped API is emulated
//! with key prefixes. Ephemerality is emulated with a lease whose TTL is
//! refreshed at TTL/2 by a background task; the signal fires as soon as a
//! refresh fails.

use crate::error::{CacheMgrError, Result};
use crate::store::{split_auth, Signal, Store};
use async_trait::async_trait;
use etcd_client::{
    Compare, CompareOp, ConnectOptions, GetOptions, PutOptions, SortOrder, SortTarget, Txn, TxnOp,
    WatchOptions,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct EtcdStore {
    client: etcd_client::Client,
    timeout: Duration,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl EtcdStore {
    /// Connect to a comma-separated endpoint list. Endpoints without a
    /// scheme get `http://` prepended.
    pub async fn connect(addrlist: &str, auth: &str, timeout: Duration) -> Result<Self> {
        let endpoints: Vec<String> = addrlist
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| {
                if s.starts_with("http://") || s.starts_with("https://") {
                    s.to_string()
                } else {
                    format!("http://{}", s)
                }
            })
            .collect();
        if endpoints.is_empty() {
            return Err(CacheMgrError::InvalidArgument(
                "empty etcd address list".to_string(),
            ));
        }

        let timeout = if timeout.is_zero() {
            Duration::from_secs(5)
        } else {
            timeout
        };

        let mut options = ConnectOptions::new()
            .with_timeout(Duration::from_secs(5))
            .with_connect_timeout(Duration::from_secs(5));
        if let Some((user, password)) = split_auth(auth)? {
            options = options.with_user(user, password);
        }

        let client = etcd_client::Client::connect(&endpoints, Some(options))
            .await
            .map_err(|e| CacheMgrError::Store(format!("etcd connect: {}", e)))?;

        Ok(Self {
            client,
            timeout,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(CacheMgrError::StoreClosed)
        } else {
            Ok(())
        }
    }

    fn ttl_secs(&self) -> i64 {
        self.timeout.as_secs().max(1) as i64
    }

    /// Keep an ephemeral lease alive, refreshing at TTL/2. Drops `tx` (and
    /// with it resolves the caller's signal) on the first failed refresh.
    fn spawn_lease_refresher(&self, lease_id: i64, tx: oneshot::Sender<()>) {
        let client = self.client.clone();
        let refresh_every = self.timeout / 2;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let _tx = tx;
            let mut lease = client.lease_client();
            let keep_alive = lease.keep_alive(lease_id).await;
            let (mut keeper, mut responses) = match keep_alive {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(lease_id, error = %e, "etcd lease keep-alive setup failed");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(refresh_every) => {}
                }
                if keeper.keep_alive().await.is_err() {
                    debug!(lease_id, "etcd lease refresh failed");
                    return;
                }
                match responses.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {}
                    _ => {
                        debug!(lease_id, "etcd lease expired");
                        return;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Store for EtcdStore {
    async fn create(&self, path: &str, data: &[u8]) -> Result<()> {
        self.check_open()?;
        debug!(path, "etcd create node");
        let txn = Txn::new()
            .when(vec![Compare::version(path, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(path, data, None)]);
        let resp = self
            .client
            .kv_client()
            .txn(txn)
            .await
            .map_err(|e| CacheMgrError::Store(format!("etcd create {}: {}", path, e)))?;
        if !resp.succeeded() {
            return Err(CacheMgrError::AlreadyExists {
                kind: "node",
                name: path.to_string(),
            });
        }
        Ok(())
    }

    async fn update(&self, path: &str, data: &[u8]) -> Result<()> {
        self.check_open()?;
        debug!(path, "etcd update node");
        self.client
            .kv_client()
            .put(path, data, None)
            .await
            .map_err(|e| CacheMgrError::Store(format!("etcd update {}: {}", path, e)))?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check_open()?;
        debug!(path, "etcd delete node");
        self.client
            .kv_client()
            .delete(path, None)
            .await
            .map_err(|e| CacheMgrError::Store(format!("etcd delete {}: {}", path, e)))?;
        Ok(())
    }

    async fn read(&self, path: &str, must: bool) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let resp = self
            .client
            .kv_client()
            .get(path, None)
            .await
            .map_err(|e| CacheMgrError::Store(format!("etcd read {}: {}", path, e)))?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(kv.value().to_vec())),
            None if must => Err(CacheMgrError::StoreNodeMissing(path.to_string())),
            None => Ok(None),
        }
    }

    async fn list(&self, path: &str, must: bool) -> Result<Vec<String>> {
        self.check_open()?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let options = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Key, SortOrder::Ascend);
        let resp = self
            .client
            .kv_client()
            .get(prefix.as_str(), Some(options))
            .await
            .map_err(|e| CacheMgrError::Store(format!("etcd list {}: {}", path, e)))?;

        // Keys deeper than one level collapse onto their direct child.
        let mut children = BTreeSet::new();
        for kv in resp.kvs() {
            let key = kv
                .key_str()
                .map_err(|e| CacheMgrError::Store(format!("etcd list {}: {}", path, e)))?;
            if let Some(rest) = key.strip_prefix(&prefix) {
                let child = rest.split('/').next().unwrap_or(rest);
                if !child.is_empty() {
                    children.insert(format!("{}{}", prefix, child));
                }
            }
        }
        if children.is_empty() && must {
            return Err(CacheMgrError::StoreNodeMissing(path.to_string()));
        }
        Ok(children.into_iter().collect())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();
        Ok(())
    }

    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<Signal> {
        self.check_open()?;
        debug!(path, "etcd create ephemeral node");
        let lease = self
            .client
            .lease_client()
            .grant(self.ttl_secs(), None)
            .await
            .map_err(|e| CacheMgrError::Store(format!("etcd lease grant: {}", e)))?;
        let lease_id = lease.id();

        let txn = Txn::new()
            .when(vec![Compare::version(path, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                path,
                data,
                Some(PutOptions::new().with_lease(lease_id)),
            )]);
        let resp = self
            .client
            .kv_client()
            .txn(txn)
            .await
            .map_err(|e| CacheMgrError::Store(format!("etcd create {}: {}", path, e)))?;
        if !resp.succeeded() {
            return Err(CacheMgrError::AlreadyExists {
                kind: "node",
                name: path.to_string(),
            });
        }

        let (tx, rx) = oneshot::channel();
        self.spawn_lease_refresher(lease_id, tx);
        Ok(rx)
    }

    async fn create_ephemeral_in_order(
        &self,
        path: &str,
        data: &[u8],
    ) -> Result<(Signal, String)> {
        self.check_open()?;
        let lease = self
            .client
            .lease_client()
            .grant(self.ttl_secs(), None)
            .await
            .map_err(|e| CacheMgrError::Store(format!("etcd lease grant: {}", e)))?;
        let lease_id = lease.id();

        // Sequence numbers come from the store revision; retry on the rare
        // collision with a concurrent creator.
        for _ in 0..8 {
            let resp = self
                .client
                .kv_client()
                .get(path, Some(GetOptions::new().with_prefix().with_count_only()))
                .await
                .map_err(|e| CacheMgrError::Store(format!("etcd list {}: {}", path, e)))?;
            let revision = resp.header().map(|h| h.revision()).unwrap_or(0);
            let node = format!("{}/{:020}", path.trim_end_matches('/'), revision + 1);

            let txn = Txn::new()
                .when(vec![Compare::version(node.as_str(), CompareOp::Equal, 0)])
                .and_then(vec![TxnOp::put(
                    node.as_str(),
                    data,
                    Some(PutOptions::new().with_lease(lease_id)),
                )]);
            let resp = self
                .client
                .kv_client()
                .txn(txn)
                .await
                .map_err(|e| CacheMgrError::Store(format!("etcd create {}: {}", node, e)))?;
            if resp.succeeded() {
                debug!(node, "etcd create ephemeral in order");
                let (tx, rx) = oneshot::channel();
                self.spawn_lease_refresher(lease_id, tx);
                return Ok((rx, node));
            }
        }
        Err(CacheMgrError::Store(format!(
            "etcd create in order under {}: too many collisions",
            path
        )))
    }

    async fn watch_in_order(&self, path: &str) -> Result<(Signal, Vec<String>)> {
        self.check_open()?;
        let children = self.list(path, false).await?;
        let resp = self
            .client
            .kv_client()
            .get(path, Some(GetOptions::new().with_count_only()))
            .await
            .map_err(|e| CacheMgrError::Store(format!("etcd watch {}: {}", path, e)))?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or(0);

        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut watch_client = self.client.watch_client();
        let (_watcher, mut stream) = watch_client
            .watch(
                prefix.as_str(),
                Some(
                    WatchOptions::new()
                        .with_prefix()
                        .with_start_revision(revision + 1),
                ),
            )
            .await
            .map_err(|e| CacheMgrError::Store(format!("etcd watch {}: {}", path, e)))?;

        let (tx, rx) = oneshot::channel();
        let shutdown = self.shutdown.clone();
        let watched = path.to_string();
        tokio::spawn(async move {
            let _tx = tx;
            let _watcher = _watcher;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    msg = stream.message() => match msg {
                        Ok(Some(resp)) if !resp.events().is_empty() => {
                            debug!(path = %watched, "etcd watched subtree changed");
                            return;
                        }
                        Ok(Some(_)) => continue,
                        _ => return,
                    },
                }
            }
        });
        Ok((rx, children))
    }
}
