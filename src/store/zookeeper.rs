//! ZooKeeper-backed store client.
//!
//! ZooKeeper gives us real session-ephemeral and sequential nodes, so this
//! backend maps almost one-to-one onto the [`Store`] contract. The signal
//! returned for ephemerals fires when the session expires.

use crate::error::{CacheMgrError, Result};
use crate::store::{Signal, Store};
use async_trait::async_trait;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_zookeeper::error as zk_error;
use tokio_zookeeper::{Acl, CreateMode, KeeperState, WatchedEventType, ZooKeeper, ZooKeeperBuilder};
use tracing::{debug, warn};

pub struct ZkStore {
    zk: ZooKeeper,
    closed: AtomicBool,
    /// Cancelled when the ZooKeeper session expires or the client closes;
    /// every ephemeral signal hangs off this.
    session_lost: CancellationToken,
}

impl ZkStore {
    /// Connect to the first resolvable endpoint of a comma-separated list.
    pub async fn connect(addrlist: &str, auth: &str, timeout: Duration) -> Result<Self> {
        if !auth.is_empty() {
            warn!("zookeeper backend ignores coordinator_auth; use ACL-free paths");
        }

        let mut resolved: Option<SocketAddr> = None;
        for endpoint in addrlist.split(',').filter(|s| !s.is_empty()) {
            match tokio::net::lookup_host(endpoint).await {
                Ok(mut addrs) => {
                    if let Some(addr) = addrs.next() {
                        resolved = Some(addr);
                        break;
                    }
                }
                Err(e) => debug!(endpoint, error = %e, "zookeeper endpoint lookup failed"),
            }
        }
        let addr = resolved.ok_or_else(|| {
            CacheMgrError::InvalidArgument(format!("no resolvable zookeeper endpoint in '{}'", addrlist))
        })?;

        let mut builder = ZooKeeperBuilder::default();
        if !timeout.is_zero() {
            builder.set_timeout(timeout);
        }
        let (zk, mut default_watcher) = builder
            .connect(&addr)
            .await
            .map_err(|e| CacheMgrError::Store(format!("zookeeper connect {}: {}", addr, e)))?;

        let session_lost = CancellationToken::new();
        let lost = session_lost.clone();
        tokio::spawn(async move {
            while let Some(event) = default_watcher.next().await {
                if event.event_type == WatchedEventType::None
                    && event.keeper_state == KeeperState::Expired
                {
                    warn!("zookeeper session expired");
                    lost.cancel();
                    return;
                }
            }
            // Stream end means the connection is gone for good.
            lost.cancel();
        });

        Ok(Self {
            zk,
            closed: AtomicBool::new(false),
            session_lost,
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(CacheMgrError::StoreClosed)
        } else {
            Ok(())
        }
    }

    /// Create every missing ancestor of `path` as a persistent node.
    async fn mkdir_all(&self, path: &str) -> Result<()> {
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            let result = self
                .zk
                .create(&current, &b""[..], Acl::open_unsafe(), CreateMode::Persistent)
                .await
                .map_err(|e| CacheMgrError::Store(format!("zookeeper mkdir {}: {}", current, e)))?;
            match result {
                Ok(_) | Err(zk_error::Create::NodeExists) => {}
                Err(e) => {
                    return Err(CacheMgrError::Store(format!(
                        "zookeeper mkdir {}: {}",
                        current, e
                    )))
                }
            }
        }
        Ok(())
    }

    async fn create_node(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        if let Some((parent, _)) = path.rsplit_once('/') {
            if !parent.is_empty() {
                self.mkdir_all(parent).await?;
            }
        }
        let result = self
            .zk
            .create(path, data.to_vec(), Acl::open_unsafe(), mode)
            .await
            .map_err(|e| CacheMgrError::Store(format!("zookeeper create {}: {}", path, e)))?;
        match result {
            Ok(assigned) => Ok(assigned),
            Err(zk_error::Create::NodeExists) => Err(CacheMgrError::AlreadyExists {
                kind: "node",
                name: path.to_string(),
            }),
            Err(e) => Err(CacheMgrError::Store(format!(
                "zookeeper create {}: {}",
                path, e
            ))),
        }
    }

    /// Signal wired to session loss.
    fn session_signal(&self) -> Signal {
        let (tx, rx) = oneshot::channel();
        let lost = self.session_lost.clone();
        tokio::spawn(async move {
            let _tx = tx;
            lost.cancelled().await;
        });
        rx
    }
}

#[async_trait]
impl Store for ZkStore {
    async fn create(&self, path: &str, data: &[u8]) -> Result<()> {
        self.check_open()?;
        debug!(path, "zookeeper create node");
        self.create_node(path, data, CreateMode::Persistent).await?;
        Ok(())
    }

    async fn update(&self, path: &str, data: &[u8]) -> Result<()> {
        self.check_open()?;
        debug!(path, "zookeeper update node");
        let result = self
            .zk
            .set_data(path, None, data.to_vec())
            .await
            .map_err(|e| CacheMgrError::Store(format!("zookeeper update {}: {}", path, e)))?;
        match result {
            Ok(_) => Ok(()),
            Err(zk_error::SetData::NoNode) => {
                self.create_node(path, data, CreateMode::Persistent).await?;
                Ok(())
            }
            Err(e) => Err(CacheMgrError::Store(format!(
                "zookeeper update {}: {}",
                path, e
            ))),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check_open()?;
        debug!(path, "zookeeper delete node");
        let result = self
            .zk
            .delete(path, None)
            .await
            .map_err(|e| CacheMgrError::Store(format!("zookeeper delete {}: {}", path, e)))?;
        match result {
            Ok(()) | Err(zk_error::Delete::NoNode) => Ok(()),
            Err(e) => Err(CacheMgrError::Store(format!(
                "zookeeper delete {}: {}",
                path, e
            ))),
        }
    }

    async fn read(&self, path: &str, must: bool) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let data = self
            .zk
            .get_data(path)
            .await
            .map_err(|e| CacheMgrError::Store(format!("zookeeper read {}: {}", path, e)))?;
        match data {
            Some((bytes, _stat)) => Ok(Some(bytes)),
            None if must => Err(CacheMgrError::StoreNodeMissing(path.to_string())),
            None => Ok(None),
        }
    }

    async fn list(&self, path: &str, must: bool) -> Result<Vec<String>> {
        self.check_open()?;
        let children = self
            .zk
            .get_children(path)
            .await
            .map_err(|e| CacheMgrError::Store(format!("zookeeper list {}: {}", path, e)))?;
        match children {
            Some(mut names) => {
                names.sort();
                Ok(names
                    .into_iter()
                    .map(|name| format!("{}/{}", path.trim_end_matches('/'), name))
                    .collect())
            }
            None if must => Err(CacheMgrError::StoreNodeMissing(path.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.session_lost.cancel();
        Ok(())
    }

    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<Signal> {
        self.check_open()?;
        debug!(path, "zookeeper create ephemeral node");
        self.create_node(path, data, CreateMode::Ephemeral).await?;
        Ok(self.session_signal())
    }

    async fn create_ephemeral_in_order(
        &self,
        path: &str,
        data: &[u8],
    ) -> Result<(Signal, String)> {
        self.check_open()?;
        let assigned = self
            .create_node(path, data, CreateMode::EphemeralSequential)
            .await?;
        debug!(node = %assigned, "zookeeper create ephemeral in order");
        Ok((self.session_signal(), assigned))
    }

    async fn watch_in_order(&self, path: &str) -> Result<(Signal, Vec<String>)> {
        self.check_open()?;
        self.mkdir_all(path).await?;
        let (watch, children) = self
            .zk
            .with_watcher()
            .get_children(path)
            .await
            .map_err(|e| CacheMgrError::Store(format!("zookeeper watch {}: {}", path, e)))?
            .ok_or_else(|| CacheMgrError::Store(format!("zookeeper watch {}: node missing", path)))?;
        let mut names = children;
        names.sort();
        let children = names
            .into_iter()
            .map(|name| format!("{}/{}", path.trim_end_matches('/'), name))
            .collect();

        let (tx, rx) = oneshot::channel();
        let watched = path.to_string();
        tokio::spawn(async move {
            let _tx = tx;
            if watch.await.is_ok() {
                debug!(path = %watched, "zookeeper watched subtree changed");
            }
        });
        Ok((rx, children))
    }
}
