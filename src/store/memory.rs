//! In-process store backend.
//!
//! Implements the full [`Store`] contract over a plain map. Used by tests
//! and by local single-node experiments; nothing here survives a restart.

use crate::error::{CacheMgrError, Result};
use crate::store::{Signal, Store};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<String, Vec<u8>>,
    /// Paths created ephemerally, removed on close.
    ephemeral_paths: Vec<String>,
    /// Senders kept alive until close; dropping one fires its signal.
    ephemeral_sessions: Vec<oneshot::Sender<()>>,
    watchers: Vec<(String, oneshot::Sender<()>)>,
    sequence: u64,
}

impl Inner {
    fn fire_watchers(&mut self, changed: &str) {
        let mut kept = Vec::with_capacity(self.watchers.len());
        for (prefix, tx) in self.watchers.drain(..) {
            if changed == prefix || changed.starts_with(&format!("{}/", prefix)) {
                drop(tx);
            } else {
                kept.push((prefix, tx));
            }
        }
        self.watchers = kept;
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut children: Vec<String> = self
            .nodes
            .keys()
            .filter_map(|key| {
                let rest = key.strip_prefix(&prefix)?;
                let child = rest.split('/').next()?;
                Some(format!("{}{}", prefix, child))
            })
            .collect();
        children.dedup();
        children
    }

}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
    closed: AtomicBool,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(CacheMgrError::StoreClosed)
        } else {
            Ok(())
        }
    }

    /// Direct snapshot of a node, bypassing the trait; test helper.
    pub fn peek(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.lock().nodes.get(path).cloned()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn create(&self, path: &str, data: &[u8]) -> Result<()> {
        self.check_open()?;
        let mut inner = self.inner.lock();
        if inner.nodes.contains_key(path) {
            return Err(CacheMgrError::AlreadyExists {
                kind: "node",
                name: path.to_string(),
            });
        }
        inner.nodes.insert(path.to_string(), data.to_vec());
        inner.fire_watchers(path);
        Ok(())
    }

    async fn update(&self, path: &str, data: &[u8]) -> Result<()> {
        self.check_open()?;
        let mut inner = self.inner.lock();
        inner.nodes.insert(path.to_string(), data.to_vec());
        inner.fire_watchers(path);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check_open()?;
        let mut inner = self.inner.lock();
        if inner.nodes.remove(path).is_some() {
            inner.fire_watchers(path);
        }
        Ok(())
    }

    async fn read(&self, path: &str, must: bool) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let inner = self.inner.lock();
        match inner.nodes.get(path) {
            Some(data) => Ok(Some(data.clone())),
            None if must => Err(CacheMgrError::StoreNodeMissing(path.to_string())),
            None => Ok(None),
        }
    }

    async fn list(&self, path: &str, must: bool) -> Result<Vec<String>> {
        self.check_open()?;
        let inner = self.inner.lock();
        let children = inner.children_of(path);
        if children.is_empty() && must {
            // A childless data node is a file, not a directory.
            if inner.nodes.contains_key(path) {
                return Err(CacheMgrError::StoreNotDir(path.to_string()));
            }
            return Err(CacheMgrError::StoreNodeMissing(path.to_string()));
        }
        Ok(children)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        for path in std::mem::take(&mut inner.ephemeral_paths) {
            inner.nodes.remove(&path);
            inner.fire_watchers(&path);
        }
        inner.ephemeral_sessions.clear();
        inner.watchers.clear();
        Ok(())
    }

    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<Signal> {
        self.check_open()?;
        let mut inner = self.inner.lock();
        if inner.nodes.contains_key(path) {
            return Err(CacheMgrError::AlreadyExists {
                kind: "node",
                name: path.to_string(),
            });
        }
        inner.nodes.insert(path.to_string(), data.to_vec());
        inner.ephemeral_paths.push(path.to_string());
        let (tx, rx) = oneshot::channel();
        inner.ephemeral_sessions.push(tx);
        inner.fire_watchers(path);
        Ok(rx)
    }

    async fn create_ephemeral_in_order(
        &self,
        path: &str,
        data: &[u8],
    ) -> Result<(Signal, String)> {
        self.check_open()?;
        let mut inner = self.inner.lock();
        inner.sequence += 1;
        let node = format!("{}/{:010}", path.trim_end_matches('/'), inner.sequence);
        inner.nodes.insert(node.clone(), data.to_vec());
        inner.ephemeral_paths.push(node.clone());
        let (tx, rx) = oneshot::channel();
        inner.ephemeral_sessions.push(tx);
        inner.fire_watchers(&node);
        Ok((rx, node))
    }

    async fn watch_in_order(&self, path: &str) -> Result<(Signal, Vec<String>)> {
        self.check_open()?;
        let mut inner = self.inner.lock();
        let children = inner.children_of(path);
        let (tx, rx) = oneshot::channel();
        inner.watchers.push((path.trim_end_matches('/').to_string(), tx));
        Ok((rx, children))
    }
}
