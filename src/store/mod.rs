//! Uniform metadata store client over ZooKeeper and etcd.
//!
//! The control plane treats the store as a tree of paths holding opaque
//! bytes, with three extras on top of plain key/value: ephemeral nodes tied
//! to the client session, ordered ephemeral nodes for election-style use,
//! and one-shot watches over a subtree.

pub mod etcd;
pub mod memory;
pub mod path;
pub mod zookeeper;

use crate::error::{CacheMgrError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Resolves once the associated condition fires: for ephemerals, the session
/// or lease was lost; for watches, the subtree changed. Dropping the sender
/// side is the signal, so waiting on the receiver never blocks forever while
/// the owning task is alive.
pub type Signal = oneshot::Receiver<()>;

/// Uniform store interface. "Not found" on a non-mandatory read or list
/// returns empty rather than an error.
#[async_trait]
pub trait Store: Send + Sync {
    /// Create a node; fails if the path already exists.
    async fn create(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Create or overwrite a node.
    async fn update(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Delete a node; succeeds if the path is already absent.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Read a node. `must` turns absence into an error.
    async fn read(&self, path: &str, must: bool) -> Result<Option<Vec<u8>>>;

    /// List the direct children of a node as full paths. `must` turns
    /// absence into an error.
    async fn list(&self, path: &str, must: bool) -> Result<Vec<String>>;

    /// Release the client. All ephemeral nodes eventually disappear.
    async fn close(&self) -> Result<()>;

    /// Create a session-tied node; the signal fires when the session or
    /// lease backing it is lost.
    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<Signal>;

    /// Sequential variant of [`Store::create_ephemeral`]; returns the
    /// assigned path alongside the signal.
    async fn create_ephemeral_in_order(&self, path: &str, data: &[u8])
        -> Result<(Signal, String)>;

    /// Snapshot the children of `path` and arm a one-shot watch that fires
    /// on the first modification at or below it.
    async fn watch_in_order(&self, path: &str) -> Result<(Signal, Vec<String>)>;
}

/// Build a store client for the configured backend.
pub async fn new_store(
    name: &str,
    addr: &str,
    auth: &str,
    timeout: Duration,
) -> Result<Arc<dyn Store>> {
    match name {
        "zk" | "zookeeper" => Ok(Arc::new(
            zookeeper::ZkStore::connect(addr, auth, timeout).await?,
        )),
        "etcd" => Ok(Arc::new(etcd::EtcdStore::connect(addr, auth, timeout).await?)),
        _ => Err(CacheMgrError::InvalidArgument(format!(
            "invalid coordinator name: {}",
            name
        ))),
    }
}

/// Split a `user:password` auth string.
pub(crate) fn split_auth(auth: &str) -> Result<Option<(String, String)>> {
    if auth.is_empty() {
        return Ok(None);
    }
    match auth.split_once(':') {
        Some((user, password)) if !user.is_empty() => {
            Ok(Some((user.to_string(), password.to_string())))
        }
        _ => Err(CacheMgrError::InvalidArgument(
            "invalid auth, expected user:password".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_auth() {
        assert_eq!(split_auth("").unwrap(), None);
        assert_eq!(
            split_auth("u:p").unwrap(),
            Some(("u".to_string(), "p".to_string()))
        );
        assert_eq!(
            split_auth("u:p:q").unwrap(),
            Some(("u".to_string(), "p:q".to_string()))
        );
        assert!(split_auth(":p").is_err());
        assert!(split_auth("nopassword").is_err());
    }

    #[tokio::test]
    async fn test_new_store_rejects_unknown_backend() {
        let err = new_store("consul", "127.0.0.1:1", "", Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("invalid coordinator name"));
    }
}
