//! Template-file mapper.
//!
//! Mirrors a local directory of template files into the store so every node
//! of the fleet sees the same set. On startup the reconciliation also runs
//! the other way: files that exist only in the store are materialised to
//! disk, so a fresh node inherits the fleet's current templates. A periodic
//! scanner then diffs the directory against the cached state and pushes
//! additions, updates and deletions.

use crate::error::{CacheMgrError, Result};
use crate::mapper::TemplateFileMapper;
use crate::model::{TemplateFile, TemplateFiles};
use crate::store::{path, Store};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct StoreTemplateFileMapper {
    inner: Arc<Inner>,
    shutdown: CancellationToken,
}

struct Inner {
    store: Arc<dyn Store>,
    scan_pattern: String,
    tfs: Mutex<TemplateFiles>,
}

impl StoreTemplateFileMapper {
    /// Build the mapper, reconcile both directions once, and start the
    /// periodic scanner.
    pub async fn new(
        store: Arc<dyn Store>,
        scan_pattern: &str,
        interval: Duration,
    ) -> Result<Self> {
        let inner = Arc::new(Inner {
            store,
            scan_pattern: scan_pattern.to_string(),
            tfs: Mutex::new(TemplateFiles::new()),
        });
        inner.init().await?;

        let shutdown = CancellationToken::new();
        let scanner = inner.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = scanner.scan_once().await {
                    error!(error = %e, "template scan failed");
                }
            }
        });

        Ok(Self { inner, shutdown })
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Run one scan pass immediately; test hook and startup helper.
    pub async fn scan_once(&self) -> Result<()> {
        self.inner.scan_once().await
    }
}

impl Drop for StoreTemplateFileMapper {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl TemplateFileMapper for StoreTemplateFileMapper {
    fn info(&self) -> TemplateFiles {
        self.inner.tfs.lock().clone()
    }
}

impl Inner {
    fn local_dir(&self) -> PathBuf {
        Path::new(&self.scan_pattern)
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    async fn init(&self) -> Result<()> {
        let dir = self.local_dir();
        std::fs::create_dir_all(&dir)?;

        let nodes = self.store.list(&path::template_file_dir(), false).await?;
        let mut tfs = TemplateFiles::new();
        for node in nodes {
            let data = self.store.read(&node, true).await?.unwrap_or_default();
            let md5 = md5::compute(&data).0;
            tfs.insert(path::base_name(&node).to_string(), TemplateFile { data, md5 });
        }

        // Materialise store-only files so this node starts with the
        // fleet's current set.
        let local = self.matching_files()?;
        for (name, tf) in &tfs {
            if local.contains_key(name) {
                continue;
            }
            let target = dir.join(name);
            std::fs::write(&target, &tf.data).map_err(|e| {
                CacheMgrError::Internal(format!("write {}: {}", target.display(), e))
            })?;
            info!(file = %name, "materialised template from store");
        }

        *self.tfs.lock() = tfs;
        Ok(())
    }

    async fn scan_once(&self) -> Result<()> {
        let mut fresh = TemplateFiles::new();
        for (name, full_path) in self.matching_files()? {
            let data = std::fs::read(&full_path).map_err(|e| {
                CacheMgrError::Internal(format!("read {}: {}", full_path.display(), e))
            })?;
            let md5 = md5::compute(&data).0;
            fresh.insert(name, TemplateFile { data, md5 });
        }

        let previous = self.tfs.lock().clone();

        for name in previous.keys() {
            if fresh.contains_key(name) {
                continue;
            }
            info!(file = %name, "template removed locally, deleting from store");
            if let Err(e) = self.store.delete(&path::template_file_path(name)).await {
                error!(file = %name, error = %e, "template delete failed");
            }
        }

        let mut failed = Vec::new();
        for (name, tf) in &fresh {
            if previous.get(name).map(|old| old.md5) == Some(tf.md5) {
                continue;
            }
            info!(file = %name, "template changed, mirroring to store");
            if let Err(e) = self
                .store
                .update(&path::template_file_path(name), &tf.data)
                .await
            {
                error!(file = %name, error = %e, "template update failed");
                failed.push(name.clone());
            }
        }
        for name in failed {
            fresh.remove(&name);
        }

        *self.tfs.lock() = fresh;
        Ok(())
    }

    fn matching_files(&self) -> Result<HashMap<String, PathBuf>> {
        let entries = glob::glob(&self.scan_pattern)
            .map_err(|e| CacheMgrError::InvalidArgument(format!("bad scan pattern: {}", e)))?;
        let mut files = HashMap::new();
        for entry in entries {
            let full_path = match entry {
                Ok(p) => p,
                Err(e) => {
                    error!(error = %e, "template scan entry failed");
                    continue;
                }
            };
            if full_path.is_dir() {
                continue;
            }
            if let Some(name) = full_path.file_name().and_then(|n| n.to_str()) {
                files.insert(name.to_string(), full_path.clone());
            }
        }
        Ok(files)
    }
}
