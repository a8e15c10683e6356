//! Topom (leader registration) mapper.
//!
//! The record is built once at construction from the local process
//! environment; `create` registers it under the product path as an
//! ephemeral node so its presence doubles as a liveness signal.

use crate::error::Result;
use crate::mapper::{encode, TopomMapper};
use crate::model::Topom;
use crate::store::{path, Store};
use async_trait::async_trait;
use std::process::Command;
use std::sync::Arc;
use tracing::{error, info};

pub struct StoreTopomMapper {
    product: String,
    store: Arc<dyn Store>,
    topom: Topom,
}

impl StoreTopomMapper {
    pub fn new(product: &str, admin_addr: &str, store: Arc<dyn Store>) -> Self {
        let mut topom = Topom {
            start_time: chrono::Local::now().to_string(),
            admin_addr: admin_addr.to_string(),
            product_name: product.to_string(),
            pid: std::process::id(),
            pwd: String::new(),
            sys: String::new(),
        };
        if let Ok(pwd) = std::env::current_dir() {
            topom.pwd = pwd.display().to_string();
        }
        match Command::new("uname").arg("-a").output() {
            Ok(out) => topom.sys = String::from_utf8_lossy(&out.stdout).trim().to_string(),
            Err(e) => error!(error = %e, "running uname failed"),
        }
        info!(product = %product, pid = topom.pid, "topom record prepared");

        Self {
            product: product.to_string(),
            store,
            topom,
        }
    }
}

#[async_trait]
impl TopomMapper for StoreTopomMapper {
    async fn create(&self) -> Result<()> {
        let data = encode(&self.topom)?;
        // The signal is intentionally dropped: losing the session while
        // running is surfaced by the next mutation failing, same as any
        // other store outage.
        let _ = self
            .store
            .create_ephemeral(&path::topom_path(&self.product), &data)
            .await?;
        info!(product = %self.product, "topom registered");
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.store.delete(&path::topom_path(&self.product)).await?;
        info!(product = %self.product, "topom unregistered");
        Ok(())
    }

    fn info(&self) -> Topom {
        self.topom.clone()
    }
}
