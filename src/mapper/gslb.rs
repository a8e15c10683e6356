//! GSLB mapper.
//!
//! GSLB records live in a cross-product namespace
//! (`/cache-manager/gslb/<name>/<product>`), so the snapshot is filtered to
//! this mapper's product on load. Records whose server list is empty are
//! treated as deleted and skipped.

use crate::error::Result;
use crate::mapper::{decode, encode, GslbMapper};
use crate::model::{Gslb, Gslbs};
use crate::store::{path, Store};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, trace};

pub struct StoreGslbMapper {
    product: String,
    store: Arc<dyn Store>,
    gslbs: Mutex<Gslbs>,
}

impl StoreGslbMapper {
    pub async fn new(product: &str, store: Arc<dyn Store>) -> Result<Self> {
        let mapper = Self {
            product: product.to_string(),
            store,
            gslbs: Mutex::new(Gslbs::new()),
        };
        mapper.init().await?;
        Ok(mapper)
    }

    async fn init(&self) -> Result<()> {
        let gslb_dirs = self.store.list(&path::gslb_dir(), false).await?;
        let mut gslbs = Gslbs::new();
        for dir in gslb_dirs {
            let product_nodes = self.store.list(&dir, false).await?;
            for node in product_nodes {
                if path::base_name(&node) != self.product {
                    continue;
                }
                let data = self.store.read(&node, true).await?;
                let gslb: Gslb = decode(data.as_deref().unwrap_or_default())?;
                if gslb.servers.is_empty() {
                    continue;
                }
                gslbs.insert(gslb.name.clone(), gslb);
            }
        }
        *self.gslbs.lock() = gslbs;
        Ok(())
    }
}

#[async_trait]
impl GslbMapper for StoreGslbMapper {
    async fn update(&self, gslb: &Gslb) -> Result<()> {
        // Projection runs every stats tick; skip the store write when
        // nothing changed.
        if self.gslbs.lock().get(&gslb.name) == Some(gslb) {
            trace!(gslb = %gslb.name, "gslb record unchanged");
            return Ok(());
        }

        info!(gslb = %gslb.name, "updating gslb record");
        let data = encode(gslb)?;
        self.store
            .update(&path::gslb_path(&gslb.name, &self.product), &data)
            .await?;
        self.gslbs.lock().insert(gslb.name.clone(), gslb.clone());
        Ok(())
    }

    async fn delete(&self, gslb: &Gslb) -> Result<()> {
        info!(gslb = %gslb.name, "removing gslb record");
        self.store
            .delete(&path::gslb_path(&gslb.name, &self.product))
            .await?;
        self.gslbs.lock().remove(&gslb.name);
        Ok(())
    }

    fn info(&self) -> Gslbs {
        self.gslbs.lock().clone()
    }
}
