//! Group mapper.

use crate::error::Result;
use crate::mapper::{decode, encode, GroupMapper};
use crate::model::{Group, Groups};
use crate::store::{path, Store};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

pub struct StoreGroupMapper {
    product: String,
    store: Arc<dyn Store>,
    groups: Mutex<Groups>,
}

impl StoreGroupMapper {
    /// Build the mapper and load every group record under the product.
    pub async fn new(product: &str, store: Arc<dyn Store>) -> Result<Self> {
        let mapper = Self {
            product: product.to_string(),
            store,
            groups: Mutex::new(Groups::new()),
        };
        mapper.init().await?;
        Ok(mapper)
    }

    async fn init(&self) -> Result<()> {
        let paths = self.store.list(&path::group_dir(&self.product), false).await?;
        let mut groups = Groups::new();
        for node in paths {
            let data = self.store.read(&node, true).await?;
            let group: Group = decode(data.as_deref().unwrap_or_default())?;
            groups.insert(group.name.clone(), group);
        }
        *self.groups.lock() = groups;
        Ok(())
    }

    async fn write_through(&self, group: &Group) -> Result<()> {
        let data = encode(group)?;
        self.store
            .update(&path::group_path(&self.product, &group.name), &data)
            .await?;
        self.groups.lock().insert(group.name.clone(), group.clone());
        Ok(())
    }
}

#[async_trait]
impl GroupMapper for StoreGroupMapper {
    async fn create(&self, group: &Group) -> Result<()> {
        info!(group = %group.name, "creating group record");
        self.write_through(group).await
    }

    async fn update(&self, group: &Group) -> Result<()> {
        info!(group = %group.name, "updating group record");
        self.write_through(group).await
    }

    async fn remove(&self, group: &Group) -> Result<()> {
        info!(group = %group.name, "removing group record");
        self.store
            .delete(&path::group_path(&self.product, &group.name))
            .await?;
        self.groups.lock().remove(&group.name);
        Ok(())
    }

    fn info(&self) -> Groups {
        self.groups.lock().clone()
    }
}
