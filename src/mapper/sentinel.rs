//! Sentinel-set mapper. A single record per product.

use crate::error::Result;
use crate::mapper::{decode, encode, SentinelMapper};
use crate::model::Sentinel;
use crate::store::{path, Store};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

pub struct StoreSentinelMapper {
    product: String,
    store: Arc<dyn Store>,
    sentinel: Mutex<Sentinel>,
}

impl StoreSentinelMapper {
    pub async fn new(product: &str, store: Arc<dyn Store>) -> Result<Self> {
        let mapper = Self {
            product: product.to_string(),
            store,
            sentinel: Mutex::new(Sentinel::default()),
        };
        if let Some(data) = mapper
            .store
            .read(&path::sentinel_path(&mapper.product), false)
            .await?
        {
            *mapper.sentinel.lock() = decode(&data)?;
        }
        Ok(mapper)
    }
}

#[async_trait]
impl SentinelMapper for StoreSentinelMapper {
    async fn update(&self, sentinel: &Sentinel) -> Result<()> {
        info!(
            servers = ?sentinel.servers,
            out_of_sync = sentinel.out_of_sync,
            "updating sentinel record"
        );
        let data = encode(sentinel)?;
        self.store
            .update(&path::sentinel_path(&self.product), &data)
            .await?;
        *self.sentinel.lock() = sentinel.clone();
        Ok(())
    }

    fn info(&self) -> Sentinel {
        self.sentinel.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemStore;

    #[tokio::test]
    async fn test_empty_store_yields_default_record() {
        let store = Arc::new(MemStore::new());
        let mapper = StoreSentinelMapper::new("demo", store).await.unwrap();
        let s = mapper.info();
        assert!(s.servers.is_empty());
        assert!(!s.out_of_sync);
    }

    #[tokio::test]
    async fn test_update_persists_and_reloads() {
        let store = Arc::new(MemStore::new());
        let mapper = StoreSentinelMapper::new("demo", store.clone()).await.unwrap();
        let record = Sentinel {
            servers: vec!["s1:26379".into(), "s2:26379".into()],
            out_of_sync: true,
        };
        mapper.update(&record).await.unwrap();
        assert_eq!(mapper.info(), record);

        let reloaded = StoreSentinelMapper::new("demo", store).await.unwrap();
        assert_eq!(reloaded.info(), record);
    }
}
