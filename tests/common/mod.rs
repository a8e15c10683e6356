//! Shared fixture: a full service wired against the in-memory store and
//! recording stand-ins for the Redis, Sentinel, and GSLB sides.

use async_trait::async_trait;
use cachemgr::config::DashboardConfig;
use cachemgr::error::{CacheMgrError, Result};
use cachemgr::gslb::GslbOps;
use cachemgr::mapper::{
    StoreGroupMapper, StoreGslbMapper, StoreSentinelMapper, StoreTopomMapper, TemplateFileMapper,
};
use cachemgr::model::TemplateFiles;
use cachemgr::redis::{MonitorConfig, RedisOps, SentinelGroup};
use cachemgr::service::{SentinelFactory, SentinelOps, Service};
use cachemgr::store::memory::MemStore;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const PRODUCT: &str = "demo";

/// Records replication commands and serves scripted INFO maps.
#[derive(Default)]
pub struct RecordingRedis {
    pub set_master_calls: Mutex<Vec<(String, String)>>,
    pub force_sync_calls: Mutex<Vec<(String, String)>>,
    pub info_by_addr: Mutex<HashMap<String, HashMap<String, String>>>,
    pub failing: Mutex<HashSet<String>>,
}

impl RecordingRedis {
    pub fn set_info(&self, addr: &str, pairs: &[(&str, &str)]) {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.info_by_addr.lock().insert(addr.to_string(), map);
    }

    pub fn fail_addr(&self, addr: &str) {
        self.failing.lock().insert(addr.to_string());
    }
}

#[async_trait]
impl RedisOps for RecordingRedis {
    async fn info(&self, addr: &str) -> Result<HashMap<String, String>> {
        if self.failing.lock().contains(addr) {
            return Err(CacheMgrError::Network(format!("{} unreachable", addr)));
        }
        self.info_by_addr
            .lock()
            .get(addr)
            .cloned()
            .ok_or_else(|| CacheMgrError::Network(format!("{} unreachable", addr)))
    }

    async fn info_no_auth(&self, addr: &str) -> Result<HashMap<String, String>> {
        self.info(addr).await
    }

    async fn info_full(&self, addr: &str) -> Result<HashMap<String, String>> {
        self.info(addr).await
    }

    async fn set_master(&self, addr: &str, master: &str) -> Result<()> {
        if self.failing.lock().contains(addr) {
            return Err(CacheMgrError::Network(format!("{} unreachable", addr)));
        }
        self.set_master_calls
            .lock()
            .push((addr.to_string(), master.to_string()));
        Ok(())
    }

    async fn force_full_sync(&self, addr: &str, master: &str) -> Result<()> {
        self.force_sync_calls
            .lock()
            .push((addr.to_string(), master.to_string()));
        Ok(())
    }
}

/// Records sentinel fan-out calls; `masters` serves a scripted view.
#[derive(Default)]
pub struct RecordingSentinel {
    pub removed_groups: Mutex<Vec<HashSet<String>>>,
    pub remove_all_calls: Mutex<Vec<Vec<String>>>,
    pub monitored: Mutex<Vec<HashMap<String, String>>>,
    pub flushed: Mutex<Vec<String>>,
    pub masters_view: Mutex<HashMap<String, String>>,
    pub fail_remove_all: AtomicBool,
    cancelled: AtomicBool,
}

#[async_trait]
impl SentinelOps for RecordingSentinel {
    async fn masters(
        &self,
        _sentinels: &[String],
        _timeout: Duration,
    ) -> Result<HashMap<String, String>> {
        Ok(self.masters_view.lock().clone())
    }

    async fn monitor_groups(
        &self,
        _sentinels: &[String],
        _timeout: Duration,
        _config: &MonitorConfig,
        groups: &HashMap<String, String>,
    ) -> Result<()> {
        self.monitored.lock().push(groups.clone());
        Ok(())
    }

    async fn remove_groups(
        &self,
        _sentinels: &[String],
        _timeout: Duration,
        groups: &HashSet<String>,
    ) -> Result<()> {
        self.removed_groups.lock().push(groups.clone());
        Ok(())
    }

    async fn remove_groups_all(&self, sentinels: &[String], _timeout: Duration) -> Result<()> {
        if self.fail_remove_all.load(Ordering::SeqCst) {
            return Err(CacheMgrError::Sentinel("remove-all failed".into()));
        }
        self.remove_all_calls.lock().push(sentinels.to_vec());
        Ok(())
    }

    async fn flush_config(&self, sentinel: &str, _timeout: Duration) -> Result<()> {
        self.flushed.lock().push(sentinel.to_string());
        Ok(())
    }

    async fn masters_and_slaves(
        &self,
        _sentinel: &str,
        _timeout: Duration,
    ) -> Result<HashMap<String, SentinelGroup>> {
        Ok(HashMap::new())
    }

    async fn subscribe(
        &self,
        _sentinels: &[String],
        timeout: Duration,
        _on_majority_subscribed: Box<dyn Fn() + Send + Sync>,
    ) -> bool {
        // Behave like a quiet fleet: nothing happens until the deadline.
        tokio::time::sleep(timeout).await;
        false
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// GSLB probe where every address is up unless marked down.
#[derive(Default)]
pub struct ScriptedGslb {
    pub down: Mutex<HashSet<String>>,
}

#[async_trait]
impl GslbOps for ScriptedGslb {
    async fn status(&self, addr: &str, _timeout: Duration) -> Result<Vec<u8>> {
        if self.down.lock().contains(addr) {
            return Err(CacheMgrError::Network(format!("{} down", addr)));
        }
        Ok(b"OK".to_vec())
    }
}

pub struct EmptyTemplates;

impl TemplateFileMapper for EmptyTemplates {
    fn info(&self) -> TemplateFiles {
        TemplateFiles::new()
    }
}

pub struct Fixture {
    pub service: Arc<Service>,
    pub store: Arc<MemStore>,
    pub redis: Arc<RecordingRedis>,
    pub sentinel: Arc<RecordingSentinel>,
    pub gslb: Arc<ScriptedGslb>,
}

pub async fn fixture() -> Fixture {
    let store = Arc::new(MemStore::new());
    let redis = Arc::new(RecordingRedis::default());
    let sentinel = Arc::new(RecordingSentinel::default());
    let gslb = Arc::new(ScriptedGslb::default());

    let mut config = DashboardConfig::default();
    config.product_name = PRODUCT.to_string();
    let config = Arc::new(config);

    let topom_mapper = Arc::new(StoreTopomMapper::new(
        PRODUCT,
        "127.0.0.1:18080",
        store.clone() as Arc<dyn cachemgr::store::Store>,
    ));
    let group_mapper = Arc::new(
        StoreGroupMapper::new(PRODUCT, store.clone() as Arc<dyn cachemgr::store::Store>)
            .await
            .unwrap(),
    );
    let sentinel_mapper = Arc::new(
        StoreSentinelMapper::new(PRODUCT, store.clone() as Arc<dyn cachemgr::store::Store>)
            .await
            .unwrap(),
    );
    let gslb_mapper = Arc::new(
        StoreGslbMapper::new(PRODUCT, store.clone() as Arc<dyn cachemgr::store::Store>)
            .await
            .unwrap(),
    );

    let factory: SentinelFactory = {
        let sentinel = sentinel.clone();
        Arc::new(move || sentinel.clone() as Arc<dyn SentinelOps>)
    };

    let service = Service::new(
        config,
        topom_mapper,
        group_mapper,
        sentinel_mapper,
        gslb_mapper,
        Arc::new(EmptyTemplates),
        redis.clone(),
        gslb.clone(),
        factory,
    );

    Fixture {
        service,
        store,
        redis,
        sentinel,
        gslb,
    }
}
