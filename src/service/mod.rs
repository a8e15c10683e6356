//! The topology manager ("topom"): the single authoritative writer for one
//! product's replication groups, sentinel set, and GSLB projections.
//!
//! One coarse service lock serializes every topology mutation; long network
//! work (stats probes, sentinel fan-out) happens outside it and only the
//! in-memory handoff is locked. Collaborators arrive by construction as
//! trait objects so tests can substitute the store, Redis, Sentinel, and
//! GSLB sides.

mod group;
mod gslb;
mod sentinel;
mod stats;

pub use sentinel::{new_sentinel_factory, SentinelFactory, SentinelOps};
pub use stats::{GslbStats, RedisStats};

use crate::config::DashboardConfig;
use crate::error::{CacheMgrError, Result};
use crate::gslb::GslbOps;
use crate::mapper::{
    GroupMapper, GslbMapper, SentinelMapper, TemplateFileMapper, TopomMapper,
};
use crate::model::{Group, Groups, TemplateFiles, Topom};
use crate::protocol::{
    GroupServerView, GroupSection, GroupView, GslbSection, GslbStatsView, GslbView, HaSection,
    Overview, RedisStatsView, SentinelView, Stats, TemplateSection,
};
use crate::redis::{RedisClient, RedisOps};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Mutable state behind the service lock.
#[derive(Default)]
pub(crate) struct ServiceState {
    pub(crate) redis_stats: HashMap<String, RedisStats>,
    pub(crate) gslb_stats: HashMap<String, GslbStats>,
    pub(crate) ha_masters: Option<HashMap<String, String>>,
    pub(crate) ha_monitor: Option<Arc<dyn SentinelOps>>,
}

pub struct Service {
    pub(crate) config: Arc<DashboardConfig>,
    pub(crate) topom_mapper: Arc<dyn TopomMapper>,
    pub(crate) group_mapper: Arc<dyn GroupMapper>,
    pub(crate) sentinel_mapper: Arc<dyn SentinelMapper>,
    pub(crate) gslb_mapper: Arc<dyn GslbMapper>,
    pub(crate) tf_mapper: Arc<dyn TemplateFileMapper>,

    pub(crate) redis: Arc<dyn RedisOps>,
    pub(crate) gslb_probe: Arc<dyn GslbOps>,
    pub(crate) sentinel_factory: SentinelFactory,

    pub(crate) state: Mutex<ServiceState>,
    started: AtomicBool,
    closed: AtomicBool,
    online: AtomicBool,
    pub(crate) shutdown: CancellationToken,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    /// Back-reference for handing owned clones to spawned tasks.
    self_ref: Weak<Service>,
}

impl Service {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<DashboardConfig>,
        topom_mapper: Arc<dyn TopomMapper>,
        group_mapper: Arc<dyn GroupMapper>,
        sentinel_mapper: Arc<dyn SentinelMapper>,
        gslb_mapper: Arc<dyn GslbMapper>,
        tf_mapper: Arc<dyn TemplateFileMapper>,
        redis: Arc<dyn RedisOps>,
        gslb_probe: Arc<dyn GslbOps>,
        sentinel_factory: SentinelFactory,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            topom_mapper,
            group_mapper,
            sentinel_mapper,
            gslb_mapper,
            tf_mapper,
            redis,
            gslb_probe,
            sentinel_factory,
            state: Mutex::new(ServiceState::default()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            online: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// Owned handle for spawned tasks; `None` only while the last
    /// reference is being dropped.
    pub(crate) fn handle(&self) -> Option<Arc<Service>> {
        self.self_ref.upgrade()
    }

    pub fn config(&self) -> &DashboardConfig {
        &self.config
    }

    pub(crate) fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(CacheMgrError::ClosedTopom)
        } else {
            Ok(())
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Register the topom node and launch the background machinery.
    /// Idempotent; a second call is a no-op. Registration retries every 2s
    /// until it wins the product path or the service shuts down.
    pub async fn start(&self) -> Result<()> {
        self.check_closed()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            match self.topom_mapper.create().await {
                Ok(()) => break,
                Err(e) => error!(error = %e, "topom registration failed, retrying"),
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(Duration::from_secs(2)) => {}
            }
        }
        self.online.store(true, Ordering::SeqCst);
        info!(product = %self.config.product_name, "topom online");

        let sentinel = self.sentinel_mapper.info();
        {
            let mut st = self.state.lock().await;
            self.rewatch_sentinels(sentinel.servers, &mut st);
        }

        if let Some(service) = self.handle() {
            let handle = tokio::spawn(async move {
                service.run_stats_loop(Duration::from_secs(1)).await;
            });
            self.tasks.lock().push(handle);
        }
        Ok(())
    }

    /// Stop background tasks, release pools, and delete the topom node.
    /// Idempotent. `is_online` turns false only once the node is gone.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();

        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        {
            let mut st = self.state.lock().await;
            if let Some(monitor) = st.ha_monitor.take() {
                monitor.cancel();
            }
        }
        self.redis.close();

        if let Err(e) = self.topom_mapper.delete().await {
            error!(error = %e, product = %self.config.product_name, "deleting topom failed");
            return Err(e);
        }
        self.online.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn topom(&self) -> Topom {
        self.topom_mapper.info()
    }

    pub async fn overview(&self) -> Overview {
        Overview {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config: (*self.config).clone(),
            model: Some(self.topom()),
            stats: Some(self.stats().await),
        }
    }

    /// Full dashboard snapshot: models from the mappers, derived stats from
    /// the last refresh tick.
    pub async fn stats(&self) -> Stats {
        let st = self.state.lock().await;

        let groups = self.group_mapper.info();
        let sentinel = self.sentinel_mapper.info();
        let gslbs = self.gslb_mapper.info();
        let tfs = self.tf_mapper.info();

        let mut out = Stats {
            closed: self.closed.load(Ordering::SeqCst),
            ..Default::default()
        };

        out.group = GroupSection {
            models: sorted_groups(&groups)
                .into_iter()
                .map(|g| GroupView {
                    name: g.name.clone(),
                    servers: g
                        .servers
                        .iter()
                        .map(|s| GroupServerView {
                            addr: s.addr.clone(),
                        })
                        .collect(),
                    promoting: g.promoting.clone(),
                    out_of_sync: g.out_of_sync,
                    proxy_read_port: g.proxy_read_port,
                    proxy_write_port: g.proxy_write_port,
                })
                .collect(),
            stats: groups
                .values()
                .flat_map(|g| g.servers.iter())
                .filter_map(|s| {
                    st.redis_stats
                        .get(&s.addr)
                        .map(|rs| (s.addr.clone(), rs.to_view()))
                })
                .collect(),
        };

        out.ha = HaSection {
            model: SentinelView {
                servers: sentinel.servers.clone(),
                out_of_sync: sentinel.out_of_sync,
            },
            stats: sentinel
                .servers
                .iter()
                .filter_map(|addr| {
                    st.redis_stats
                        .get(addr)
                        .map(|rs| (addr.clone(), rs.to_view()))
                })
                .collect(),
            masters: st.ha_masters.clone().unwrap_or_default(),
        };

        out.gslb = GslbSection {
            models: gslbs
                .iter()
                .map(|(name, g)| {
                    (
                        name.clone(),
                        GslbView {
                            servers: g.servers.clone(),
                        },
                    )
                })
                .collect(),
            stats: gslbs
                .values()
                .flat_map(|g| g.servers.iter())
                .filter_map(|addr| {
                    st.gslb_stats.get(addr).map(|gs| {
                        (
                            addr.clone(),
                            GslbStatsView {
                                error: gs.error.clone(),
                                unixtime: gs.unix_time,
                                timeout: gs.timeout,
                            },
                        )
                    })
                })
                .collect(),
        };

        out.template = TemplateSection {
            file_names: sorted_template_files(&tfs),
        };

        out
    }

    /// Raw group dump for the informational endpoint.
    pub fn info(&self) -> Groups {
        self.group_mapper.info()
    }

    pub fn view_template_file(&self, file_name: &str) -> Result<Vec<u8>> {
        let tfs = self.tf_mapper.info();
        tfs.get(file_name)
            .map(|tf| tf.data.clone())
            .ok_or_else(|| CacheMgrError::NotFound {
                kind: "templateFile",
                name: file_name.to_string(),
            })
    }

    /// Pass-through `INFO` (with keyspace refresh) against a group server.
    pub async fn server_info(&self, addr: &str) -> Result<String> {
        let mut client =
            RedisClient::connect(addr, &self.config.product_auth, Duration::from_secs(3)).await?;
        client.enable_keyspace().await?;
        let (text, _) = client.info_full().await?;
        Ok(text)
    }
}

/// Groups ordered newest first; the dashboard and GSLB projection both pin
/// this order.
pub(crate) fn sorted_groups(groups: &Groups) -> Vec<Group> {
    let mut slice: Vec<Group> = groups.values().cloned().collect();
    slice.sort_by(|a, b| b.create_time.cmp(&a.create_time).then(a.name.cmp(&b.name)));
    slice
}

pub(crate) fn sorted_template_files(tfs: &TemplateFiles) -> Vec<String> {
    let mut names: Vec<String> = tfs.keys().cloned().collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Group;

    fn group(name: &str, create_time: &str) -> Group {
        Group {
            name: name.to_string(),
            create_time: create_time.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_sorted_groups_newest_first() {
        let mut groups = Groups::new();
        groups.insert("old".into(), group("old", "2024-01-01 00:00:00"));
        groups.insert("new".into(), group("new", "2024-06-01 00:00:00"));
        groups.insert("mid".into(), group("mid", "2024-03-01 00:00:00"));
        let order: Vec<String> = sorted_groups(&groups)
            .into_iter()
            .map(|g| g.name)
            .collect();
        assert_eq!(order, vec!["new", "mid", "old"]);
    }

    #[test]
    fn test_sorted_groups_is_stable_for_equal_times() {
        let mut groups = Groups::new();
        groups.insert("b".into(), group("b", "2024-01-01 00:00:00"));
        groups.insert("a".into(), group("a", "2024-01-01 00:00:00"));
        let order: Vec<String> = sorted_groups(&groups)
            .iter()
            .map(|g| g.name.clone())
            .collect();
        assert_eq!(order, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_sorted_template_files_ascending() {
        let mut tfs = TemplateFiles::new();
        for name in ["b.conf", "a.conf", "c.conf"] {
            tfs.insert(
                name.to_string(),
                crate::model::TemplateFile {
                    data: vec![],
                    md5: [0; 16],
                },
            );
        }
        assert_eq!(
            sorted_template_files(&tfs),
            vec!["a.conf", "b.conf", "c.conf"]
        );
    }
}
