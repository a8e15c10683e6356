//! Periodic stats pipeline.
//!
//! Every tick, three sub-passes run: a concurrent probe of every group
//! server and sentinel, a concurrent probe of every GSLB server, and, once
//! both finish, a GSLB backend re-projection under the service lock. Each
//! probe gets its own deadline; a slow target becomes a `timeout` entry
//! instead of stalling the tick.

use crate::protocol::RedisStatsView;
use crate::redis::SentinelGroup;
use crate::service::Service;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

pub const MASTER_LINK_STATUS_UP: &str = "up";
pub const MASTER_LINK_STATUS_DOWN: &str = "down";

/// Last observed state of one Redis-compatible server (or sentinel).
#[derive(Debug, Clone, Default)]
pub struct RedisStats {
    pub error: Option<String>,
    pub stats: HashMap<String, String>,
    pub sentinel: HashMap<String, SentinelGroup>,
    pub unix_time: i64,
    pub timeout: bool,
}

impl RedisStats {
    /// Address of the master this replica follows, empty for masters.
    pub fn master_addr(&self) -> &str {
        self.stats.get("master_addr").map(String::as_str).unwrap_or("")
    }

    /// Replication link health; must be `"up"` for a replica to take read
    /// traffic.
    pub fn master_link_status(&self) -> &str {
        self.stats
            .get("master_link_status")
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn is_usable(&self) -> bool {
        self.error.is_none() && !self.timeout
    }

    pub(crate) fn to_view(&self) -> RedisStatsView {
        RedisStatsView {
            error: self.error.clone(),
            stats: self.stats.clone(),
            sentinel: self.sentinel.clone(),
            unixtime: self.unix_time,
            timeout: self.timeout,
        }
    }
}

/// Last observed state of one GSLB server; only liveness is tracked.
#[derive(Debug, Clone, Default)]
pub struct GslbStats {
    pub error: Option<String>,
    pub unix_time: i64,
    pub timeout: bool,
}

impl Service {
    pub(crate) async fn run_stats_loop(self: Arc<Self>, tick: Duration) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            self.refresh_stats_once(tick).await;
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(tick) => {}
            }
        }
    }

    /// One full tick: both probe passes, then backend re-projection.
    /// Public so tests (and the startup path) can drive the pipeline
    /// synchronously.
    pub async fn refresh_stats_once(&self, timeout: Duration) {
        tokio::join!(
            self.refresh_redis_stats(timeout),
            self.refresh_gslb_stats(timeout),
        );

        let st = self.state.lock().await;
        if let Err(e) = self.refresh_gslb_backend_info(&st).await {
            error!(error = %e, "gslb backend refresh failed");
        }
    }

    async fn refresh_redis_stats(&self, timeout: Duration) {
        let groups = self.group_mapper.info();
        let sentinel = self.sentinel_mapper.info();

        let mut probes = Vec::new();
        for g in groups.values() {
            for server in &g.servers {
                let addr = server.addr.clone();
                probes.push(self.probe_redis(addr, timeout, false));
            }
        }
        for addr in &sentinel.servers {
            probes.push(self.probe_redis(addr.clone(), timeout, true));
        }

        let results = futures::future::join_all(probes).await;
        let fresh: HashMap<String, RedisStats> = results.into_iter().collect();

        let mut st = self.state.lock().await;
        st.redis_stats = fresh;
    }

    /// Probe one address; sentinels additionally report the groups they
    /// monitor.
    async fn probe_redis(
        &self,
        addr: String,
        timeout: Duration,
        is_sentinel: bool,
    ) -> (String, RedisStats) {
        let work = async {
            let mut stats = RedisStats::default();
            if is_sentinel {
                stats.stats = self.redis.info_no_auth(&addr).await?;
                let sentinel = (self.sentinel_factory)();
                stats.sentinel = sentinel.masters_and_slaves(&addr, timeout).await?;
            } else {
                stats.stats = self.redis.info_full(&addr).await?;
            }
            Ok::<_, crate::error::CacheMgrError>(stats)
        };

        let mut stats = match tokio::time::timeout(timeout, work).await {
            Ok(Ok(stats)) => stats,
            Ok(Err(e)) => RedisStats {
                error: Some(e.to_string()),
                ..Default::default()
            },
            Err(_) => RedisStats {
                timeout: true,
                ..Default::default()
            },
        };
        stats.unix_time = chrono::Utc::now().timestamp();
        (addr, stats)
    }

    async fn refresh_gslb_stats(&self, timeout: Duration) {
        let gslbs = self.gslb_mapper.info();

        let mut probes = Vec::new();
        for g in gslbs.values() {
            for addr in &g.servers {
                let addr = addr.clone();
                probes.push(async move {
                    let result =
                        tokio::time::timeout(timeout, self.gslb_probe.status(&addr, timeout))
                            .await;
                    let mut stats = match result {
                        Ok(Ok(_)) => GslbStats::default(),
                        Ok(Err(e)) => GslbStats {
                            error: Some(e.to_string()),
                            ..Default::default()
                        },
                        Err(_) => GslbStats {
                            timeout: true,
                            ..Default::default()
                        },
                    };
                    stats.unix_time = chrono::Utc::now().timestamp();
                    (addr, stats)
                });
            }
        }

        let results = futures::future::join_all(probes).await;
        let fresh: HashMap<String, GslbStats> = results.into_iter().collect();

        let mut st = self.state.lock().await;
        st.gslb_stats = fresh;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_fields() {
        let stats = RedisStats {
            stats: HashMap::from([
                ("master_addr".to_string(), "10.0.0.1:9221".to_string()),
                ("master_link_status".to_string(), "up".to_string()),
            ]),
            ..Default::default()
        };
        assert_eq!(stats.master_addr(), "10.0.0.1:9221");
        assert_eq!(stats.master_link_status(), MASTER_LINK_STATUS_UP);
        assert!(stats.is_usable());
    }

    #[test]
    fn test_unusable_states() {
        let errored = RedisStats {
            error: Some("connection refused".into()),
            ..Default::default()
        };
        let timed_out = RedisStats {
            timeout: true,
            ..Default::default()
        };
        assert!(!errored.is_usable());
        assert!(!timed_out.is_usable());
        assert_eq!(errored.master_addr(), "");
        assert_eq!(errored.master_link_status(), "");
    }
}
