//! GSLB membership and backend projection.
//!
//! Two balancer kinds are projected. `haproxy` backends are derived from
//! group topology plus live stats: the master always serves reads and
//! writes, a replica serves reads only while it follows the right master
//! with its link up. `lvs` backends are derived from the haproxy record,
//! pointing every haproxy host at the haproxy backend port.

use crate::error::{CacheMgrError, Result};
use crate::model::{Gslb, GslbBackend, GslbBackendGroup, ServeState};
use crate::service::stats::MASTER_LINK_STATUS_UP;
use crate::service::{sorted_groups, Service, ServiceState};
use std::time::Duration;
use tracing::{error, warn};

impl Service {
    pub async fn add_gslb(&self, gslb_name: &str, addr: &str) -> Result<()> {
        if addr.is_empty() {
            return Err(CacheMgrError::InvalidArgument("invalid gslb address".into()));
        }

        let st = self.state.lock().await;
        let gslbs = self.gslb_mapper.info();

        let mut gslb = gslbs.get(gslb_name).cloned().unwrap_or_else(|| Gslb {
            name: gslb_name.to_string(),
            ..Default::default()
        });
        if gslb.servers.iter().any(|s| s == addr) {
            return Err(CacheMgrError::AlreadyExists {
                kind: "gslb server",
                name: format!("{}/{}", gslb_name, addr),
            });
        }

        gslb.servers.push(addr.to_string());
        self.gslb_mapper.update(&gslb).await?;
        self.refresh_gslb_backend_info(&st).await
    }

    pub async fn del_gslb(&self, gslb_name: &str, addr: &str) -> Result<()> {
        if addr.is_empty() {
            return Err(CacheMgrError::InvalidArgument("invalid gslb address".into()));
        }

        let st = self.state.lock().await;
        let gslbs = self.gslb_mapper.info();

        let mut gslb = gslbs
            .get(gslb_name)
            .cloned()
            .ok_or_else(|| CacheMgrError::NotFound {
                kind: "gslb",
                name: gslb_name.to_string(),
            })?;
        let index = gslb
            .servers
            .iter()
            .position(|s| s == addr)
            .ok_or_else(|| CacheMgrError::NotFound {
                kind: "gslb server",
                name: format!("{}/{}", gslb_name, addr),
            })?;
        gslb.servers.remove(index);

        // The shrunk record is written first; an emptied one is then
        // deleted outright.
        self.gslb_mapper.update(&gslb).await?;
        if gslb.servers.is_empty() {
            self.gslb_mapper.delete(&gslb).await?;
        }
        self.refresh_gslb_backend_info(&st).await
    }

    /// Pass-through `/status` fetch from one GSLB server.
    pub async fn gslb_monitor_info(&self, addr: &str) -> Result<Vec<u8>> {
        self.gslb_probe.status(addr, Duration::from_secs(1)).await
    }

    /// Recompute the backend tables of every registered GSLB. Runs under
    /// the service lock; the mapper skips the store write when a record is
    /// unchanged.
    pub(crate) async fn refresh_gslb_backend_info(&self, st: &ServiceState) -> Result<()> {
        let gslbs = self.gslb_mapper.info();

        for (name, current) in &gslbs {
            let (backends, monitors) = match self.project_backends(name, st) {
                Ok(projected) => projected,
                Err(e) => {
                    error!(gslb = %name, error = %e, "projecting gslb backends failed");
                    return Err(e);
                }
            };
            let record = Gslb {
                name: name.clone(),
                servers: current.servers.clone(),
                monitors,
                backends,
            };
            if let Err(e) = self.gslb_mapper.update(&record).await {
                error!(gslb = %name, error = %e, "writing gslb record failed");
            }
        }
        Ok(())
    }

    fn project_backends(
        &self,
        gslb_name: &str,
        st: &ServiceState,
    ) -> Result<(Vec<GslbBackendGroup>, Vec<String>)> {
        match gslb_name {
            "haproxy" => self.haproxy_backends(st),
            "lvs" => self.lvs_backends("haproxy"),
            _ => Err(CacheMgrError::InvalidArgument(format!(
                "unsupported gslb type: {}",
                gslb_name
            ))),
        }
    }

    fn haproxy_backends(&self, st: &ServiceState) -> Result<(Vec<GslbBackendGroup>, Vec<String>)> {
        if st.redis_stats.is_empty() {
            return Err(CacheMgrError::Internal("redis stats empty".into()));
        }

        let groups = self.group_mapper.info();
        let mut backends = Vec::new();

        for group in sorted_groups(&groups) {
            if group.servers.is_empty() {
                continue;
            }
            // No live master, no backend group.
            match st.redis_stats.get(&group.servers[0].addr) {
                Some(master_stats) if master_stats.is_usable() => {}
                _ => continue,
            }

            let mut bg = GslbBackendGroup {
                name: group.name.clone(),
                server_group: Default::default(),
            };
            let mut valid = true;

            for (i, server) in group.servers.iter().enumerate() {
                let stats = match st.redis_stats.get(&server.addr) {
                    Some(stats) if stats.is_usable() => stats,
                    _ => continue,
                };
                if i != 0 {
                    if stats.master_addr() != group.servers[0].addr {
                        // A replica following someone else means the
                        // replication layout is wrong; drop the whole group.
                        valid = false;
                        break;
                    }
                    if stats.master_link_status() != MASTER_LINK_STATUS_UP {
                        continue;
                    }
                }

                let mut emit = |state: ServeState, port: u16| {
                    bg.server_group
                        .entry(state.as_str().to_string())
                        .or_insert_with(|| GslbBackend {
                            servers: Vec::new(),
                            port,
                        })
                        .servers
                        .push(server.addr.clone());
                };
                emit(ServeState::Read, group.proxy_read_port);
                if i == 0 {
                    emit(ServeState::Write, group.proxy_write_port);
                }
            }

            if valid {
                backends.push(bg);
            }
        }

        Ok((backends, Vec::new()))
    }

    /// Project over the haproxy GSLB's own backends: every haproxy host
    /// answers on each backend port, and the haproxy hosts double as the
    /// monitor list.
    fn lvs_backends(&self, backend_name: &str) -> Result<(Vec<GslbBackendGroup>, Vec<String>)> {
        let gslbs = self.gslb_mapper.info();
        let Some(upstream) = gslbs.get(backend_name) else {
            warn!(backend = %backend_name, "lvs projection: upstream gslb not registered");
            return Ok((Vec::new(), Vec::new()));
        };

        let monitors = upstream.servers.clone();
        let mut backends = Vec::new();

        for bs in &upstream.backends {
            let mut bg = GslbBackendGroup {
                name: bs.name.clone(),
                server_group: Default::default(),
            };
            for (state, backend) in &bs.server_group {
                let servers = upstream
                    .servers
                    .iter()
                    .filter_map(|addr| match addr.rsplit_once(':') {
                        Some((host, _)) => Some(format!("{}:{}", host, backend.port)),
                        None => {
                            error!(addr = %addr, "lvs projection: bad haproxy address");
                            None
                        }
                    })
                    .collect();
                bg.server_group.insert(
                    state.clone(),
                    GslbBackend {
                        servers,
                        port: backend.port,
                    },
                );
            }
            backends.push(bg);
        }

        Ok((backends, monitors))
    }
}
