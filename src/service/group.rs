//! Group operations: create/remove, membership, promotion, resync.
//!
//! All of these run under the service lock, so a promotion can never race
//! an HA-driven master switch or another operator call.

use crate::error::{CacheMgrError, MultiError, Result};
use crate::model::{Group, GroupServer, PromoteState, Promoting, MAX_GROUP_NAME_LEN};
use crate::redis::NO_ONE;
use crate::service::Service;
use std::collections::HashSet;
use tracing::{error, info, warn};

impl Service {
    pub async fn create_group(&self, group_name: &str, r_port: u16, w_port: u16) -> Result<()> {
        if group_name.is_empty() || group_name.chars().count() > MAX_GROUP_NAME_LEN {
            return Err(CacheMgrError::InvalidArgument(format!(
                "invalid group name = {}, out of range",
                group_name
            )));
        }
        if r_port == w_port {
            return Err(CacheMgrError::InvalidArgument(
                "proxy read port and proxy write port must not be equal".into(),
            ));
        }

        let _st = self.state.lock().await;
        let groups = self.group_mapper.info();

        if groups.contains_key(group_name) {
            return Err(CacheMgrError::AlreadyExists {
                kind: "group",
                name: group_name.to_string(),
            });
        }
        for g in groups.values() {
            let taken = [g.proxy_read_port, g.proxy_write_port];
            if taken.contains(&r_port) || taken.contains(&w_port) {
                return Err(CacheMgrError::Conflict(format!(
                    "group-[{}] and group-[{}] port conflict",
                    group_name, g.name
                )));
            }
        }

        let group = Group {
            name: group_name.to_string(),
            servers: Vec::new(),
            promoting: Promoting::default(),
            out_of_sync: false,
            proxy_read_port: r_port,
            proxy_write_port: w_port,
            create_time: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        };
        self.group_mapper.create(&group).await
    }

    pub async fn remove_group(&self, group_name: &str) -> Result<()> {
        let _st = self.state.lock().await;
        let groups = self.group_mapper.info();
        let group = groups.get(group_name).ok_or_else(|| CacheMgrError::NotFound {
            kind: "group",
            name: group_name.to_string(),
        })?;
        if !group.servers.is_empty() {
            return Err(CacheMgrError::Conflict(format!(
                "group-[{}] isn't empty",
                group_name
            )));
        }
        self.group_mapper.remove(group).await
    }

    pub async fn add_group_server(&self, group_name: &str, addr: &str) -> Result<()> {
        if addr.is_empty() {
            return Err(CacheMgrError::InvalidArgument("invalid server address".into()));
        }

        let st = self.state.lock().await;
        let groups = self.group_mapper.info();

        for g in groups.values() {
            if g.server_index(addr).is_some() {
                return Err(CacheMgrError::AlreadyExists {
                    kind: "server",
                    name: addr.to_string(),
                });
            }
        }

        let mut group = groups
            .get(group_name)
            .cloned()
            .ok_or_else(|| CacheMgrError::NotFound {
                kind: "group",
                name: group_name.to_string(),
            })?;

        self.mark_sentinel_out_of_sync().await?;

        group.servers.push(GroupServer {
            addr: addr.to_string(),
        });
        self.group_mapper.update(&group).await?;
        self.refresh_gslb_backend_info(&st).await
    }

    pub async fn del_group_server(&self, group_name: &str, addr: &str) -> Result<()> {
        let st = self.state.lock().await;
        let groups = self.group_mapper.info();
        let mut group = groups
            .get(group_name)
            .cloned()
            .ok_or_else(|| CacheMgrError::NotFound {
                kind: "group",
                name: group_name.to_string(),
            })?;

        let index = group
            .server_index(addr)
            .ok_or_else(|| CacheMgrError::NotFound {
                kind: "server",
                name: addr.to_string(),
            })?;
        if index == 0 && group.servers.len() > 1 {
            return Err(CacheMgrError::Conflict(format!(
                "group-[{}] can't remove master, still in use",
                group_name
            )));
        }

        self.mark_sentinel_out_of_sync().await?;

        if index != 0 {
            group.out_of_sync = true;
        }
        group.servers.remove(index);
        if group.servers.is_empty() {
            group.out_of_sync = false;
        }

        self.group_mapper.update(&group).await?;
        self.refresh_gslb_backend_info(&st).await
    }

    /// Promote `addr` to master of its group.
    ///
    /// The promotion record walks nothing -> preparing -> prepared ->
    /// finished, persisting after each step; a single call always runs the
    /// machine from wherever the record currently is through to the end,
    /// so an interrupted promotion is completed by retrying it.
    pub async fn promote_group_server(&self, group_name: &str, addr: &str) -> Result<()> {
        let mut st = self.state.lock().await;
        let sentinel = self.sentinel_mapper.info();
        let groups = self.group_mapper.info();

        let mut group = groups
            .get(group_name)
            .cloned()
            .ok_or_else(|| CacheMgrError::NotFound {
                kind: "group",
                name: group_name.to_string(),
            })?;

        let index = group
            .server_index(addr)
            .ok_or_else(|| CacheMgrError::NotFound {
                kind: "server",
                name: addr.to_string(),
            })?;

        if group.promoting.state != PromoteState::Nothing {
            if index != group.promoting.index {
                return Err(CacheMgrError::Conflict(format!(
                    "group-[{}] is promoting index = {}",
                    group_name, group.promoting.index
                )));
            }
        } else if index == 0 {
            return Err(CacheMgrError::Conflict(format!(
                "group-[{}] can't promote master",
                group_name
            )));
        }

        if group.promoting.state == PromoteState::Nothing {
            group.promoting.index = index;
            group.promoting.state = PromoteState::Preparing;
            self.group_mapper.update(&group).await?;
        }

        if group.promoting.state == PromoteState::Preparing {
            group.promoting.state = PromoteState::Prepared;
            self.group_mapper.update(&group).await?;
        }

        if group.promoting.state == PromoteState::Prepared {
            if !sentinel.servers.is_empty() {
                let mut record = sentinel.clone();
                record.out_of_sync = true;
                self.sentinel_mapper.update(&record).await?;

                let client = (self.sentinel_factory)();
                let removing: HashSet<String> = [group.name.clone()].into();
                if let Err(e) = client
                    .remove_groups(
                        &record.servers,
                        self.config.sentinel_client_timeout,
                        &removing,
                    )
                    .await
                {
                    warn!(
                        group = %group.name,
                        sentinels = ?record.servers,
                        error = %e,
                        "removing sentinel monitor during promotion failed"
                    );
                }
                if let Some(masters) = st.ha_masters.as_mut() {
                    masters.remove(&group.name);
                }
            }

            let promoted = group.promoting.index;
            group.servers.swap(0, promoted);
            group.promoting.index = 0;
            group.promoting.state = PromoteState::Finished;
            info!(group = %group.name, master = %group.servers[0].addr, "promoting new master");
            self.group_mapper.update(&group).await?;

            if let Err(e) = self.resync_group_servers(&mut group).await {
                error!(group = %group.name, error = %e, "post-promotion resync failed");
            }
        }

        // Finished: re-emit the record with the promotion cleared.
        let clean = Group {
            name: group.name.clone(),
            servers: group.servers.clone(),
            promoting: Promoting::default(),
            out_of_sync: false,
            proxy_read_port: group.proxy_read_port,
            proxy_write_port: group.proxy_write_port,
            create_time: group.create_time.clone(),
        };
        self.group_mapper.update(&clean).await
    }

    /// Re-issue the replication layout of one group: `SLAVEOF NO ONE` for
    /// the master, `SLAVEOF <master>` for everyone else.
    pub async fn resync_group(&self, group_name: &str) -> Result<()> {
        let _st = self.state.lock().await;
        let groups = self.group_mapper.info();
        let mut group = groups
            .get(group_name)
            .cloned()
            .ok_or_else(|| CacheMgrError::NotFound {
                kind: "group",
                name: group_name.to_string(),
            })?;

        group.out_of_sync = false;
        self.group_mapper.update(&group).await?;
        self.resync_group_servers(&mut group).await
    }

    /// Resync every group concurrently; the first failure fails the call.
    pub async fn resync_group_all(&self) -> Result<()> {
        let _st = self.state.lock().await;
        let groups = self.group_mapper.info();

        let jobs = groups.into_values().map(|mut group| async move {
            group.out_of_sync = false;
            if let Err(e) = self.group_mapper.update(&group).await {
                return Err(CacheMgrError::Internal(format!(
                    "resync group-[{}] failed: {}",
                    group.name, e
                )));
            }
            self.resync_group_servers(&mut group).await
        });

        for result in futures::future::join_all(jobs).await {
            result?;
        }
        Ok(())
    }

    /// Force a full resync of a replica from the current master. Refused
    /// for the master itself and while a promotion is running.
    pub async fn force_full_sync_server(&self, group_name: &str, addr: &str) -> Result<()> {
        let _st = self.state.lock().await;
        let groups = self.group_mapper.info();
        let group = groups.get(group_name).ok_or_else(|| CacheMgrError::NotFound {
            kind: "group",
            name: group_name.to_string(),
        })?;

        let index = group
            .server_index(addr)
            .ok_or_else(|| CacheMgrError::NotFound {
                kind: "server",
                name: addr.to_string(),
            })?;
        if index == 0 {
            return Err(CacheMgrError::Conflict(format!(
                "group-[{}] master server-[{}] not allowed this operation",
                group_name, addr
            )));
        }
        if group.promoting.state != PromoteState::Nothing {
            return Err(CacheMgrError::Conflict(format!(
                "group-[{}] is promoting",
                group_name
            )));
        }

        self.redis
            .force_full_sync(&group.servers[index].addr, &group.servers[0].addr)
            .await
    }

    /// Walk the group's servers issuing replication commands, collecting
    /// every failure. Any failure also flips the group back out of sync.
    pub(crate) async fn resync_group_servers(&self, group: &mut Group) -> Result<()> {
        if group.servers.is_empty() {
            return Ok(());
        }

        let master = group.servers[0].addr.clone();
        let mut errors = MultiError::new();
        for (index, server) in group.servers.iter().enumerate() {
            let target = if index == 0 { NO_ONE } else { master.as_str() };
            if let Err(e) = self.redis.set_master(&server.addr, target).await {
                errors.push(CacheMgrError::Internal(format!(
                    "resync group-[{}] addr-[{}] master-[{}]: {}",
                    group.name, server.addr, target, e
                )));
            }
        }

        if !errors.is_empty() {
            group.out_of_sync = true;
            if let Err(e) = self.group_mapper.update(group).await {
                errors.push(e);
            }
        }
        errors.into_result()
    }
}
