//! End-to-end service scenarios against the in-memory store.

#[allow(dead_code)]
mod common;

use cachemgr::error::CacheMgrError;
use cachemgr::model::{Gslb, PromoteState};
use cachemgr::store::path;
use common::fixture;
use std::collections::HashMap;
use std::time::Duration;

fn parse_gslb(store: &cachemgr::store::memory::MemStore, name: &str) -> Gslb {
    let data = store
        .peek(&path::gslb_path(name, common::PRODUCT))
        .expect("gslb record present");
    serde_json::from_slice(&data).expect("gslb record parses")
}

// ---- groups (S1) ---------------------------------------------------

#[tokio::test]
async fn test_create_remove_roundtrip() {
    let f = fixture().await;
    f.service.create_group("g1", 11000, 12000).await.unwrap();
    let groups = f.service.info();
    assert!(groups["g1"].servers.is_empty());

    f.service.remove_group("g1").await.unwrap();
    assert!(!f.service.info().contains_key("g1"));

    // The name is free again after removal.
    f.service.create_group("g1", 11000, 12000).await.unwrap();
}

#[tokio::test]
async fn test_create_group_port_conflict() {
    let f = fixture().await;
    f.service.create_group("g1", 11000, 12000).await.unwrap();

    // 12000 is already g1's write port, in either position.
    let err = f.service.create_group("g2", 12000, 13000).await.unwrap_err();
    assert!(matches!(err, CacheMgrError::Conflict(_)));
    let err = f.service.create_group("g2", 13000, 12000).await.unwrap_err();
    assert!(matches!(err, CacheMgrError::Conflict(_)));

    f.service.create_group("g2", 13000, 14000).await.unwrap();
}

#[tokio::test]
async fn test_create_group_validation() {
    let f = fixture().await;
    assert!(f.service.create_group("", 11000, 12000).await.is_err());
    assert!(f.service.create_group("g1", 11000, 11000).await.is_err());
    let long = "x".repeat(33);
    assert!(f.service.create_group(&long, 11000, 12000).await.is_err());
    assert!(f
        .service
        .create_group("g1", 11000, 12000)
        .await
        .is_ok());
    let err = f.service.create_group("g1", 21000, 22000).await.unwrap_err();
    assert!(matches!(err, CacheMgrError::AlreadyExists { .. }));
}

#[tokio::test]
async fn test_remove_group_requires_empty() {
    let f = fixture().await;
    f.service.create_group("g1", 11000, 12000).await.unwrap();
    f.service.add_group_server("g1", "h1:9221").await.unwrap();
    assert!(f.service.remove_group("g1").await.is_err());

    f.service.del_group_server("g1", "h1:9221").await.unwrap();
    f.service.remove_group("g1").await.unwrap();
}

// ---- membership ----------------------------------------------------

#[tokio::test]
async fn test_server_addr_unique_across_groups() {
    let f = fixture().await;
    f.service.create_group("g1", 11000, 12000).await.unwrap();
    f.service.create_group("g2", 13000, 14000).await.unwrap();
    f.service.add_group_server("g1", "h1:9221").await.unwrap();

    let err = f
        .service
        .add_group_server("g2", "h1:9221")
        .await
        .unwrap_err();
    assert!(matches!(err, CacheMgrError::AlreadyExists { .. }));
}

#[tokio::test]
async fn test_del_master_rejected_while_replicas_remain() {
    let f = fixture().await;
    f.service.create_group("g1", 11000, 12000).await.unwrap();
    f.service.add_group_server("g1", "h1:9221").await.unwrap();
    f.service.add_group_server("g1", "h2:9221").await.unwrap();

    let err = f
        .service
        .del_group_server("g1", "h1:9221")
        .await
        .unwrap_err();
    assert!(matches!(err, CacheMgrError::Conflict(_)));

    // Dropping the replica first, then the master, is fine.
    f.service.del_group_server("g1", "h2:9221").await.unwrap();
    f.service.del_group_server("g1", "h1:9221").await.unwrap();
}

#[tokio::test]
async fn test_del_replica_marks_group_out_of_sync() {
    let f = fixture().await;
    f.service.create_group("g1", 11000, 12000).await.unwrap();
    f.service.add_group_server("g1", "h1:9221").await.unwrap();
    f.service.add_group_server("g1", "h2:9221").await.unwrap();

    f.service.del_group_server("g1", "h2:9221").await.unwrap();
    assert!(f.service.info()["g1"].out_of_sync);

    // Emptying the group always clears the flag.
    f.service.del_group_server("g1", "h1:9221").await.unwrap();
    assert!(!f.service.info()["g1"].out_of_sync);
}

#[tokio::test]
async fn test_membership_change_marks_sentinels_out_of_sync() {
    let f = fixture().await;
    f.service.add_sentinel("s1:26379").await.unwrap();
    f.service.create_group("g1", 11000, 12000).await.unwrap();

    // resync_sentinels clears the flag set by add_sentinel...
    f.service.resync_sentinels().await.unwrap();
    assert!(!f.service.stats().await.ha.model.out_of_sync);

    // ...and the next topology change sets it again.
    f.service.add_group_server("g1", "h1:9221").await.unwrap();
    assert!(f.service.stats().await.ha.model.out_of_sync);
}

// ---- promotion (S2) ------------------------------------------------

#[tokio::test]
async fn test_promotion_reorders_and_resyncs() {
    let f = fixture().await;
    f.service.add_sentinel("s1:26379").await.unwrap();
    f.service.create_group("g", 11000, 12000).await.unwrap();
    for addr in ["a:9221", "b:9221", "c:9221"] {
        f.service.add_group_server("g", addr).await.unwrap();
    }
    f.redis.set_master_calls.lock().clear();

    f.service.promote_group_server("g", "b:9221").await.unwrap();

    let group = &f.service.info()["g"];
    let order: Vec<&str> = group.servers.iter().map(|s| s.addr.as_str()).collect();
    assert_eq!(order, vec!["b:9221", "a:9221", "c:9221"]);
    assert_eq!(group.promoting.state, PromoteState::Nothing);
    assert_eq!(group.promoting.index, 0);
    assert!(!group.out_of_sync);

    // New master told to stand alone, everyone else re-pointed at it.
    let calls = f.redis.set_master_calls.lock().clone();
    assert_eq!(
        calls,
        vec![
            ("b:9221".to_string(), "NO:ONE".to_string()),
            ("a:9221".to_string(), "b:9221".to_string()),
            ("c:9221".to_string(), "b:9221".to_string()),
        ]
    );

    // The sentinel monitor for the group was dropped for re-registration.
    let removed = f.sentinel.removed_groups.lock().clone();
    assert!(removed.iter().any(|set| set.contains("g")));
    assert!(f.service.stats().await.ha.model.out_of_sync);
}

#[tokio::test]
async fn test_promotion_without_sentinels_skips_monitor_removal() {
    let f = fixture().await;
    f.service.create_group("g", 11000, 12000).await.unwrap();
    f.service.add_group_server("g", "a:9221").await.unwrap();
    f.service.add_group_server("g", "b:9221").await.unwrap();

    f.service.promote_group_server("g", "b:9221").await.unwrap();
    assert_eq!(f.service.info()["g"].servers[0].addr, "b:9221");
    assert!(f.sentinel.removed_groups.lock().is_empty());
}

#[tokio::test]
async fn test_promote_master_rejected() {
    let f = fixture().await;
    f.service.create_group("g", 11000, 12000).await.unwrap();
    f.service.add_group_server("g", "a:9221").await.unwrap();
    f.service.add_group_server("g", "b:9221").await.unwrap();

    let err = f
        .service
        .promote_group_server("g", "a:9221")
        .await
        .unwrap_err();
    assert!(matches!(err, CacheMgrError::Conflict(_)));
}

#[tokio::test]
async fn test_promote_unknown_server_rejected() {
    let f = fixture().await;
    f.service.create_group("g", 11000, 12000).await.unwrap();
    f.service.add_group_server("g", "a:9221").await.unwrap();

    let err = f
        .service
        .promote_group_server("g", "nope:9221")
        .await
        .unwrap_err();
    assert!(matches!(err, CacheMgrError::NotFound { .. }));
}

// ---- resync --------------------------------------------------------

#[tokio::test]
async fn test_resync_group_issues_replication_layout() {
    let f = fixture().await;
    f.service.create_group("g", 11000, 12000).await.unwrap();
    for addr in ["a:9221", "b:9221"] {
        f.service.add_group_server("g", addr).await.unwrap();
    }

    f.service.resync_group("g").await.unwrap();
    let calls = f.redis.set_master_calls.lock().clone();
    assert_eq!(
        calls,
        vec![
            ("a:9221".to_string(), "NO:ONE".to_string()),
            ("b:9221".to_string(), "a:9221".to_string()),
        ]
    );
    assert!(!f.service.info()["g"].out_of_sync);
}

#[tokio::test]
async fn test_resync_failure_restores_out_of_sync() {
    let f = fixture().await;
    f.service.create_group("g", 11000, 12000).await.unwrap();
    f.service.add_group_server("g", "a:9221").await.unwrap();
    f.service.add_group_server("g", "b:9221").await.unwrap();
    f.redis.fail_addr("b:9221");

    let err = f.service.resync_group("g").await.unwrap_err();
    assert!(err.to_string().contains("b:9221"));
    assert!(f.service.info()["g"].out_of_sync);
}

#[tokio::test]
async fn test_resync_all_covers_every_group() {
    let f = fixture().await;
    f.service.create_group("g1", 11000, 12000).await.unwrap();
    f.service.create_group("g2", 13000, 14000).await.unwrap();
    f.service.add_group_server("g1", "a:9221").await.unwrap();
    f.service.add_group_server("g2", "b:9221").await.unwrap();

    f.service.resync_group_all().await.unwrap();
    let calls = f.redis.set_master_calls.lock().clone();
    assert!(calls.contains(&("a:9221".to_string(), "NO:ONE".to_string())));
    assert!(calls.contains(&("b:9221".to_string(), "NO:ONE".to_string())));
}

// ---- force full sync -----------------------------------------------

#[tokio::test]
async fn test_force_full_sync_replica_only() {
    let f = fixture().await;
    f.service.create_group("g", 11000, 12000).await.unwrap();
    f.service.add_group_server("g", "a:9221").await.unwrap();
    f.service.add_group_server("g", "b:9221").await.unwrap();

    let err = f
        .service
        .force_full_sync_server("g", "a:9221")
        .await
        .unwrap_err();
    assert!(matches!(err, CacheMgrError::Conflict(_)));

    f.service
        .force_full_sync_server("g", "b:9221")
        .await
        .unwrap();
    assert_eq!(
        f.redis.force_sync_calls.lock().clone(),
        vec![("b:9221".to_string(), "a:9221".to_string())]
    );
}

// ---- HA switch (S4) ------------------------------------------------

#[tokio::test]
async fn test_switch_master_by_run_id_keeps_order() {
    let f = fixture().await;
    f.service.create_group("g", 11000, 12000).await.unwrap();
    f.service.add_group_server("g", "a:9221").await.unwrap();
    f.service.add_group_server("g", "b:9221").await.unwrap();

    // Sentinel reports a master address unknown to the group, but its
    // run id matches the current index 0.
    f.redis.set_info("c:9221", &[("run_id", "rid-a")]);
    f.redis.set_info("a:9221", &[("run_id", "rid-a")]);
    f.redis.set_info("b:9221", &[("run_id", "rid-b")]);

    f.service
        .switch_masters(HashMap::from([("g".to_string(), "c:9221".to_string())]))
        .await
        .unwrap();

    let group = &f.service.info()["g"];
    assert_eq!(group.servers[0].addr, "a:9221");
    assert!(!group.out_of_sync);
    assert_eq!(f.service.stats().await.ha.masters["g"], "c:9221");
}

#[tokio::test]
async fn test_switch_master_reorders_on_replica_run_id() {
    let f = fixture().await;
    f.service.create_group("g", 11000, 12000).await.unwrap();
    f.service.add_group_server("g", "a:9221").await.unwrap();
    f.service.add_group_server("g", "b:9221").await.unwrap();

    f.redis.set_info("c:9221", &[("run_id", "rid-b")]);
    f.redis.set_info("a:9221", &[("run_id", "rid-a")]);
    f.redis.set_info("b:9221", &[("run_id", "rid-b")]);

    f.service
        .switch_masters(HashMap::from([("g".to_string(), "c:9221".to_string())]))
        .await
        .unwrap();

    let group = &f.service.info()["g"];
    assert_eq!(group.servers[0].addr, "b:9221");
    assert!(group.out_of_sync);
}

#[tokio::test]
async fn test_switch_master_exact_address_match() {
    let f = fixture().await;
    f.service.create_group("g", 11000, 12000).await.unwrap();
    f.service.add_group_server("g", "a:9221").await.unwrap();
    f.service.add_group_server("g", "b:9221").await.unwrap();

    f.service
        .switch_masters(HashMap::from([("g".to_string(), "b:9221".to_string())]))
        .await
        .unwrap();
    assert_eq!(f.service.info()["g"].servers[0].addr, "b:9221");
}

// ---- GSLB projection (S5) ------------------------------------------

#[tokio::test]
async fn test_haproxy_projection() {
    let f = fixture().await;
    f.service.create_group("g", 11000, 12000).await.unwrap();
    for addr in ["a:9221", "b:9221", "c:9221"] {
        f.service.add_group_server("g", addr).await.unwrap();
    }

    f.redis.set_info("a:9221", &[("role", "master")]);
    f.redis.set_info(
        "b:9221",
        &[("master_addr", "a:9221"), ("master_link_status", "up")],
    );
    f.redis.set_info(
        "c:9221",
        &[("master_addr", "a:9221"), ("master_link_status", "down")],
    );
    f.service.refresh_stats_once(Duration::from_secs(1)).await;

    f.service.add_gslb("haproxy", "10.1.1.1:8080").await.unwrap();

    let record = parse_gslb(&f.store, "haproxy");
    assert_eq!(record.servers, vec!["10.1.1.1:8080".to_string()]);
    assert_eq!(record.backends.len(), 1);
    let bg = &record.backends[0];
    assert_eq!(bg.name, "g");

    let write = &bg.server_group["Write"];
    assert_eq!(write.port, 12000);
    assert_eq!(write.servers, vec!["a:9221".to_string()]);

    // The down-linked replica serves no reads.
    let read = &bg.server_group["Read"];
    assert_eq!(read.port, 11000);
    assert_eq!(
        read.servers,
        vec!["a:9221".to_string(), "b:9221".to_string()]
    );
}

#[tokio::test]
async fn test_haproxy_projection_drops_group_on_wrong_master() {
    let f = fixture().await;
    f.service.create_group("g", 11000, 12000).await.unwrap();
    f.service.add_group_server("g", "a:9221").await.unwrap();
    f.service.add_group_server("g", "b:9221").await.unwrap();

    f.redis.set_info("a:9221", &[("role", "master")]);
    // The replica follows a master outside the group: layout is wrong.
    f.redis.set_info(
        "b:9221",
        &[("master_addr", "x:9221"), ("master_link_status", "up")],
    );
    f.service.refresh_stats_once(Duration::from_secs(1)).await;

    f.service.add_gslb("haproxy", "10.1.1.1:8080").await.unwrap();
    let record = parse_gslb(&f.store, "haproxy");
    assert!(record.backends.is_empty());
}

#[tokio::test]
async fn test_lvs_projection_follows_haproxy() {
    let f = fixture().await;
    f.service.create_group("g", 11000, 12000).await.unwrap();
    f.service.add_group_server("g", "a:9221").await.unwrap();
    f.redis.set_info("a:9221", &[("role", "master")]);
    f.service.refresh_stats_once(Duration::from_secs(1)).await;

    f.service.add_gslb("haproxy", "10.1.1.1:8080").await.unwrap();
    f.service.add_gslb("haproxy", "10.1.1.2:8080").await.unwrap();
    f.service.add_gslb("lvs", "10.2.2.2:8080").await.unwrap();
    // A second projection pass lets lvs observe the updated haproxy record.
    f.service.refresh_stats_once(Duration::from_secs(1)).await;

    let record = parse_gslb(&f.store, "lvs");
    assert_eq!(
        record.monitors,
        vec!["10.1.1.1:8080".to_string(), "10.1.1.2:8080".to_string()]
    );
    assert_eq!(record.backends.len(), 1);
    let read = &record.backends[0].server_group["Read"];
    assert_eq!(read.port, 11000);
    assert_eq!(
        read.servers,
        vec!["10.1.1.1:11000".to_string(), "10.1.1.2:11000".to_string()]
    );
    let write = &record.backends[0].server_group["Write"];
    assert_eq!(
        write.servers,
        vec!["10.1.1.1:12000".to_string(), "10.1.1.2:12000".to_string()]
    );
}

#[tokio::test]
async fn test_del_gslb_removes_emptied_record() {
    let f = fixture().await;
    f.service.create_group("g", 11000, 12000).await.unwrap();
    f.service.add_group_server("g", "a:9221").await.unwrap();
    f.redis.set_info("a:9221", &[("role", "master")]);
    f.service.refresh_stats_once(Duration::from_secs(1)).await;

    f.service.add_gslb("haproxy", "10.1.1.1:8080").await.unwrap();
    let err = f
        .service
        .add_gslb("haproxy", "10.1.1.1:8080")
        .await
        .unwrap_err();
    assert!(matches!(err, CacheMgrError::AlreadyExists { .. }));

    f.service.del_gslb("haproxy", "10.1.1.1:8080").await.unwrap();
    assert!(f
        .store
        .peek(&path::gslb_path("haproxy", common::PRODUCT))
        .is_none());
}

// ---- sentinel set --------------------------------------------------

#[tokio::test]
async fn test_add_sentinel_flushes_and_marks_out_of_sync() {
    let f = fixture().await;
    f.service.add_sentinel("s1:26379").await.unwrap();

    assert_eq!(f.sentinel.flushed.lock().clone(), vec!["s1:26379".to_string()]);
    let ha = f.service.stats().await.ha;
    assert_eq!(ha.model.servers, vec!["s1:26379".to_string()]);
    assert!(ha.model.out_of_sync);

    let err = f.service.add_sentinel("s1:26379").await.unwrap_err();
    assert!(matches!(err, CacheMgrError::AlreadyExists { .. }));
}

#[tokio::test]
async fn test_del_sentinel_force_semantics() {
    let f = fixture().await;
    f.service.add_sentinel("s1:26379").await.unwrap();
    f.sentinel
        .fail_remove_all
        .store(true, std::sync::atomic::Ordering::SeqCst);

    // Without force the failing monitor cleanup aborts the removal.
    let err = f.service.del_sentinel("s1:26379", false).await.unwrap_err();
    assert!(matches!(err, CacheMgrError::Sentinel(_)));
    assert_eq!(f.service.stats().await.ha.model.servers.len(), 1);

    // With force it proceeds regardless.
    f.service.del_sentinel("s1:26379", true).await.unwrap();
    assert!(f.service.stats().await.ha.model.servers.is_empty());
}

#[tokio::test]
async fn test_resync_sentinels_installs_current_masters() {
    let f = fixture().await;
    f.service.add_sentinel("s1:26379").await.unwrap();
    f.service.create_group("g", 11000, 12000).await.unwrap();
    f.service.add_group_server("g", "a:9221").await.unwrap();

    f.service.resync_sentinels().await.unwrap();

    let monitored = f.sentinel.monitored.lock().clone();
    assert_eq!(monitored.len(), 1);
    assert_eq!(monitored[0]["g"], "a:9221");
    assert!(!f.service.stats().await.ha.model.out_of_sync);
    assert!(!f.sentinel.remove_all_calls.lock().is_empty());
}

// ---- lifecycle (invariant 8) ---------------------------------------

#[tokio::test]
async fn test_start_close_roundtrip() {
    let f = fixture().await;
    f.service.start().await.unwrap();
    assert!(f.service.is_online());
    assert!(f
        .store
        .peek(&path::topom_path(common::PRODUCT))
        .is_some());

    f.service.close().await.unwrap();
    assert!(!f.service.is_online());
    assert!(f
        .store
        .peek(&path::topom_path(common::PRODUCT))
        .is_none());

    // Close is idempotent; further mutations are refused.
    f.service.close().await.unwrap();
    let err = f.service.switch_masters(HashMap::new()).await.unwrap_err();
    assert!(matches!(err, CacheMgrError::ClosedTopom));
}

#[tokio::test]
async fn test_stats_snapshot_shape() {
    let f = fixture().await;
    f.service.create_group("g", 11000, 12000).await.unwrap();
    f.service.add_group_server("g", "a:9221").await.unwrap();
    f.redis.set_info("a:9221", &[("role", "master")]);
    f.service.refresh_stats_once(Duration::from_secs(1)).await;

    let stats = f.service.stats().await;
    assert!(!stats.closed);
    assert_eq!(stats.group.models.len(), 1);
    assert_eq!(stats.group.models[0].name, "g");
    let rs = &stats.group.stats["a:9221"];
    assert!(rs.error.is_none());
    assert_eq!(rs.stats["role"], "master");
    assert!(rs.unixtime > 0);
}
