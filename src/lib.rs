//! cachemgr - control plane for a sharded Redis-compatible storage fleet.
//!
//! One dashboard process per product owns that product's topology: it
//! manages replication groups (one master plus replicas), drives a fleet of
//! Redis Sentinel monitors, and projects the observed topology into
//! load-balancer backend tables. All persistent state lives in an external
//! metadata store (ZooKeeper or etcd); this service is the single
//! authoritative writer for its product.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Admin API (axum): groups | sentinels | gslbs | templates    │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Service: lifecycle | group FSM | HA reactor | projections   │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Mappers: cached entity views with write-through             │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Clients: metadata store | Redis/Sentinel wire | GSLB HTTP   │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod gslb;
pub mod mapper;
pub mod model;
pub mod protocol;
pub mod redis;
pub mod service;
pub mod store;

pub use config::DashboardConfig;
pub use error::{CacheMgrError, MultiError, Result};
pub use service::Service;
