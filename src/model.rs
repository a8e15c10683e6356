//! Persisted entity records.
//!
//! Every record is stored JSON-encoded in the metadata store; the field
//! names below are the wire schema and must stay stable across versions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Upper bound on group names; they become path components and Sentinel
/// monitor names.
pub const MAX_GROUP_NAME_LEN: usize = 32;

/// The leader registration for one product, created as an ephemeral node at
/// service start and deleted on orderly shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topom {
    #[serde(rename = "startTime")]
    pub start_time: String,
    #[serde(rename = "adminAddr")]
    pub admin_addr: String,
    #[serde(rename = "productName")]
    pub product_name: String,
    pub pid: u32,
    pub pwd: String,
    pub sys: String,
}

/// One member of a replication group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupServer {
    pub addr: String,
}

/// Promotion progress of a group. `state` walks
/// nothing -> preparing -> prepared -> finished and back to nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromoteState {
    #[default]
    #[serde(rename = "")]
    Nothing,
    #[serde(rename = "preparing")]
    Preparing,
    #[serde(rename = "prepared")]
    Prepared,
    #[serde(rename = "finished")]
    Finished,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promoting {
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub state: PromoteState,
}

/// A replication group. `servers[0]` is the master by convention; the rest
/// are replicas in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub servers: Vec<GroupServer>,
    #[serde(default)]
    pub promoting: Promoting,
    #[serde(rename = "outOfSync")]
    pub out_of_sync: bool,
    #[serde(rename = "proxyReadPort")]
    pub proxy_read_port: u16,
    #[serde(rename = "proxyWritePort")]
    pub proxy_write_port: u16,
    #[serde(rename = "createTime")]
    pub create_time: String,
}

impl Group {
    /// Master address, empty when the group has no servers.
    pub fn master(&self) -> &str {
        self.servers.first().map(|s| s.addr.as_str()).unwrap_or("")
    }

    /// Index of `addr` within the group, if present.
    pub fn server_index(&self, addr: &str) -> Option<usize> {
        self.servers.iter().position(|s| s.addr == addr)
    }
}

pub type Groups = HashMap<String, Group>;

/// Map of group name to master address for every non-empty group.
pub fn group_masters(groups: &Groups) -> HashMap<String, String> {
    groups
        .iter()
        .filter(|(_, g)| !g.servers.is_empty())
        .map(|(name, g)| (name.clone(), g.master().to_string()))
        .collect()
}

/// The Sentinel set for one product. Adding or removing a sentinel always
/// marks the record out of sync until the next successful resync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sentinel {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<String>,
    #[serde(rename = "outOfSync")]
    pub out_of_sync: bool,
}

/// Which traffic class a backend serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServeState {
    Read,
    Write,
}

impl ServeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServeState::Read => "Read",
            ServeState::Write => "Write",
        }
    }
}

/// One projected backend: the servers reachable on `port` for a serve state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GslbBackend {
    pub servers: Vec<String>,
    pub port: u16,
}

/// Backends of one group, keyed by serve state name ("Read" / "Write").
pub type GslbBackends = HashMap<String, GslbBackend>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GslbBackendGroup {
    pub name: String,
    #[serde(rename = "serverGroup")]
    pub server_group: GslbBackends,
}

/// A load-balancer projection target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gslb {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub monitors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backends: Vec<GslbBackendGroup>,
}

pub type Gslbs = HashMap<String, Gslb>;

/// A template file mirrored between the local scan directory and the store.
/// The store value is the raw file contents; the MD5 is kept for diffing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateFile {
    pub data: Vec<u8>,
    pub md5: [u8; 16],
}

pub type TemplateFiles = HashMap<String, TemplateFile>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_json_shape() {
        let g = Group {
            name: "g1".into(),
            servers: vec![GroupServer {
                addr: "10.0.0.1:9221".into(),
            }],
            promoting: Promoting::default(),
            out_of_sync: false,
            proxy_read_port: 11000,
            proxy_write_port: 12000,
            create_time: "2024-01-02 03:04:05".into(),
        };
        let data = serde_json::to_value(&g).unwrap();
        assert_eq!(data["proxyReadPort"], 11000);
        assert_eq!(data["servers"][0]["addr"], "10.0.0.1:9221");
        assert_eq!(data["promoting"]["state"], "");
        let back: Group = serde_json::from_value(data).unwrap();
        assert_eq!(back, g);
    }

    #[test]
    fn test_promote_state_wire_names() {
        assert_eq!(
            serde_json::to_string(&PromoteState::Preparing).unwrap(),
            "\"preparing\""
        );
        assert_eq!(
            serde_json::from_str::<PromoteState>("\"\"").unwrap(),
            PromoteState::Nothing
        );
    }

    #[test]
    fn test_group_promoting_defaults_when_absent() {
        let g: Group = serde_json::from_str(
            r#"{"name":"g","servers":[],"outOfSync":false,
                "proxyReadPort":1,"proxyWritePort":2,"createTime":""}"#,
        )
        .unwrap();
        assert_eq!(g.promoting.state, PromoteState::Nothing);
        assert_eq!(g.promoting.index, 0);
    }

    #[test]
    fn test_group_masters_skips_empty_groups() {
        let mut groups = Groups::new();
        groups.insert(
            "a".into(),
            Group {
                name: "a".into(),
                servers: vec![GroupServer {
                    addr: "h1:9221".into(),
                }],
                ..Default::default()
            },
        );
        groups.insert(
            "b".into(),
            Group {
                name: "b".into(),
                ..Default::default()
            },
        );
        let masters = group_masters(&groups);
        assert_eq!(masters.len(), 1);
        assert_eq!(masters["a"], "h1:9221");
    }

    #[test]
    fn test_server_index() {
        let g = Group {
            name: "g".into(),
            servers: vec![
                GroupServer { addr: "a:1".into() },
                GroupServer { addr: "b:2".into() },
            ],
            ..Default::default()
        };
        assert_eq!(g.server_index("b:2"), Some(1));
        assert_eq!(g.server_index("c:3"), None);
    }
}
