//! Admin-API view types.
//!
//! These are the JSON shapes served by the admin surface; they mirror the
//! persisted records but carry derived state (stats, HA masters) alongside.

use crate::model::Promoting;
use crate::redis::SentinelGroup;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RedisStatsView {
    pub error: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub stats: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub sentinel: HashMap<String, SentinelGroup>,
    pub unixtime: i64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub timeout: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GslbStatsView {
    pub error: Option<String>,
    pub unixtime: i64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub timeout: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupServerView {
    #[serde(rename = "server")]
    pub addr: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupView {
    pub name: String,
    pub servers: Vec<GroupServerView>,
    pub promoting: Promoting,
    #[serde(rename = "outOfSync")]
    pub out_of_sync: bool,
    #[serde(rename = "proxyReadPort")]
    pub proxy_read_port: u16,
    #[serde(rename = "proxyWritePort")]
    pub proxy_write_port: u16,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SentinelView {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<String>,
    #[serde(rename = "outOfSync")]
    pub out_of_sync: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GslbView {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GroupSection {
    pub models: Vec<GroupView>,
    pub stats: HashMap<String, RedisStatsView>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HaSection {
    pub model: SentinelView,
    pub stats: HashMap<String, RedisStatsView>,
    pub masters: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GslbSection {
    pub models: HashMap<String, GslbView>,
    pub stats: HashMap<String, GslbStatsView>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TemplateSection {
    #[serde(rename = "fileNames")]
    pub file_names: Vec<String>,
}

/// Everything the dashboard front-end renders for one product.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub closed: bool,
    pub group: GroupSection,
    #[serde(rename = "sentinels")]
    pub ha: HaSection,
    #[serde(rename = "gslbs")]
    pub gslb: GslbSection,
    pub template: TemplateSection,
}

/// Topom identity plus the full stats snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    pub version: String,
    pub config: crate::config::DashboardConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<crate::model::Topom>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<Stats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_sections_serialize_with_wire_names() {
        let stats = Stats::default();
        let v = serde_json::to_value(&stats).unwrap();
        assert!(v.get("sentinels").is_some());
        assert!(v.get("gslbs").is_some());
        assert!(v["template"].get("fileNames").is_some());
    }

    #[test]
    fn test_timeout_flag_omitted_when_false() {
        let view = RedisStatsView::default();
        let v = serde_json::to_value(&view).unwrap();
        assert!(v.get("timeout").is_none());

        let view = RedisStatsView {
            timeout: true,
            ..Default::default()
        };
        let v = serde_json::to_value(&view).unwrap();
        assert_eq!(v["timeout"], true);
    }
}
