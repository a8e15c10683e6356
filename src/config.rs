//! Configuration for the cachemgr dashboard.

use crate::error::{CacheMgrError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file contents, kept in sync with the field set of
/// [`DashboardConfig`].
pub const DEFAULT_DASHBOARD_CONFIG: &str = r#"
##################################################
#                                                #
#               Cache-Manager Dashboard          #
#                                                #
##################################################

# Set coordinator, only accept "zookeeper" & "etcd".
# For zookeeper/etcd, coordinator_auth accepts "user:password".
coordinator_name = "zookeeper"
coordinator_addr = "127.0.0.1:2181"
coordinator_auth = ""

# Set product name/auth.
product_name = "cache-demo"
product_auth = ""

# Set bind address for admin(rpc), tcp only.
admin_addr = "0.0.0.0:18080"

# Set configs for redis sentinel.
sentinel_client_timeout = "10s"
sentinel_quorum = 2
sentinel_parallel_syncs = 1
sentinel_down_after = "30s"
sentinel_failover_timeout = "5m"
sentinel_notification_script = ""
sentinel_client_reconfig_script = ""

# Set configs for template-file mirroring.
template_file_scan_dir = "/tmp/template/*"
template_file_scan_interval = "30s"

# Set configs for log.
log_level = "info"
log_file_path = ""
"#;

/// Main configuration for the dashboard daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    pub coordinator_name: String,
    pub coordinator_addr: String,
    #[serde(default)]
    pub coordinator_auth: String,

    pub admin_addr: String,
    pub product_name: String,
    #[serde(default, skip_serializing)]
    pub product_auth: String,

    #[serde(with = "duration_str")]
    pub sentinel_client_timeout: Duration,
    pub sentinel_quorum: u32,
    pub sentinel_parallel_syncs: u32,
    #[serde(with = "duration_str")]
    pub sentinel_down_after: Duration,
    #[serde(with = "duration_str")]
    pub sentinel_failover_timeout: Duration,
    #[serde(default)]
    pub sentinel_notification_script: String,
    #[serde(default)]
    pub sentinel_client_reconfig_script: String,

    pub template_file_scan_dir: String,
    #[serde(with = "duration_str")]
    pub template_file_scan_interval: Duration,

    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file_path: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DashboardConfig {
    fn default() -> Self {
        toml::from_str(DEFAULT_DASHBOARD_CONFIG).expect("default config must parse")
    }
}

impl DashboardConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// omitted keys is intentionally not supported: the file must carry the
    /// full field set, same as the generated default file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CacheMgrError::InvalidConfig {
            field: "config".to_string(),
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| CacheMgrError::InvalidConfig {
            field: "config".to_string(),
            reason: format!("failed to parse {}: {}", path.display(), e),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        fn invalid(field: &str, reason: &str) -> CacheMgrError {
            CacheMgrError::InvalidConfig {
                field: field.to_string(),
                reason: reason.to_string(),
            }
        }

        if self.coordinator_name.is_empty() {
            return Err(invalid("coordinator_name", "must not be empty"));
        }
        if self.coordinator_addr.is_empty() {
            return Err(invalid("coordinator_addr", "must not be empty"));
        }
        if self.admin_addr.is_empty() {
            return Err(invalid("admin_addr", "must not be empty"));
        }
        if self.product_name.is_empty() || !valid_product_name(&self.product_name) {
            return Err(invalid(
                "product_name",
                "must match [word][word . -]* and not be empty",
            ));
        }
        if self.sentinel_client_timeout.is_zero() {
            return Err(invalid("sentinel_client_timeout", "must be positive"));
        }
        if self.sentinel_quorum == 0 {
            return Err(invalid("sentinel_quorum", "must be positive"));
        }
        if self.sentinel_parallel_syncs == 0 {
            return Err(invalid("sentinel_parallel_syncs", "must be positive"));
        }
        if self.sentinel_down_after.is_zero() {
            return Err(invalid("sentinel_down_after", "must be positive"));
        }
        if self.sentinel_failover_timeout.is_zero() {
            return Err(invalid("sentinel_failover_timeout", "must be positive"));
        }
        if self.template_file_scan_dir.is_empty() {
            return Err(invalid("template_file_scan_dir", "must not be empty"));
        }
        if self.template_file_scan_interval.is_zero() {
            return Err(invalid("template_file_scan_interval", "must be positive"));
        }
        Ok(())
    }
}

/// Product names end up as path components in the metadata store and as
/// monitor-name prefixes on the Sentinel wire.
fn valid_product_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphanumeric() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '.' || c == '-')
}

/// Serde adapter for human-readable duration strings like `"10s"`, `"5m"`,
/// `"100ms"`.
pub mod duration_str {
    use serde::de::Error as DeError;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format(d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(d)?;
        parse(&text).map_err(D::Error::custom)
    }

    pub fn parse(text: &str) -> Result<Duration, String> {
        let text = text.trim();
        let split = text
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("missing unit in duration '{}'", text))?;
        let (num, unit) = text.split_at(split);
        let value: f64 = num
            .parse()
            .map_err(|_| format!("bad number in duration '{}'", text))?;
        let secs = match unit {
            "ms" => value / 1000.0,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            _ => return Err(format!("unknown unit '{}' in duration '{}'", unit, text)),
        };
        Ok(Duration::from_secs_f64(secs))
    }

    pub fn format(d: &Duration) -> String {
        let ms = d.as_millis();
        if ms % 3_600_000 == 0 && ms != 0 {
            format!("{}h", ms / 3_600_000)
        } else if ms % 60_000 == 0 && ms != 0 {
            format!("{}m", ms / 60_000)
        } else if ms % 1000 == 0 {
            format!("{}s", ms / 1000)
        } else {
            format!("{}ms", ms)
        }
    }
}
