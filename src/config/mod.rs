use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Result, VethError};
use crate::types::CniResult;

/// Default location of the plugin log file
pub const DEFAULT_LOG_FILE: &str = "/var/log/veth-cni/veth.log";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_LOG_MAX_SIZE: u64 = 100;
pub const DEFAULT_LOG_MAX_AGE: u64 = 30;
pub const DEFAULT_LOG_MAX_COUNT: usize = 10;

/// Network configuration for the chained veth plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConf {
    /// CNI specification version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Name of the network
    #[serde(default)]
    pub name: String,
    /// Type of CNI plugin
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    /// Result of the previous plugin in the chain
    #[serde(rename = "prevResult", default, skip_serializing_if = "Option::is_none")]
    pub prev_result: Option<CniResult>,
    /// Only override the hardware address, skip the veth wiring
    #[serde(default)]
    pub only_hardware: bool,
    /// Two-octet prefix of the derived hardware address, like `0a:1b`
    #[serde(default)]
    pub hardware_prefix: String,
    #[serde(default)]
    pub cluster_cidr: Vec<String>,
    #[serde(default)]
    pub service_cidr: Vec<String>,
    #[serde(default)]
    pub additional_cidr: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rp_filter: Option<RpFilterConfig>,
    #[serde(default)]
    pub move_routes: MoveRoutes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_options: Option<LogOptions>,
}

/// `rp_filter` as written in the configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpFilterConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub value: i32,
}

/// Resolved reverse-path filtering policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpFilter {
    /// Apply the value on the host as well as in the pod
    pub enabled: bool,
    /// 0 = off, 1 = strict, 2 = loose
    pub value: u8,
}

impl RpFilter {
    /// Resolve the configured policy.
    ///
    /// Missing config or a missing `enabled` flag both resolve to enabled
    /// with value 0; values outside 0..=2 collapse to 0.
    pub fn resolve(config: Option<RpFilterConfig>) -> Self {
        let Some(config) = config else {
            return RpFilter { enabled: true, value: 0 };
        };
        let Some(enabled) = config.enabled else {
            return RpFilter { enabled: true, value: 0 };
        };
        let value = match config.value {
            v @ 0..=2 => v as u8,
            _ => 0,
        };
        RpFilter { enabled, value }
    }
}

impl Default for RpFilter {
    fn default() -> Self {
        RpFilter::resolve(None)
    }
}

/// Whether the default route of a secondary interface moves into its table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum MoveRoutes {
    /// Always migrate
    #[default]
    Directly,
    /// Migrate only when the interface sorts after the current default-route owner
    AutoByOrder,
    /// Never migrate
    Never,
}

impl TryFrom<i64> for MoveRoutes {
    type Error = String;

    fn try_from(value: i64) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(MoveRoutes::Directly),
            1 => Ok(MoveRoutes::AutoByOrder),
            2 => Ok(MoveRoutes::Never),
            other => Err(format!("move_routes must be 0, 1 or 2, got {}", other)),
        }
    }
}

impl From<MoveRoutes> for i64 {
    fn from(value: MoveRoutes) -> Self {
        match value {
            MoveRoutes::Directly => 0,
            MoveRoutes::AutoByOrder => 1,
            MoveRoutes::Never => 2,
        }
    }
}

/// Logging options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOptions {
    #[serde(rename = "log_level", default)]
    pub level: String,
    #[serde(rename = "log_file", default)]
    pub file_path: String,
    /// Rollover size in MiB
    #[serde(rename = "log_max_size", default)]
    pub max_size: Option<u64>,
    /// Days to keep rotated files
    #[serde(rename = "log_max_age", default)]
    pub max_age: Option<u64>,
    /// Number of rotated files to keep
    #[serde(rename = "log_max_count", default)]
    pub max_count: Option<usize>,
}

impl LogOptions {
    /// Fill unset fields with the defaults.
    pub fn with_defaults(options: Option<LogOptions>) -> Self {
        let mut options = options.unwrap_or_default();
        if options.level.is_empty() {
            options.level = DEFAULT_LOG_LEVEL.to_string();
        }
        if options.file_path.is_empty() {
            options.file_path = DEFAULT_LOG_FILE.to_string();
        }
        options.max_size.get_or_insert(DEFAULT_LOG_MAX_SIZE);
        options.max_age.get_or_insert(DEFAULT_LOG_MAX_AGE);
        options.max_count.get_or_insert(DEFAULT_LOG_MAX_COUNT);
        options
    }

    pub fn file(&self) -> PathBuf {
        PathBuf::from(&self.file_path)
    }
}

impl NetConf {
    /// Parse NetConf from bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut conf: NetConf = serde_json::from_slice(bytes)
            .map_err(|e| VethError::Config(format!("failed to parse config: {}", e)))?;

        if conf.prev_result.is_none() {
            return Err(VethError::Config(
                "failed to find prevResult, must be called as chained plugin".to_string(),
            ));
        }

        validate_hw_prefix(&conf.hardware_prefix)?;

        conf.log_options = Some(LogOptions::with_defaults(conf.log_options.take()));

        if conf.only_hardware {
            return Ok(conf);
        }

        validate_routes(conf.cidrs())?;

        Ok(conf)
    }

    /// The previous plugin's result.
    pub fn prev_result(&self) -> Result<&CniResult> {
        self.prev_result.as_ref().ok_or_else(|| {
            VethError::Config("failed to find prevResult, must be called as chained plugin".into())
        })
    }

    pub fn rp_filter(&self) -> RpFilter {
        RpFilter::resolve(self.rp_filter)
    }

    pub fn log_options(&self) -> LogOptions {
        LogOptions::with_defaults(self.log_options.clone())
    }

    /// Cluster, service and additional CIDRs, trimmed and normalized to
    /// their network address.
    pub fn local_cidrs(&self) -> Result<Vec<IpNetwork>> {
        self.cidrs().map(parse_cidr).collect()
    }

    fn cidrs(&self) -> impl Iterator<Item = &String> {
        self.cluster_cidr
            .iter()
            .chain(&self.service_cidr)
            .chain(&self.additional_cidr)
    }
}

/// Hardware prefixes look like `0a:1b` or `0a-1b`; empty disables the feature.
pub fn validate_hw_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() {
        return Ok(());
    }

    let bytes = prefix.as_bytes();
    let valid = bytes.len() == 5
        && bytes[..2].iter().all(u8::is_ascii_hexdigit)
        && matches!(bytes[2], b':' | b'-')
        && bytes[3..].iter().all(u8::is_ascii_hexdigit);

    if !valid {
        return Err(VethError::Config(
            "hardware_prefix format should match [a-fA-F0-9]{2}[:-][a-fA-F0-9]{2}, like '0a:1b'"
                .to_string(),
        ));
    }
    Ok(())
}

/// Every entry must parse as a CIDR once surrounding whitespace is removed.
pub fn validate_routes<'a>(routes: impl IntoIterator<Item = &'a String>) -> Result<()> {
    for route in routes {
        parse_cidr(route)?;
    }
    Ok(())
}

fn parse_cidr(raw: &String) -> Result<IpNetwork> {
    let net: IpNetwork = raw
        .trim()
        .parse()
        .map_err(|e| VethError::Config(format!("invalid CIDR {:?}: {}", raw, e)))?;
    IpNetwork::new(net.network(), net.prefix())
        .map_err(|e| VethError::Config(format!("invalid CIDR {:?}: {}", raw, e)))
}
