use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::IpAddr;

use crate::error::{Result, VethError};

/// CNI command arguments
#[derive(Debug, Clone)]
pub struct CmdArgs {
    /// Container ID
    pub container_id: String,
    /// Network namespace path
    pub netns: String,
    /// Interface name
    pub ifname: String,
    /// Arguments
    pub args: HashMap<String, String>,
    /// Path
    pub path: String,
    /// Standard input data
    pub stdin_data: Vec<u8>,
}

/// Kubernetes identity carried in `CNI_ARGS`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct K8sArgs {
    pub ip: Option<IpAddr>,
    pub pod_name: String,
    pub pod_namespace: String,
    pub pod_infra_container_id: String,
    pub pod_uid: String,
}

impl K8sArgs {
    /// Project the parsed `CNI_ARGS` pairs onto the Kubernetes fields.
    pub fn from_args(args: &HashMap<String, String>) -> Result<Self> {
        let field = |key: &str| args.get(key).cloned().unwrap_or_default();
        let ip = match args.get("IP").map(|v| v.trim()).filter(|v| !v.is_empty()) {
            Some(raw) => Some(
                raw.parse()
                    .map_err(|_| VethError::Config(format!("invalid IP in CNI_ARGS: {}", raw)))?,
            ),
            None => None,
        };

        Ok(Self {
            ip,
            pod_name: field("K8S_POD_NAME"),
            pod_namespace: field("K8S_POD_NAMESPACE"),
            pod_infra_container_id: field("K8S_POD_INFRA_CONTAINER_ID"),
            pod_uid: field("K8S_POD_UID"),
        })
    }
}

/// Which address families an invocation deals with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
    All,
}

impl IpFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    /// Whether an address belongs to this family selection.
    pub fn includes(&self, ip: &IpAddr) -> bool {
        match self {
            IpFamily::All => true,
            IpFamily::V4 => ip.is_ipv4(),
            IpFamily::V6 => ip.is_ipv6(),
        }
    }

    /// iproute2 family switch.
    pub fn flag(&self) -> Option<&'static str> {
        match self {
            IpFamily::V4 => Some("-4"),
            IpFamily::V6 => Some("-6"),
            IpFamily::All => None,
        }
    }
}

/// Result produced by the previous plugin in the chain (CNI 1.0.0 layout).
///
/// Fields this plugin does not interpret are kept in `extra` so the result
/// is re-emitted unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CniResult {
    /// CNI specification version
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    /// Interfaces created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<Interface>>,
    /// IP configurations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ips: Option<Vec<IPConfig>>,
    /// DNS configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<DNS>,
    /// Routes to configure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<Route>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Interface information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    /// Interface name
    pub name: String,
    /// MAC address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Sandbox path (network namespace)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// IP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IPConfig {
    /// Interface index this IP is assigned to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
    /// IP address with prefix length
    pub address: String,
    /// Gateway
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// DNS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DNS {
    /// DNS nameservers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nameservers: Option<Vec<String>>,
    /// DNS domain
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// DNS search domains
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<Vec<String>>,
    /// DNS options
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

/// Route configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    /// Destination CIDR
    pub dst: String,
    /// Gateway for this route
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

impl CniResult {
    /// Address family of the IPs assigned by the previous plugin.
    pub fn ip_family(&self) -> Result<IpFamily> {
        if self.interfaces.as_ref().map_or(true, |i| i.is_empty()) {
            return Err(VethError::Config(
                "can't find any interface from prevResult".to_string(),
            ));
        }

        let (mut v4, mut v6) = (false, false);
        for ip in self.ips.iter().flatten() {
            let net: IpNetwork = ip.address.parse().map_err(|_| {
                VethError::Config(format!("invalid address {} in prevResult", ip.address))
            })?;
            if net.is_ipv4() {
                v4 = true;
            } else {
                v6 = true;
            }
        }

        Ok(match (v4, v6) {
            (true, true) => IpFamily::All,
            (_, true) => IpFamily::V6,
            _ => IpFamily::V4,
        })
    }

    /// Re-emit the result under the given specification version.
    pub fn with_version(mut self, cni_version: &str) -> Self {
        self.cni_version = cni_version.to_string();
        self
    }

    /// Print result as JSON
    pub fn print(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        println!("{}", json);
        Ok(())
    }
}
