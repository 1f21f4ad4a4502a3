//! Chained veth CNI plugin for Kubernetes
//!
//! Runs after a Macvlan/SR-IOV plugin has configured a pod interface and:
//! - Creates a veth pair between the pod and the host
//! - Installs static neighbor entries on both ends
//! - Routes node addresses and cluster/service CIDRs through the veth
//! - Pins each secondary interface to its own policy routing table
//! - Sets rp_filter on the host and in the pod

pub mod commands;
pub mod config;
pub mod error;
pub mod ip;
pub mod logging;
pub mod netns;
pub mod networking;
pub mod plugin;
pub mod types;
pub mod utils;

/// Name of the pod end of the veth pair
pub const POD_VETH_NAME: &str = "veth0";
/// MTU of both ends of the veth pair
pub const DEFAULT_MTU: u32 = 1500;

// Re-export commonly used items
pub use commands::{cmd_add, cmd_check, cmd_del, run_cni};
pub use config::NetConf;
pub use error::{Result, VethError};
pub use ip::{IpRoute2, Netlink};
pub use plugin::VethPlugin;
