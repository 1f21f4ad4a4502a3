//! Address discovery and the wiring steps built on the [`Netlink`] surface.

pub mod mac;
pub mod route;
pub mod rule;
pub mod sysctl;

pub use mac::{derive_hw_addr, override_hw_address, add_neighbor, hw_address_pair};
pub use route::{add_route_table, gateway_ips, move_routes};
pub use rule::{add_from_rules, add_to_rules};
pub use sysctl::Sysctl;

use ipnetwork::IpNetwork;
use tracing::debug;

use crate::error::Result;
use crate::ip::{Addr, Netlink};
use crate::netns::NetNs;
use crate::types::IpFamily;

/// Host devices whose addresses are never treated as node addresses.
pub const DEFAULT_INTERFACES_TO_EXCLUDE: &[&str] = &[
    "docker*", "cbr*", "dummy*", "virbr*", "lxcbr*", "veth*", "lo", "cali*", "tunl*",
    "flannel*", "kube-ipvs*", "cni*",
];

/// Interface-name exclusion set, compiled once.
///
/// A pattern ending in `*` (or `.*`) matches names starting with the part
/// before it; any other pattern matches the name exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceMatcher {
    prefixes: Vec<String>,
    exact: Vec<String>,
}

impl InterfaceMatcher {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut prefixes = Vec::new();
        let mut exact = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            match pattern
                .strip_suffix(".*")
                .or_else(|| pattern.strip_suffix('*'))
            {
                Some(prefix) => prefixes.push(prefix.to_string()),
                None => exact.push(pattern.to_string()),
            }
        }
        Self { prefixes, exact }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.exact.iter().any(|e| e == name)
            || self.prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }
}

impl Default for InterfaceMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_INTERFACES_TO_EXCLUDE)
    }
}

/// Wireable addresses of `link` in the calling namespace.
fn wireable_addrs<N: Netlink>(netlink: &N, link: &str, family: IpFamily) -> Result<Vec<Addr>> {
    Ok(netlink
        .addr_list(link, family)?
        .into_iter()
        .filter(|a| a.is_wireable() && family.includes(&a.ip()))
        .collect())
}

/// All addresses of `iface` inside `netns`, without multicast or link-local entries.
pub fn addresses_of<N: Netlink>(
    netlink: &N,
    netns: &NetNs,
    iface: &str,
    family: IpFamily,
) -> Result<Vec<Addr>> {
    netlink
        .in_netns(netns, || {
            netlink.link_by_name(iface)?;
            wireable_addrs(netlink, iface, family)
        })
        .map_err(|e| e.wrap(format!("failed to list addresses of {}", iface)))
}

/// Union of the addresses of every host link not excluded by `exclude`.
///
/// Any per-link failure fails the whole call.
pub fn addresses_on_host<N: Netlink>(
    netlink: &N,
    family: IpFamily,
    exclude: &InterfaceMatcher,
) -> Result<Vec<Addr>> {
    let links = netlink
        .link_list()
        .map_err(|e| e.wrap("failed to list host links"))?;

    let mut addrs = Vec::new();
    for link in links.iter().filter(|l| !exclude.matches(&l.name)) {
        let found = wireable_addrs(netlink, &link.name, family)
            .map_err(|e| e.wrap(format!("failed to list addresses of host link {}", link.name)))?;
        addrs.extend(found);
    }

    debug!(addresses = ?addrs.iter().map(|a| a.net.to_string()).collect::<Vec<_>>(), "addresses on node");
    Ok(addrs)
}

/// Render addresses as /32 and /128 selectors.
pub fn host_networks(addrs: &[Addr]) -> Vec<IpNetwork> {
    addrs.iter().map(Addr::host).collect()
}
