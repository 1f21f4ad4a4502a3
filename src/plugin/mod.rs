use std::fmt;
use tracing::{debug, error, info};

use crate::config::NetConf;
use crate::error::{tolerate_exists, Result, VethError};
use crate::ip::{Addr, Netlink, Scope};
use crate::netns::NetNs;
use crate::networking::{
    add_neighbor, add_route_table, add_to_rules, addresses_of, addresses_on_host, gateway_ips,
    host_networks, hw_address_pair, move_routes, override_hw_address, InterfaceMatcher, Sysctl,
};
use crate::types::{CmdArgs, CniResult, IpFamily};
use crate::utils::{route_table, MAIN_TABLE};
use crate::{DEFAULT_MTU, POD_VETH_NAME};

/// Number of container id characters kept in the host-side veth name
const HOST_VETH_ID_LEN: usize = 11;

/// Progress of an ADD invocation, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ConfigResolved,
    NamespaceEntered,
    AddressOverridden,
    VethEnsured,
    AddressesDiscovered,
    NeighborsSynced,
    RoutesInstalled,
    RoutesMigrated,
    RpFilterApplied,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ConfigResolved => "config_resolved",
            Stage::NamespaceEntered => "namespace_entered",
            Stage::AddressOverridden => "address_overridden",
            Stage::VethEnsured => "veth_ensured",
            Stage::AddressesDiscovered => "addresses_discovered",
            Stage::NeighborsSynced => "neighbors_synced",
            Stage::RoutesInstalled => "routes_installed",
            Stage::RoutesMigrated => "routes_migrated",
            Stage::RpFilterApplied => "rp_filter_applied",
        };
        f.write_str(name)
    }
}

/// Log the outcome of a stage; failures abort the invocation without rollback.
fn reach<T>(stage: Stage, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            debug!(%stage, "stage reached");
            Ok(value)
        }
        Err(e) => {
            error!(%stage, error = %e, "stage failed");
            Err(e)
        }
    }
}

/// Host-side veth name: `veth` followed by the first 11 characters of the container id.
pub fn host_veth_name(container_id: &str) -> String {
    format!(
        "veth{}",
        container_id.chars().take(HOST_VETH_ID_LEN).collect::<String>()
    )
}

/// Chained veth plugin implementation
pub struct VethPlugin<N: Netlink> {
    /// Network configuration
    config: NetConf,
    /// Command arguments
    args: CmdArgs,
    netlink: N,
    sysctl: Sysctl,
    excludes: InterfaceMatcher,
}

impl<N: Netlink> VethPlugin<N> {
    /// Create a new veth plugin
    pub fn new(config: NetConf, args: CmdArgs, netlink: N) -> Self {
        Self {
            config,
            args,
            netlink,
            sysctl: Sysctl::default(),
            excludes: InterfaceMatcher::default(),
        }
    }

    /// Use another sysctl tree.
    pub fn with_sysctl(mut self, sysctl: Sysctl) -> Self {
        self.sysctl = sysctl;
        self
    }

    pub fn netlink(&self) -> &N {
        &self.netlink
    }

    /// Wire the chained interface and return the previous result unchanged.
    pub fn add_network(&self) -> Result<CniResult> {
        let ifname = self.args.ifname.as_str();

        let (prev, family) = reach(Stage::ConfigResolved, self.resolve())?;

        let netns = reach(
            Stage::NamespaceEntered,
            NetNs::open(&self.args.netns)
                .map_err(|e| e.wrap(format!("failed to open netns {:?}", self.args.netns))),
        )?;

        if !self.config.hardware_prefix.is_empty() {
            let prefix = self.config.hardware_prefix.as_str();
            let hw_addr = reach(
                Stage::AddressOverridden,
                override_hw_address(&self.netlink, &netns, prefix, ifname).map_err(|e| {
                    e.wrap(format!(
                        "failed to update hardware address for interface {}, maybe hardware_prefix({}) is invalid",
                        ifname, prefix
                    ))
                }),
            )?;
            info!(interface = ifname, hardware_address = %hw_addr, "override hardware address successfully");

            if self.config.only_hardware {
                debug!("only overriding hardware address, skipping veth wiring");
                return Ok(prev.clone().with_version(&self.config.cni_version));
            }
        }

        let first = self.is_first_invocation(&netns)?;
        if first {
            info!(netns = %netns.path().display(), "calling veth plugin for the first time");
        } else {
            info!(netns = %netns.path().display(), "calling veth plugin not for the first time");
        }

        let host_veth = reach(Stage::VethEnsured, self.ensure_pair(&netns, first))?;
        debug!(host_veth = %host_veth, "veth pair ready");

        let (node_addrs, iface_addrs) =
            reach(Stage::AddressesDiscovered, self.discover(&netns, family))?;

        if family != IpFamily::V4 {
            let sysctl = &self.sysctl;
            self.netlink
                .in_netns(&netns, || sysctl.enable_ipv6())
                .map_err(|e| e.wrap("failed to enable ipv6 in pod"))?;
        }

        reach(
            Stage::NeighborsSynced,
            self.sync_neighbors(&netns, &host_veth, first, &node_addrs, &iface_addrs),
        )?;

        let table = if first {
            MAIN_TABLE
        } else {
            route_table(ifname).ok_or_else(|| VethError::Unmappable(ifname.to_string()))?
        };

        reach(
            Stage::RoutesInstalled,
            self.setup_routes(&netns, table, &host_veth, &node_addrs, &iface_addrs),
        )?;

        if !first {
            reach(
                Stage::RoutesMigrated,
                move_routes(
                    &self.netlink,
                    &netns,
                    ifname,
                    &iface_addrs,
                    self.config.move_routes,
                    table,
                    family,
                ),
            )?;
        }

        reach(Stage::RpFilterApplied, self.apply_rp_filter(&netns))?;

        Ok(prev.clone().with_version(&self.config.cni_version))
    }

    fn resolve(&self) -> Result<(&CniResult, IpFamily)> {
        let prev = self.config.prev_result()?;
        let family = prev.ip_family()?;
        Ok((prev, family))
    }

    /// The pod-side veth is missing until the first invocation for a pod creates it.
    fn is_first_invocation(&self, netns: &NetNs) -> Result<bool> {
        let lookup = self
            .netlink
            .in_netns(netns, || self.netlink.link_by_name(POD_VETH_NAME));
        match lookup {
            Ok(_) => Ok(false),
            Err(e) if e.is_link_not_found() => Ok(true),
            Err(e) => Err(e.wrap("failed to check first veth interface")),
        }
    }

    /// Create the veth pair on the first invocation, or recover its host-side name.
    pub fn ensure_pair(&self, netns: &NetNs, first: bool) -> Result<String> {
        let host_veth = host_veth_name(&self.args.container_id);
        if !first {
            return Ok(host_veth);
        }

        let netlink = &self.netlink;
        netlink
            .in_netns(netns, || {
                tolerate_exists(netlink.link_add_veth(POD_VETH_NAME, &host_veth, DEFAULT_MTU))?;
                netlink
                    .link_set_up(POD_VETH_NAME)
                    .map_err(|e| e.wrap(format!("failed to set {} up", POD_VETH_NAME)))
            })
            .map_err(|e| e.wrap(format!("failed to create veth pair {}/{}", POD_VETH_NAME, host_veth)))?;

        Ok(host_veth)
    }

    fn discover(&self, netns: &NetNs, family: IpFamily) -> Result<(Vec<Addr>, Vec<Addr>)> {
        let node_addrs = addresses_on_host(&self.netlink, family, &self.excludes)
            .map_err(|e| e.wrap("failed to get addresses on node"))?;

        let ifname = self.args.ifname.as_str();
        let iface_addrs = addresses_of(&self.netlink, netns, ifname, family)
            .map_err(|e| e.wrap(format!("failed to find ip from chained interface {}", ifname)))?;
        info!(
            interface = ifname,
            addresses = ?iface_addrs.iter().map(|a| a.net.to_string()).collect::<Vec<_>>(),
            "got the addresses of interface"
        );

        Ok((node_addrs, iface_addrs))
    }

    /// Static neighbor entries on both ends of the pair.
    ///
    /// The host learns the pod-side address for every interface address; on the
    /// first invocation the pod learns the host-side address for every node address.
    pub fn sync_neighbors(
        &self,
        netns: &NetNs,
        host_veth: &str,
        first: bool,
        node_addrs: &[Addr],
        iface_addrs: &[Addr],
    ) -> Result<()> {
        let netlink = &self.netlink;
        let (host_hw, pod_hw) = hw_address_pair(netlink, netns, host_veth)?;

        for addr in iface_addrs {
            add_neighbor(netlink, host_veth, addr.ip(), pod_hw)?;
        }

        if !first {
            return Ok(());
        }

        debug!(host_veth, host_hw = %host_hw, pod_hw = %pod_hw, "sync pod neighbors");
        netlink.in_netns(netns, || {
            for addr in node_addrs {
                add_neighbor(netlink, POD_VETH_NAME, addr.ip(), host_hw)?;
            }
            Ok(())
        })
    }

    /// Routes and rules inside the pod, plus the host route back to the pod.
    pub fn setup_routes(
        &self,
        netns: &NetNs,
        table: u32,
        host_veth: &str,
        node_addrs: &[Addr],
        iface_addrs: &[Addr],
    ) -> Result<()> {
        let netlink = &self.netlink;
        let (v4_gw, v6_gw) = gateway_ips(netlink, iface_addrs)?;
        let cidrs = self.config.local_cidrs()?;
        let node_nets = host_networks(node_addrs);

        netlink.in_netns(netns, || {
            add_route_table(netlink, table, Scope::Link, POD_VETH_NAME, &node_nets, None, None)
                .map_err(|e| e.wrap("failed to add routes for node addresses"))?;

            add_route_table(netlink, table, Scope::Universe, POD_VETH_NAME, &cidrs, v4_gw, v6_gw)
                .map_err(|e| e.wrap("failed to add routes for local CIDRs"))?;

            if table != MAIN_TABLE {
                add_to_rules(netlink, iface_addrs, table)
                    .map_err(|e| e.wrap("failed to add to rules"))?;
            }
            debug!(table, cidrs = ?cidrs.iter().map(ToString::to_string).collect::<Vec<_>>(), "pod routes installed");
            Ok(())
        })?;

        add_route_table(
            netlink,
            MAIN_TABLE,
            Scope::Universe,
            host_veth,
            &host_networks(iface_addrs),
            None,
            None,
        )
        .map_err(|e| e.wrap("failed to add host routes for interface addresses"))
    }

    /// Host side only when enabled; the pod always gets the value.
    fn apply_rp_filter(&self, netns: &NetNs) -> Result<()> {
        let policy = self.config.rp_filter();
        self.sysctl.apply_host_rp_filter(&policy)?;

        let sysctl = &self.sysctl;
        self.netlink
            .in_netns(netns, || sysctl.set_rp_filter(policy.value))
            .map_err(|e| e.wrap("failed to set rp_filter in pod"))
    }
}
