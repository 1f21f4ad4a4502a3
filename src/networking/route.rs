use ipnetwork::IpNetwork;
use std::net::IpAddr;
use tracing::{debug, info};

use super::rule::add_from_rules;
use crate::config::MoveRoutes;
use crate::error::{tolerate_exists, Result};
use crate::ip::{Addr, Netlink, Route, Scope};
use crate::netns::NetNs;
use crate::types::IpFamily;
use crate::utils::{is_ordinal_advance, MAIN_TABLE};

/// Route every destination through `device` into `table`.
///
/// The gateway of the matching family is attached when known. Routes that
/// already exist are left alone.
pub fn add_route_table<N: Netlink>(
    netlink: &N,
    table: u32,
    scope: Scope,
    device: &str,
    destinations: &[IpNetwork],
    v4_gw: Option<IpAddr>,
    v6_gw: Option<IpAddr>,
) -> Result<()> {
    netlink
        .link_by_name(device)
        .map_err(|e| e.wrap(format!("failed to add routes via {}", device)))?;

    for dst in destinations {
        let mut route = Route::new(*dst, device, table, scope);
        route.gateway = if dst.is_ipv4() { v4_gw } else { v6_gw };

        debug!(%route, "add route");
        tolerate_exists(netlink.route_add(&route))
            .map_err(|e| e.wrap(format!("failed to add route {}", route)))?;
    }
    Ok(())
}

/// Preferred source of the route to each address, first one per family.
pub fn gateway_ips<N: Netlink>(
    netlink: &N,
    addrs: &[Addr],
) -> Result<(Option<IpAddr>, Option<IpAddr>)> {
    let (mut v4_gw, mut v6_gw) = (None, None);

    for addr in addrs {
        let routes = netlink
            .route_get(addr.ip())
            .map_err(|e| e.wrap(format!("failed to get route to pod IP {}", addr.ip())))?;

        let Some(src) = routes.first().and_then(|r| r.prefsrc) else {
            continue;
        };
        let slot = if addr.ip().is_ipv4() { &mut v4_gw } else { &mut v6_gw };
        if slot.is_none() {
            *slot = Some(src);
        }
    }

    Ok((v4_gw, v6_gw))
}

/// Keep replies of a secondary interface on that interface.
///
/// Adds `from` rules for the interface's own addresses, then relocates every
/// main-table route leaving through the interface into `table`. Must run
/// with the calling context inside the pod namespace.
pub fn move_routes<N: Netlink>(
    netlink: &N,
    netns: &NetNs,
    iface: &str,
    iface_addrs: &[Addr],
    mode: MoveRoutes,
    table: u32,
    family: IpFamily,
) -> Result<()> {
    if mode == MoveRoutes::Never {
        debug!(interface = iface, "route migration disabled");
        return Ok(());
    }

    netlink
        .in_netns(netns, || {
            if mode == MoveRoutes::AutoByOrder {
                match default_route_owner(netlink, iface, family)? {
                    Some(previous) if is_ordinal_advance(iface, &previous) => {
                        debug!(interface = iface, previous = %previous, "interface sorts after default route owner");
                    }
                    Some(previous) => {
                        info!(interface = iface, previous = %previous, "interface sorts before default route owner, keeping routes in main");
                        return Ok(());
                    }
                    None => {
                        info!(interface = iface, "no other default route owner, keeping routes in main");
                        return Ok(());
                    }
                }
            }

            add_from_rules(netlink, iface_addrs, table)
                .map_err(|e| e.wrap(format!("failed to add from rules for {}", iface)))?;
            move_route_table(netlink, iface, table, family)
        })
        .map_err(|e| e.wrap(format!("failed to move routes of {}", iface)))
}

/// Device of the first main-table default route not leaving through `iface`.
fn default_route_owner<N: Netlink>(netlink: &N, iface: &str, family: IpFamily) -> Result<Option<String>> {
    let routes = netlink.route_list(MAIN_TABLE, family)?;
    Ok(routes
        .iter()
        .filter(|r| r.is_default() && !r.uses_link(iface))
        .find_map(|r| {
            r.dev
                .clone()
                .or_else(|| r.nexthops.iter().find_map(|nh| nh.dev.clone()))
        }))
}

/// Move every main-table route of `iface` into `table`.
fn move_route_table<N: Netlink>(netlink: &N, iface: &str, table: u32, family: IpFamily) -> Result<()> {
    netlink.link_by_name(iface)?;

    let routes = netlink.route_list(MAIN_TABLE, family)?;
    for route in routes {
        if route.table != MAIN_TABLE || route.is_ipv6_link_local() || !route.uses_link(iface) {
            continue;
        }

        debug!(%route, "found route");
        netlink
            .route_del(&route)
            .map_err(|e| e.wrap(format!("failed to delete route {} from main table", route)))?;

        let moved = Route { table, ..route };
        tolerate_exists(netlink.route_add(&moved))
            .map_err(|e| e.wrap(format!("failed to add route {} to table {}", moved, table)))?;
        debug!(route = %moved, "moved route to new table");
    }
    Ok(())
}
