use tracing::debug;

use crate::error::{tolerate_exists, Result};
use crate::ip::{Addr, Netlink, Rule, RuleSelector};

/// Send lookups for traffic addressed to each address through `table`.
///
/// Equivalent to `ip rule add to <addr> lookup <table>`.
pub fn add_to_rules<N: Netlink>(netlink: &N, addrs: &[Addr], table: u32) -> Result<()> {
    add_rules(netlink, addrs, table, RuleSelector::To)
}

/// Send lookups for traffic originated from each address through `table`.
///
/// Equivalent to `ip rule add from <addr> lookup <table>`. These rules go in
/// before any route leaves the main table so replies always find a table.
pub fn add_from_rules<N: Netlink>(netlink: &N, addrs: &[Addr], table: u32) -> Result<()> {
    add_rules(netlink, addrs, table, RuleSelector::From)
}

fn add_rules<N: Netlink>(
    netlink: &N,
    addrs: &[Addr],
    table: u32,
    selector: fn(ipnetwork::IpNetwork) -> RuleSelector,
) -> Result<()> {
    for addr in addrs {
        let rule = Rule {
            selector: selector(addr.host()),
            table,
        };
        debug!(%rule, "add rule");
        tolerate_exists(netlink.rule_add(&rule))
            .map_err(|e| e.wrap(format!("failed to add rule {}", rule)))?;
    }
    Ok(())
}
