use ipnetwork::IpNetwork;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;

use super::{Addr, HardwareAddr, Link, Neigh, Netlink, NextHop, Route, Rule, RuleSelector, Scope};
use crate::error::{Result, VethError};
use crate::netns::NetNs;
use crate::types::IpFamily;

/// [`Netlink`] backed by the iproute2 `ip` binary.
///
/// Commands run in the namespace of the calling thread; queries use the
/// `-j` JSON output.
#[derive(Debug, Clone)]
pub struct IpRoute2 {
    binary: PathBuf,
}

impl Default for IpRoute2 {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ip"),
        }
    }
}

impl IpRoute2 {
    fn exec(&self, args: &[String]) -> Result<Vec<u8>> {
        let cmd = format!("ip {}", args.join(" "));
        debug!(%cmd, "exec");

        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|e| VethError::Io(e).wrap(format!("failed to execute {}", cmd)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("File exists") {
                return Err(VethError::AlreadyExists(cmd));
            }
            return Err(VethError::Kernel { cmd, stderr });
        }

        Ok(output.stdout)
    }

    fn query<T: for<'de> Deserialize<'de>>(&self, args: &[String]) -> Result<Vec<T>> {
        let stdout = self.exec(args)?;
        parse_json(&stdout)
    }
}

impl Netlink for IpRoute2 {
    fn in_netns<T, F>(&self, netns: &NetNs, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send,
        T: Send,
    {
        netns.run(f)
    }

    fn link_by_name(&self, name: &str) -> Result<Link> {
        let links: Vec<JsonLink> = match self.query(&args(["-j", "link", "show", "dev", name])) {
            Ok(links) => links,
            Err(VethError::Kernel { stderr, .. })
                if stderr.contains("does not exist") || stderr.contains("Cannot find device") =>
            {
                return Err(VethError::LinkNotFound(name.to_string()));
            }
            Err(e) => return Err(e),
        };
        links
            .into_iter()
            .next()
            .map(JsonLink::into_link)
            .transpose()?
            .ok_or_else(|| VethError::LinkNotFound(name.to_string()))
    }

    fn link_list(&self) -> Result<Vec<Link>> {
        let links: Vec<JsonLink> = self.query(&args(["-j", "link", "show"]))?;
        links.into_iter().map(JsonLink::into_link).collect()
    }

    fn addr_list(&self, link: &str, family: IpFamily) -> Result<Vec<Addr>> {
        let mut cmd = family_args(family);
        cmd.extend(args(["-j", "addr", "show", "dev", link]));
        let links: Vec<JsonLink> = self.query(&cmd)?;

        let mut addrs = Vec::new();
        for info in links.into_iter().flat_map(|l| l.addr_info) {
            let addr = info.into_addr()?;
            if family.includes(&addr.ip()) {
                addrs.push(addr);
            }
        }
        Ok(addrs)
    }

    fn link_add_veth(&self, name: &str, peer: &str, mtu: u32) -> Result<()> {
        // the peer goes to the namespace of this process' main thread
        let host_pid = std::process::id().to_string();
        let mtu = mtu.to_string();
        self.exec(&args([
            "link", "add", name, "mtu", mtu.as_str(), "type", "veth", "peer", "name", peer, "mtu",
            mtu.as_str(), "netns", host_pid.as_str(),
        ]))?;
        Ok(())
    }

    fn link_set_up(&self, name: &str) -> Result<()> {
        self.exec(&args(["link", "set", "dev", name, "up"]))?;
        Ok(())
    }

    fn link_set_hw_addr(&self, name: &str, addr: HardwareAddr) -> Result<()> {
        let addr = addr.to_string();
        self.exec(&args(["link", "set", "dev", name, "address", addr.as_str()]))?;
        Ok(())
    }

    fn neigh_add(&self, neigh: &Neigh) -> Result<()> {
        let ip = neigh.ip.to_string();
        let lladdr = neigh.lladdr.to_string();
        self.exec(&args([
            "neigh", "add", ip.as_str(), "lladdr", lladdr.as_str(), "dev", neigh.dev.as_str(),
            "nud", "permanent",
        ]))?;
        Ok(())
    }

    fn route_list(&self, table: u32, family: IpFamily) -> Result<Vec<Route>> {
        let families: &[IpFamily] = match family {
            IpFamily::All => &[IpFamily::V4, IpFamily::V6],
            IpFamily::V4 => &[IpFamily::V4],
            IpFamily::V6 => &[IpFamily::V6],
        };

        let mut routes = Vec::new();
        for &family in families {
            let mut cmd = family_args(family);
            cmd.extend(args(["-j", "route", "show", "table", table.to_string().as_str()]));
            let listed: Vec<JsonRoute> = self.query(&cmd)?;
            for route in listed.into_iter().filter(JsonRoute::is_unicast) {
                routes.push(route.into_route(family, table)?);
            }
        }
        Ok(routes)
    }

    fn route_get(&self, dst: IpAddr) -> Result<Vec<Route>> {
        let family = IpFamily::of(&dst);
        let listed: Vec<JsonRoute> = self.query(&args(["-j", "route", "get", dst.to_string().as_str()]))?;
        listed
            .into_iter()
            .map(|r| r.into_route(family, crate::utils::MAIN_TABLE))
            .collect()
    }

    fn route_add(&self, route: &Route) -> Result<()> {
        self.exec(&route_args("add", route))?;
        Ok(())
    }

    fn route_del(&self, route: &Route) -> Result<()> {
        self.exec(&route_args("del", route))?;
        Ok(())
    }

    fn rule_add(&self, rule: &Rule) -> Result<()> {
        self.exec(&rule_args(rule))?;
        Ok(())
    }
}

fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn family_args(family: IpFamily) -> Vec<String> {
    family.flag().map(|f| vec![f.to_string()]).unwrap_or_default()
}

/// Render `ip route add|del` arguments for a route.
pub(crate) fn route_args(verb: &str, route: &Route) -> Vec<String> {
    let mut cmd = family_args(route.family);
    cmd.extend(args(["route", verb, route.destination().as_str()]));

    if route.nexthops.is_empty() {
        if let Some(gw) = route.gateway {
            cmd.extend(["via".to_string(), gw.to_string()]);
        }
        if let Some(dev) = &route.dev {
            cmd.extend(["dev".to_string(), dev.clone()]);
        }
    }

    cmd.extend(["table".to_string(), route.table.to_string()]);
    if let Some(proto) = &route.protocol {
        cmd.extend(["proto".to_string(), proto.clone()]);
    }
    if let Some(metric) = route.metric {
        cmd.extend(["metric".to_string(), metric.to_string()]);
    }
    if verb == "add" {
        cmd.extend(["scope".to_string(), route.scope.as_str().to_string()]);
        if let Some(src) = route.prefsrc {
            cmd.extend(["src".to_string(), src.to_string()]);
        }
    }

    for nh in &route.nexthops {
        cmd.push("nexthop".to_string());
        if let Some(gw) = nh.gateway {
            cmd.extend(["via".to_string(), gw.to_string()]);
        }
        if let Some(dev) = &nh.dev {
            cmd.extend(["dev".to_string(), dev.clone()]);
        }
        if let Some(weight) = nh.weight {
            cmd.extend(["weight".to_string(), weight.to_string()]);
        }
    }
    cmd
}

/// Render `ip rule add` arguments for a rule.
pub(crate) fn rule_args(rule: &Rule) -> Vec<String> {
    let mut cmd = family_args(rule.family());
    let (dir, net) = match rule.selector {
        RuleSelector::From(net) => ("from", net),
        RuleSelector::To(net) => ("to", net),
    };
    cmd.extend(args([
        "rule",
        "add",
        dir,
        net.to_string().as_str(),
        "table",
        rule.table.to_string().as_str(),
    ]));
    cmd
}

fn parse_json<T: for<'de> Deserialize<'de>>(stdout: &[u8]) -> Result<Vec<T>> {
    let trimmed = String::from_utf8_lossy(stdout);
    if trimmed.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(trimmed.trim())?)
}

fn parse_ip(raw: &str) -> Result<IpAddr> {
    raw.parse()
        .map_err(|_| VethError::Config(format!("unexpected address {:?} in ip output", raw)))
}

#[derive(Debug, Deserialize)]
struct JsonLink {
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    mtu: u32,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    link_type: Option<String>,
    #[serde(default)]
    addr_info: Vec<JsonAddr>,
}

impl JsonLink {
    fn into_link(self) -> Result<Link> {
        let address = match (self.link_type.as_deref(), self.address.as_deref()) {
            (Some("ether"), Some(mac)) | (None, Some(mac)) => mac.parse().ok(),
            _ => None,
        };
        Ok(Link {
            up: self.flags.iter().any(|f| f == "UP"),
            name: self.ifname,
            mtu: self.mtu,
            address,
        })
    }
}

#[derive(Debug, Deserialize)]
struct JsonAddr {
    local: String,
    prefixlen: u8,
    #[serde(default)]
    scope: Option<String>,
}

impl JsonAddr {
    fn into_addr(self) -> Result<Addr> {
        let ip = parse_ip(&self.local)?;
        let net = IpNetwork::new(ip, self.prefixlen).map_err(|e| {
            VethError::Config(format!("unexpected prefix {}/{}: {}", self.local, self.prefixlen, e))
        })?;
        let scope = match self.scope.as_deref() {
            Some(s) => s.parse()?,
            None => Scope::Universe,
        };
        Ok(Addr::new(net, scope))
    }
}

#[derive(Debug, Deserialize)]
struct JsonRoute {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    dst: String,
    #[serde(default)]
    gateway: Option<String>,
    #[serde(default)]
    dev: Option<String>,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    metric: Option<u32>,
    #[serde(default)]
    prefsrc: Option<String>,
    #[serde(default)]
    nexthops: Vec<JsonNextHop>,
}

#[derive(Debug, Deserialize)]
struct JsonNextHop {
    #[serde(default)]
    gateway: Option<String>,
    #[serde(default)]
    dev: Option<String>,
    #[serde(default)]
    weight: Option<u32>,
}

impl JsonRoute {
    fn is_unicast(&self) -> bool {
        self.kind.as_deref().map_or(true, |k| k == "unicast")
    }

    fn into_route(self, family: IpFamily, table: u32) -> Result<Route> {
        let dst = match self.dst.as_str() {
            "default" => None,
            raw if raw.contains('/') => Some(raw.parse::<IpNetwork>().map_err(|e| {
                VethError::Config(format!("unexpected destination {:?}: {}", raw, e))
            })?),
            raw => Some(IpNetwork::from(parse_ip(raw)?)),
        };

        let nexthops = self
            .nexthops
            .into_iter()
            .map(|nh| {
                Ok(NextHop {
                    gateway: nh.gateway.as_deref().map(parse_ip).transpose()?,
                    dev: nh.dev,
                    weight: nh.weight,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Route {
            family,
            dst,
            gateway: self.gateway.as_deref().map(parse_ip).transpose()?,
            dev: self.dev,
            table,
            scope: match self.scope.as_deref() {
                Some(s) => s.parse()?,
                None => Scope::Universe,
            },
            protocol: self.protocol,
            metric: self.metric,
            prefsrc: self.prefsrc.as_deref().map(parse_ip).transpose()?,
            nexthops,
        })
    }
}
