//! Kernel-facing surface: links, addresses, routes, rules and neighbors.

mod iproute2;

pub use iproute2::IpRoute2;

use ipnetwork::IpNetwork;
use itertools::Itertools;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::{Result, VethError};
use crate::netns::NetNs;
use crate::types::IpFamily;

/// A 6-byte Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HardwareAddr(pub [u8; 6]);

impl FromStr for HardwareAddr {
    type Err = VethError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || VethError::HardwareAddr(s.to_string());
        let mut octets = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(HardwareAddr(octets))
    }
}

impl fmt::Display for HardwareAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.iter().map(|b| format!("{:02x}", b)).join(":"))
    }
}

/// Route and address scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Scope {
    #[default]
    Universe,
    Site,
    Link,
    Host,
    Nowhere,
}

impl Scope {
    /// Keyword understood by iproute2.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Universe => "global",
            Scope::Site => "site",
            Scope::Link => "link",
            Scope::Host => "host",
            Scope::Nowhere => "nowhere",
        }
    }
}

impl FromStr for Scope {
    type Err = VethError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "global" | "universe" | "0" => Ok(Scope::Universe),
            "site" | "200" => Ok(Scope::Site),
            "link" | "253" => Ok(Scope::Link),
            "host" | "254" => Ok(Scope::Host),
            "nowhere" | "255" => Ok(Scope::Nowhere),
            other => Err(VethError::Config(format!("unknown scope {:?}", other))),
        }
    }
}

/// A link as seen in the current namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    pub mtu: u32,
    pub address: Option<HardwareAddr>,
    pub up: bool,
}

/// An address bound to an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Addr {
    pub net: IpNetwork,
    pub scope: Scope,
}

impl Addr {
    pub fn new(net: IpNetwork, scope: Scope) -> Self {
        Self { net, scope }
    }

    pub fn ip(&self) -> IpAddr {
        self.net.ip()
    }

    /// The address as a /32 or /128 selector.
    pub fn host(&self) -> IpNetwork {
        IpNetwork::from(self.net.ip())
    }

    /// Multicast and link-local addresses never take part in wiring.
    pub fn is_wireable(&self) -> bool {
        match self.net.ip() {
            IpAddr::V4(v4) => !v4.is_multicast() && !v4.is_link_local(),
            IpAddr::V6(v6) => !v6.is_multicast() && (v6.segments()[0] & 0xffc0) != 0xfe80,
        }
    }
}

/// One path of a multipath route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextHop {
    pub gateway: Option<IpAddr>,
    pub dev: Option<String>,
    pub weight: Option<u32>,
}

/// A unicast route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub family: IpFamily,
    /// `None` is the default route
    pub dst: Option<IpNetwork>,
    pub gateway: Option<IpAddr>,
    pub dev: Option<String>,
    pub table: u32,
    pub scope: Scope,
    pub protocol: Option<String>,
    pub metric: Option<u32>,
    pub prefsrc: Option<IpAddr>,
    pub nexthops: Vec<NextHop>,
}

impl Route {
    /// A plain route to `dst` through `dev`.
    pub fn new(dst: IpNetwork, dev: &str, table: u32, scope: Scope) -> Self {
        Self {
            family: IpFamily::of(&dst.ip()),
            dst: Some(dst),
            gateway: None,
            dev: Some(dev.to_string()),
            table,
            scope,
            protocol: None,
            metric: None,
            prefsrc: None,
            nexthops: Vec::new(),
        }
    }

    /// Whether the route leaves through `dev`, directly or via one of its paths.
    pub fn uses_link(&self, dev: &str) -> bool {
        self.dev.as_deref() == Some(dev)
            || self.nexthops.iter().any(|nh| nh.dev.as_deref() == Some(dev))
    }

    pub fn is_default(&self) -> bool {
        self.dst.is_none()
    }

    /// IPv6 link-local subnet route, which is never relocated.
    pub fn is_ipv6_link_local(&self) -> bool {
        self.dst.map_or(false, |d| d.to_string() == "fe80::/64")
    }

    /// Destination in iproute2 notation.
    pub fn destination(&self) -> String {
        self.dst
            .map_or_else(|| "default".to_string(), |d| d.to_string())
    }

    /// Destination, link and table uniquely identify a route here.
    pub fn same_identity(&self, other: &Route) -> bool {
        self.family == other.family
            && self.dst == other.dst
            && self.dev == other.dev
            && self.table == other.table
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.destination())?;
        if let Some(gw) = self.gateway {
            write!(f, " via {}", gw)?;
        }
        if let Some(dev) = &self.dev {
            write!(f, " dev {}", dev)?;
        }
        for nh in &self.nexthops {
            write!(f, " nexthop")?;
            if let Some(gw) = nh.gateway {
                write!(f, " via {}", gw)?;
            }
            if let Some(dev) = &nh.dev {
                write!(f, " dev {}", dev)?;
            }
        }
        write!(f, " table {} scope {}", self.table, self.scope.as_str())
    }
}

/// Which side of a packet a policy rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSelector {
    From(IpNetwork),
    To(IpNetwork),
}

/// A routing policy rule directing matching lookups to `table`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    pub selector: RuleSelector,
    pub table: u32,
}

impl Rule {
    pub fn family(&self) -> IpFamily {
        match self.selector {
            RuleSelector::From(net) | RuleSelector::To(net) => IpFamily::of(&net.ip()),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.selector {
            RuleSelector::From(net) => write!(f, "from {} lookup {}", net, self.table),
            RuleSelector::To(net) => write!(f, "to {} lookup {}", net, self.table),
        }
    }
}

/// A permanent neighbor entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neigh {
    pub ip: IpAddr,
    pub lladdr: HardwareAddr,
    pub dev: String,
}

/// Kernel operations, always applied to the namespace of the calling thread.
///
/// Create operations report [`VethError::AlreadyExists`] when the object is
/// present; lookups of a missing link report [`VethError::LinkNotFound`].
pub trait Netlink: Sync {
    /// Run `f` with the calling context switched into `netns`.
    fn in_netns<T, F>(&self, netns: &NetNs, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send,
        T: Send;

    fn link_by_name(&self, name: &str) -> Result<Link>;

    fn link_list(&self) -> Result<Vec<Link>>;

    /// Addresses of `link` restricted to `family`.
    fn addr_list(&self, link: &str, family: IpFamily) -> Result<Vec<Addr>>;

    /// Create a veth pair: `name` stays here, `peer` lands in the host namespace.
    fn link_add_veth(&self, name: &str, peer: &str, mtu: u32) -> Result<()>;

    fn link_set_up(&self, name: &str) -> Result<()>;

    fn link_set_hw_addr(&self, name: &str, addr: HardwareAddr) -> Result<()>;

    fn neigh_add(&self, neigh: &Neigh) -> Result<()>;

    fn route_list(&self, table: u32, family: IpFamily) -> Result<Vec<Route>>;

    /// The route the kernel would use to reach `dst`.
    fn route_get(&self, dst: IpAddr) -> Result<Vec<Route>>;

    fn route_add(&self, route: &Route) -> Result<()>;

    fn route_del(&self, route: &Route) -> Result<()>;

    fn rule_add(&self, rule: &Rule) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_addr_parsing() {
        let mac: HardwareAddr = "0a:1b:0A:06:00:05".parse().unwrap();
        assert_eq!(mac, HardwareAddr([0x0a, 0x1b, 0x0a, 0x06, 0x00, 0x05]));
        assert_eq!(mac.to_string(), "0a:1b:0a:06:00:05");
        assert!("0a-1b-0a-06-00-05".parse::<HardwareAddr>().is_ok());
        assert!("0a:1b:0a:06:00".parse::<HardwareAddr>().is_err());
        assert!("0a:1b:0a:06:00:05:07".parse::<HardwareAddr>().is_err());
        assert!("0a:1b:0a:06:0:005".parse::<HardwareAddr>().is_err());
        assert!("zz:1b:0a:06:00:05".parse::<HardwareAddr>().is_err());
    }

    #[test]
    fn wireable_addresses() {
        let addr = |s: &str| Addr::new(s.parse().unwrap(), Scope::Universe);
        assert!(addr("10.6.0.5/24").is_wireable());
        assert!(addr("fd00:6::5/64").is_wireable());
        assert!(!addr("169.254.1.1/16").is_wireable());
        assert!(!addr("fe80::1/64").is_wireable());
        assert!(!addr("224.0.0.1/32").is_wireable());
        assert!(!addr("ff02::1/128").is_wireable());
    }

    #[test]
    fn host_selector_has_full_mask() {
        let v4 = Addr::new("10.6.0.5/24".parse().unwrap(), Scope::Universe);
        assert_eq!(v4.host().to_string(), "10.6.0.5/32");
        let v6 = Addr::new("fd00:6::5/64".parse().unwrap(), Scope::Universe);
        assert_eq!(v6.host().to_string(), "fd00:6::5/128");
    }

    #[test]
    fn route_link_matching() {
        let mut route = Route::new("10.6.0.0/24".parse().unwrap(), "net1", 254, Scope::Link);
        assert!(route.uses_link("net1"));
        assert!(!route.uses_link("eth0"));

        route.dev = None;
        route.dst = None;
        route.family = IpFamily::V6;
        route.nexthops = vec![
            NextHop { gateway: Some("fe80::1".parse().unwrap()), dev: Some("eth0".into()), weight: Some(1) },
            NextHop { gateway: Some("fe80::2".parse().unwrap()), dev: Some("net1".into()), weight: Some(1) },
        ];
        assert!(route.uses_link("net1"));
        assert!(route.is_default());
        assert_eq!(route.destination(), "default");
    }

    #[test]
    fn link_local_route_detection() {
        let route = Route::new("fe80::/64".parse().unwrap(), "net1", 254, Scope::Universe);
        assert!(route.is_ipv6_link_local());
        let route = Route::new("fd00::/64".parse().unwrap(), "net1", 254, Scope::Universe);
        assert!(!route.is_ipv6_link_local());
    }
}
