#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;
use std::thread;

use tempfile::{NamedTempFile, TempDir};
use veth_cni::config::NetConf;
use veth_cni::error::{Result, VethError};
use veth_cni::ip::{Addr, HardwareAddr, Link, Neigh, Netlink, Route, Rule, Scope};
use veth_cni::netns::NetNs;
use veth_cni::networking::Sysctl;
use veth_cni::types::{CmdArgs, IpFamily};

/// Key of the namespace the test process starts in
pub const HOST: &str = "host";

thread_local! {
    static CURRENT: RefCell<String> = RefCell::new(HOST.to_string());
}

fn current() -> String {
    CURRENT.with(|c| c.borrow().clone())
}

#[derive(Debug, Default)]
pub struct NsState {
    pub links: BTreeMap<String, Link>,
    pub addrs: HashMap<String, Vec<Addr>>,
    pub routes: Vec<Route>,
    pub rules: Vec<Rule>,
    pub neighs: Vec<Neigh>,
}

/// In-memory kernel keyed by namespace path.
///
/// Like the real thing, operations apply to the namespace of the calling
/// thread, and `in_netns` switches on a dedicated thread.
#[derive(Debug, Default)]
pub struct FakeNetlink {
    namespaces: Mutex<HashMap<String, NsState>>,
    prefsrc: Mutex<HashMap<IpFamily, IpAddr>>,
    failing_addrs: Mutex<HashSet<String>>,
    next_index: Mutex<u8>,
}

impl FakeNetlink {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_ns<T>(&self, ns: &str, f: impl FnOnce(&mut NsState) -> T) -> T {
        let mut namespaces = self.namespaces.lock().unwrap();
        f(namespaces.entry(ns.to_string()).or_default())
    }

    fn with_current<T>(&self, f: impl FnOnce(&mut NsState) -> T) -> T {
        self.with_ns(&current(), f)
    }

    fn next_mac(&self) -> HardwareAddr {
        let mut index = self.next_index.lock().unwrap();
        *index += 1;
        HardwareAddr([0x02, 0x42, 0, 0, 0, *index])
    }

    pub fn add_link(&self, ns: &str, name: &str) -> HardwareAddr {
        let mac = self.next_mac();
        self.with_ns(ns, |state| {
            state.links.insert(
                name.to_string(),
                Link {
                    name: name.to_string(),
                    mtu: 1500,
                    address: Some(mac),
                    up: true,
                },
            );
        });
        mac
    }

    pub fn add_addr(&self, ns: &str, link: &str, cidr: &str) {
        let addr = Addr::new(cidr.parse().unwrap(), Scope::Universe);
        self.with_ns(ns, |state| {
            state.addrs.entry(link.to_string()).or_default().push(addr)
        });
    }

    pub fn add_route(&self, ns: &str, route: Route) {
        self.with_ns(ns, |state| state.routes.push(route));
    }

    /// Preferred source reported by `route_get` for a family.
    pub fn set_prefsrc(&self, ip: IpAddr) {
        self.prefsrc
            .lock()
            .unwrap()
            .insert(IpFamily::of(&ip), ip);
    }

    /// Makes every address listing of `link` fail like an unreadable device.
    pub fn fail_addr_list(&self, link: &str) {
        self.failing_addrs.lock().unwrap().insert(link.to_string());
    }

    /// Strips the hardware address of a link, as seen on point-to-point devices.
    pub fn clear_hw_addr(&self, ns: &str, link: &str) {
        self.with_ns(ns, |state| {
            if let Some(link) = state.links.get_mut(link) {
                link.address = None;
            }
        });
    }

    pub fn link(&self, ns: &str, name: &str) -> Option<Link> {
        self.with_ns(ns, |state| state.links.get(name).cloned())
    }

    pub fn links_named(&self, ns: &str, name: &str) -> usize {
        self.with_ns(ns, |state| state.links.keys().filter(|n| *n == name).count())
    }

    pub fn routes(&self, ns: &str, table: u32) -> Vec<Route> {
        self.with_ns(ns, |state| {
            state
                .routes
                .iter()
                .filter(|r| r.table == table)
                .cloned()
                .collect()
        })
    }

    pub fn rules(&self, ns: &str) -> Vec<String> {
        self.with_ns(ns, |state| state.rules.iter().map(ToString::to_string).collect())
    }

    pub fn neighbors(&self, ns: &str) -> Vec<Neigh> {
        self.with_ns(ns, |state| state.neighs.clone())
    }

    fn require_link(state: &NsState, name: &str) -> Result<()> {
        if state.links.contains_key(name) {
            Ok(())
        } else {
            Err(VethError::LinkNotFound(name.to_string()))
        }
    }
}

impl Netlink for FakeNetlink {
    fn in_netns<T, F>(&self, netns: &NetNs, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send,
        T: Send,
    {
        let key = ns_key(netns.path());
        thread::scope(|scope| {
            scope
                .spawn(move || {
                    CURRENT.with(|c| *c.borrow_mut() = key);
                    f()
                })
                .join()
                .unwrap()
        })
    }

    fn link_by_name(&self, name: &str) -> Result<Link> {
        self.with_current(|state| {
            state
                .links
                .get(name)
                .cloned()
                .ok_or_else(|| VethError::LinkNotFound(name.to_string()))
        })
    }

    fn link_list(&self) -> Result<Vec<Link>> {
        self.with_current(|state| Ok(state.links.values().cloned().collect()))
    }

    fn addr_list(&self, link: &str, family: IpFamily) -> Result<Vec<Addr>> {
        if self.failing_addrs.lock().unwrap().contains(link) {
            return Err(VethError::Kernel {
                cmd: format!("ip -j addr show dev {}", link),
                stderr: "Cannot send dump request: Operation not permitted".to_string(),
            });
        }
        self.with_current(|state| {
            Self::require_link(state, link)?;
            Ok(state
                .addrs
                .get(link)
                .into_iter()
                .flatten()
                .filter(|a| family.includes(&a.ip()))
                .copied()
                .collect())
        })
    }

    fn link_add_veth(&self, name: &str, peer: &str, mtu: u32) -> Result<()> {
        let here = current();
        let exists = self.with_ns(&here, |s| s.links.contains_key(name))
            || self.with_ns(HOST, |s| s.links.contains_key(peer));
        if exists {
            return Err(VethError::AlreadyExists(format!("link {}", name)));
        }

        for (ns, link) in [(here.as_str(), name), (HOST, peer)] {
            let mac = self.next_mac();
            self.with_ns(ns, |state| {
                state.links.insert(
                    link.to_string(),
                    Link {
                        name: link.to_string(),
                        mtu,
                        address: Some(mac),
                        up: false,
                    },
                )
            });
        }
        Ok(())
    }

    fn link_set_up(&self, name: &str) -> Result<()> {
        self.with_current(|state| {
            let link = state
                .links
                .get_mut(name)
                .ok_or_else(|| VethError::LinkNotFound(name.to_string()))?;
            link.up = true;
            Ok(())
        })
    }

    fn link_set_hw_addr(&self, name: &str, addr: HardwareAddr) -> Result<()> {
        self.with_current(|state| {
            let link = state
                .links
                .get_mut(name)
                .ok_or_else(|| VethError::LinkNotFound(name.to_string()))?;
            link.address = Some(addr);
            Ok(())
        })
    }

    fn neigh_add(&self, neigh: &Neigh) -> Result<()> {
        self.with_current(|state| {
            Self::require_link(state, &neigh.dev)?;
            if state
                .neighs
                .iter()
                .any(|n| n.ip == neigh.ip && n.dev == neigh.dev)
            {
                return Err(VethError::AlreadyExists(format!("neighbor {}", neigh.ip)));
            }
            state.neighs.push(neigh.clone());
            Ok(())
        })
    }

    fn route_list(&self, table: u32, family: IpFamily) -> Result<Vec<Route>> {
        self.with_current(|state| {
            Ok(state
                .routes
                .iter()
                .filter(|r| r.table == table)
                .filter(|r| family == IpFamily::All || r.family == family)
                .cloned()
                .collect())
        })
    }

    fn route_get(&self, dst: IpAddr) -> Result<Vec<Route>> {
        let prefsrc = self.prefsrc.lock().unwrap().get(&IpFamily::of(&dst)).copied();
        Ok(prefsrc
            .map(|src| {
                let mut route = Route::new(dst.into(), "eth0", 254, Scope::Universe);
                route.prefsrc = Some(src);
                route
            })
            .into_iter()
            .collect())
    }

    fn route_add(&self, route: &Route) -> Result<()> {
        self.with_current(|state| {
            if let Some(dev) = &route.dev {
                Self::require_link(state, dev)?;
            }
            if state.routes.iter().any(|r| r.same_identity(route)) {
                return Err(VethError::AlreadyExists(format!("route {}", route)));
            }
            state.routes.push(route.clone());
            Ok(())
        })
    }

    fn route_del(&self, route: &Route) -> Result<()> {
        self.with_current(|state| {
            let position = state
                .routes
                .iter()
                .position(|r| r.same_identity(route))
                .ok_or_else(|| VethError::Kernel {
                    cmd: format!("ip route del {}", route),
                    stderr: "RTNETLINK answers: No such process".to_string(),
                })?;
            state.routes.remove(position);
            Ok(())
        })
    }

    fn rule_add(&self, rule: &Rule) -> Result<()> {
        self.with_current(|state| {
            if state.rules.contains(rule) {
                return Err(VethError::AlreadyExists(format!("rule {}", rule)));
            }
            state.rules.push(*rule);
            Ok(())
        })
    }
}

pub fn ns_key(path: &Path) -> String {
    path.display().to_string()
}

/// A pod namespace handle backed by a temporary file.
pub struct Pod {
    pub file: NamedTempFile,
    pub netns: NetNs,
}

impl Pod {
    pub fn new() -> Self {
        let file = NamedTempFile::new().unwrap();
        let netns = NetNs::open(file.path()).unwrap();
        Self { file, netns }
    }

    pub fn key(&self) -> String {
        ns_key(self.netns.path())
    }
}

/// A throw-away sysctl tree with the given per-device entries.
pub fn sysctl_tree(devices: &[&str]) -> (TempDir, Sysctl) {
    let dir = TempDir::new().unwrap();
    for device in devices {
        for (key, value) in [
            (format!("net/ipv4/conf/{}/rp_filter", device), "1"),
            (format!("net/ipv6/conf/{}/disable_ipv6", device), "1"),
        ] {
            let path = dir.path().join(key);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, value).unwrap();
        }
    }
    let sysctl = Sysctl::new(dir.path());
    (dir, sysctl)
}

pub fn net_conf(prev_ips: &[&str], extra: &str) -> NetConf {
    let ips = prev_ips
        .iter()
        .map(|ip| format!(r#"{{"address":"{}","interface":0}}"#, ip))
        .collect::<Vec<_>>()
        .join(",");
    let raw = format!(
        r#"{{"cniVersion":"1.0.0","name":"macvlan-veth","type":"veth",
            "prevResult":{{"cniVersion":"1.0.0","interfaces":[{{"name":"net1"}}],"ips":[{}]}}{}}}"#,
        ips, extra
    );
    NetConf::parse(raw.as_bytes()).unwrap()
}

pub fn cmd_args(pod: &Pod, ifname: &str) -> CmdArgs {
    CmdArgs {
        container_id: "4f3c2b1a0e9d8c7b6a5f".to_string(),
        netns: pod.key(),
        ifname: ifname.to_string(),
        args: HashMap::new(),
        path: "/opt/cni/bin".to_string(),
        stdin_data: Vec::new(),
    }
}
