use std::net::IpAddr;
use tracing::{debug, error};

use crate::error::{tolerate_exists, Result, VethError};
use crate::ip::{HardwareAddr, Neigh, Netlink};
use crate::netns::NetNs;
use crate::types::IpFamily;
use crate::POD_VETH_NAME;

/// Build `prefix:xx:xx:xx:xx` from the low 32 bits of `ip`.
///
/// The suffix is always eight hex digits, so addresses with leading zero
/// bytes still yield four octets.
pub fn derive_hw_addr(prefix: &str, ip: IpAddr) -> Result<HardwareAddr> {
    let low = match ip {
        IpAddr::V4(v4) => u32::from(v4),
        IpAddr::V6(v6) => u128::from(v6) as u32,
    };
    let hex = format!("{:08x}", low);
    let suffix = hex
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":");

    let literal = format!("{}:{}", prefix.replace('-', ":"), suffix);
    literal.parse()
}

/// Rewrite the hardware address of `iface` inside `netns` from its first address.
pub fn override_hw_address<N: Netlink>(
    netlink: &N,
    netns: &NetNs,
    prefix: &str,
    iface: &str,
) -> Result<HardwareAddr> {
    let addrs = super::addresses_of(netlink, netns, iface, IpFamily::All)?;
    let first = addrs.first().ok_or_else(|| {
        VethError::AddressDiscovery(format!("interface {} has no address", iface))
    })?;

    let hw_addr = derive_hw_addr(prefix, first.ip())?;
    netlink
        .in_netns(netns, || netlink.link_set_hw_addr(iface, hw_addr))
        .map_err(|e| {
            error!(interface = iface, hardware_address = %hw_addr, "failed to override hardware address");
            e.wrap(format!("failed to set hardware address {} on {}", hw_addr, iface))
        })?;

    Ok(hw_addr)
}

/// Hardware addresses of the host side and the pod side of the veth pair.
pub fn hw_address_pair<N: Netlink>(
    netlink: &N,
    netns: &NetNs,
    host_veth: &str,
) -> Result<(HardwareAddr, HardwareAddr)> {
    let host = netlink
        .link_by_name(host_veth)?
        .address
        .ok_or_else(|| VethError::AddressDiscovery(format!("{} has no hardware address", host_veth)))?;

    let pod = netlink.in_netns(netns, || {
        netlink.link_by_name(POD_VETH_NAME)?.address.ok_or_else(|| {
            VethError::AddressDiscovery(format!("{} has no hardware address", POD_VETH_NAME))
        })
    })?;

    Ok((host, pod))
}

/// Install a permanent neighbor entry; an existing entry is fine.
pub fn add_neighbor<N: Netlink>(netlink: &N, dev: &str, ip: IpAddr, lladdr: HardwareAddr) -> Result<()> {
    let neigh = Neigh {
        ip,
        lladdr,
        dev: dev.to_string(),
    };
    debug!(%ip, %lladdr, dev, "add neighbor");
    tolerate_exists(netlink.neigh_add(&neigh))
        .map_err(|e| e.wrap(format!("failed to add neighbor {} lladdr {} dev {}", ip, lladdr, dev)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_uses_all_four_octets() {
        let mac = derive_hw_addr("0a:1b", "10.6.0.5".parse().unwrap()).unwrap();
        assert_eq!(mac.to_string(), "0a:1b:0a:06:00:05");
        let mac = derive_hw_addr("0a:1b", "192.168.1.200".parse().unwrap()).unwrap();
        assert_eq!(mac.to_string(), "0a:1b:c0:a8:01:c8");
    }

    #[test]
    fn ipv6_uses_low_32_bits() {
        let mac = derive_hw_addr("0a:1b", "fd00:6::a:b0c:d0e".parse().unwrap()).unwrap();
        assert_eq!(mac.to_string(), "0a:1b:0b:0c:0d:0e");
    }

    #[test]
    fn leading_zero_bytes_keep_fixed_width() {
        let mac = derive_hw_addr("0a:1b", "0.0.1.2".parse().unwrap()).unwrap();
        assert_eq!(mac.to_string(), "0a:1b:00:00:01:02");
        let mac = derive_hw_addr("0a:1b", "::ffff:0:1".parse().unwrap()).unwrap();
        assert_eq!(mac.to_string(), "0a:1b:00:00:00:01");
    }

    #[test]
    fn dash_prefix_is_accepted() {
        let mac = derive_hw_addr("0a-1b", "10.6.0.5".parse().unwrap()).unwrap();
        assert_eq!(mac.to_string(), "0a:1b:0a:06:00:05");
    }

    #[test]
    fn malformed_prefix_fails() {
        let err = derive_hw_addr("0a:1b:2c", "10.6.0.5".parse().unwrap()).unwrap_err();
        assert!(matches!(err, VethError::HardwareAddr(_)));
    }
}
