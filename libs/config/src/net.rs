//! Local interface address lookup, the default presence address
use std::net::IpAddr;

use pnet::ipnetwork::IpNetwork;
use tracing::{debug, trace};

/// find the first address of an 'up', non-loopback interface.
///
/// With `ipv6` false this is the first IPv4 address that is not loopback,
/// otherwise the first IPv6 address that is neither loopback nor link-local.
pub fn local_ip(ipv6: bool) -> Option<IpAddr> {
    let found = pnet::datalink::interfaces()
        .into_iter()
        .filter(|e| e.is_up() && !e.is_loopback() && !e.ips.is_empty())
        .find_map(|e| {
            trace!(name = %e.name, ips = ?e.ips, "checking interface");
            e.ips.iter().map(IpNetwork::ip).find(|ip| usable(*ip, ipv6))
        });
    debug!(?found, ipv6, "local address lookup");
    found
}

fn usable(ip: IpAddr, ipv6: bool) -> bool {
    match ip {
        IpAddr::V4(ip) => !ipv6 && !ip.is_loopback() && !ip.is_unspecified(),
        // fe80::/10
        IpAddr::V6(ip) => {
            ipv6 && !ip.is_loopback()
                && !ip.is_unspecified()
                && (ip.segments()[0] & 0xffc0) != 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;

    #[test]
    fn test_usable_v4() {
        assert!(usable(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), false));
        assert!(!usable(IpAddr::V4(Ipv4Addr::LOCALHOST), false));
        assert!(!usable(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), true));
    }

    #[test]
    fn test_usable_v6() {
        let global: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let link_local: Ipv6Addr = "fe80::1".parse().unwrap();
        assert!(usable(IpAddr::V6(global), true));
        assert!(!usable(IpAddr::V6(link_local), true));
        assert!(!usable(IpAddr::V6(Ipv6Addr::LOCALHOST), true));
        assert!(!usable(IpAddr::V6(global), false));
    }
}
