//! Local address discovery and host name resolution.

use crate::error::{Result, TransportError};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Limited broadcast, used when no subnet can be derived.
pub const LIMITED_BROADCAST: Ipv4Addr = Ipv4Addr::BROADCAST;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    pub fn other(self) -> Self {
        match self {
            IpFamily::V4 => IpFamily::V6,
            IpFamily::V6 => IpFamily::V4,
        }
    }

    /// Wildcard address of this family.
    pub fn any(self) -> IpAddr {
        match self {
            IpFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

/// Pick the best LAN IPv4 address: 192.168.x.x first, then 10.x.x.x,
/// then 172.x.x.x, then anything that is not loopback.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let ips = local_ip_address::list_afinet_netifas().ok()?;
    let candidates: Vec<Ipv4Addr> = ips
        .into_iter()
        .filter_map(|(_name, ip)| match ip {
            IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => Some(v4),
            _ => None,
        })
        .collect();
    pick_lan_ipv4(&candidates)
}

fn pick_lan_ipv4(candidates: &[Ipv4Addr]) -> Option<Ipv4Addr> {
    let rank = |ip: &Ipv4Addr| match ip.octets() {
        [192, 168, ..] => 0,
        [10, ..] => 1,
        [172, ..] => 2,
        _ => 3,
    };
    candidates.iter().copied().min_by_key(rank)
}

/// First non-loopback IPv6 address, if the host has one.
pub fn local_ipv6() -> Option<Ipv6Addr> {
    let ips = local_ip_address::list_afinet_netifas().ok()?;
    ips.into_iter().find_map(|(_name, ip)| match ip {
        IpAddr::V6(v6) if !v6.is_loopback() && !v6.is_unspecified() => Some(v6),
        _ => None,
    })
}

/// Default local address for outgoing traffic, falling back to loopback.
pub fn default_local_ip() -> IpAddr {
    local_ipv4()
        .map(IpAddr::V4)
        .or_else(|| local_ipv6().map(IpAddr::V6))
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// True when `ip` belongs to this host (loopback included).
pub fn is_local_ip(ip: &IpAddr) -> bool {
    if ip.is_loopback() {
        return true;
    }
    local_ip_address::list_afinet_netifas()
        .map(|ips| ips.iter().any(|(_, local)| local == ip))
        .unwrap_or(false)
}

/// Subnet-directed broadcast address assuming a /24 network.
pub fn ipv4_broadcast_for(ip: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c, _] = ip.octets();
    Ipv4Addr::new(a, b, c, 255)
}

/// Broadcast address of the preferred LAN interface, or 255.255.255.255.
pub fn ipv4_broadcast_address() -> Ipv4Addr {
    local_ipv4()
        .map(ipv4_broadcast_for)
        .unwrap_or(LIMITED_BROADCAST)
}

/// Resolve a host name or IP literal into a socket address.
///
/// IPv4 results are preferred when a name resolves to both families.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| TransportError::Resolve(host.to_string()))?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| TransportError::Resolve(host.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_lan_ipv4_order() {
        let ips = [
            Ipv4Addr::new(8, 8, 8, 8),
            Ipv4Addr::new(172, 16, 0, 4),
            Ipv4Addr::new(10, 0, 0, 2),
        ];
        assert_eq!(pick_lan_ipv4(&ips), Some(Ipv4Addr::new(10, 0, 0, 2)));

        let ips = [Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(192, 168, 1, 7)];
        assert_eq!(pick_lan_ipv4(&ips), Some(Ipv4Addr::new(192, 168, 1, 7)));

        assert_eq!(pick_lan_ipv4(&[]), None);
    }

    #[test]
    fn test_broadcast_for() {
        assert_eq!(
            ipv4_broadcast_for(Ipv4Addr::new(192, 168, 4, 20)),
            Ipv4Addr::new(192, 168, 4, 255)
        );
    }

    #[test]
    fn test_family_helpers() {
        let v4: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(IpFamily::of(&v4), IpFamily::V4);
        assert_eq!(IpFamily::of(&v4).other(), IpFamily::V6);
        assert_eq!(IpFamily::V6.any(), IpAddr::V6(Ipv6Addr::UNSPECIFIED));
        assert!(is_local_ip(&v4));
    }

    #[tokio::test]
    async fn test_resolve_literal_and_localhost() {
        let addr = resolve("127.0.0.1", 80).await.unwrap();
        assert_eq!(addr, "127.0.0.1:80".parse::<SocketAddr>().unwrap());

        let addr = resolve("[::1]", 81).await.unwrap();
        assert_eq!(addr, "[::1]:81".parse::<SocketAddr>().unwrap());

        let addr = resolve("localhost", 82).await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 82);
    }
}
