//! Local interface selection for address merging.

use std::{
    io,
    net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6},
    sync::Arc,
};

use async_std::task;
use nix::{ifaddrs::getifaddrs, net::if_::InterfaceFlags as IfFlags};

use crate::common::uaddr::{is_link_local, normalize_link_local};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceFlags {
    pub up: bool,
    pub loopback: bool,
    pub point_to_point: bool,
    pub multicast: bool,
}

/// One address of a local network interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub addr: IpAddr,
    /// IPv6 zone, zero if unknown
    pub scope_id: u32,
    pub netmask: IpAddr,
    pub flags: InterfaceFlags,
}

impl Interface {
    /// An up, multicast capable interface address
    pub fn new(name: impl Into<String>, addr: IpAddr, netmask: IpAddr) -> Self {
        Self {
            name: name.into(),
            addr,
            scope_id: 0,
            netmask,
            flags: InterfaceFlags {
                up: true,
                multicast: true,
                ..Default::default()
            },
        }
    }

    pub fn loopback(mut self) -> Self {
        self.flags.loopback = true;
        self.flags.multicast = false;
        self
    }

    pub fn point_to_point(mut self) -> Self {
        self.flags.point_to_point = true;
        self
    }

    pub fn down(mut self) -> Self {
        self.flags.up = false;
        self
    }

    pub fn with_scope_id(mut self, scope_id: u32) -> Self {
        self.scope_id = scope_id;
        self
    }

    fn is_plain(&self) -> bool {
        !self.flags.loopback && !self.flags.point_to_point
    }
}

/// Source of local interface addresses
pub trait NetworkInterfaces: Send + Sync {
    /// May block
    fn enumerate(&self) -> io::Result<Vec<Interface>>;
}

/// Interfaces of this host, from `getifaddrs(3)`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl NetworkInterfaces for SystemInterfaces {
    fn enumerate(&self) -> io::Result<Vec<Interface>> {
        let mut interfaces = Vec::new();
        for ifa in getifaddrs()? {
            let (Some(address), Some(netmask)) = (ifa.address, ifa.netmask) else {
                continue;
            };
            let (addr, scope_id, netmask) = if let (Some(sin), Some(mask)) =
                (address.as_sockaddr_in(), netmask.as_sockaddr_in())
            {
                (IpAddr::V4(sin.ip()), 0, IpAddr::V4(mask.ip()))
            } else if let (Some(sin6), Some(mask)) =
                (address.as_sockaddr_in6(), netmask.as_sockaddr_in6())
            {
                (IpAddr::V6(sin6.ip()), sin6.scope_id(), IpAddr::V6(mask.ip()))
            } else {
                continue;
            };
            interfaces.push(Interface {
                name: ifa.interface_name,
                addr,
                scope_id,
                netmask,
                flags: InterfaceFlags {
                    up: ifa.flags.contains(IfFlags::IFF_UP),
                    loopback: ifa.flags.contains(IfFlags::IFF_LOOPBACK),
                    point_to_point: ifa.flags.contains(IfFlags::IFF_POINTOPOINT),
                    multicast: ifa.flags.contains(IfFlags::IFF_MULTICAST),
                },
            });
        }
        Ok(interfaces)
    }
}

/// A fixed interface list
#[derive(Debug, Default, Clone)]
pub struct StaticInterfaces(pub Vec<Interface>);

impl NetworkInterfaces for StaticInterfaces {
    fn enumerate(&self) -> io::Result<Vec<Interface>> {
        Ok(self.0.clone())
    }
}

/// Picks the local address a caller should use to reach this host.
#[derive(Clone)]
pub struct InterfaceResolver {
    interfaces: Arc<dyn NetworkInterfaces>,
    listen_addrs: Vec<IpAddr>,
}

impl InterfaceResolver {
    /// `listen_addrs` restricts non-loopback candidates, empty allows all.
    pub fn new(interfaces: Arc<dyn NetworkInterfaces>, listen_addrs: Vec<IpAddr>) -> Self {
        Self {
            interfaces,
            listen_addrs,
        }
    }

    /// Best interface for answering `caller`, which reached us through `hint`.
    pub async fn select_interface(&self, hint: SocketAddr, caller: SocketAddr) -> Option<Interface> {
        let interfaces = self.interfaces.clone();
        let list = match task::spawn_blocking(move || interfaces.enumerate()).await {
            Ok(list) => list,
            Err(err) => {
                log::warn!("Failed to enumerate interfaces: {}", err);
                return None;
            }
        };
        select(&list, hint, caller, &self.listen_addrs).cloned()
    }
}

fn listening_on(listen_addrs: &[IpAddr], addr: &IpAddr) -> bool {
    listen_addrs.is_empty()
        || listen_addrs
            .iter()
            .any(|l| l == addr || (l.is_unspecified() && l.is_ipv4() == addr.is_ipv4()))
}

fn same_subnet(a: &IpAddr, b: &IpAddr, mask: &IpAddr) -> bool {
    match (a, b, mask) {
        (IpAddr::V4(a), IpAddr::V4(b), IpAddr::V4(mask)) => {
            let mask = u32::from(*mask);
            u32::from(*a) & mask == u32::from(*b) & mask
        }
        (IpAddr::V6(a), IpAddr::V6(b), IpAddr::V6(mask)) => {
            let mask = u128::from(*mask);
            u128::from(*a) & mask == u128::from(*b) & mask
        }
        _ => false,
    }
}

fn scoped(addr: SocketAddr) -> Option<SocketAddrV6> {
    match addr {
        SocketAddr::V6(v6) => Some(normalize_link_local(v6)),
        SocketAddr::V4(_) => None,
    }
}

fn select<'a>(
    interfaces: &'a [Interface],
    hint: SocketAddr,
    caller: SocketAddr,
    listen_addrs: &[IpAddr],
) -> Option<&'a Interface> {
    let hint6 = scoped(hint);
    let caller6 = scoped(caller);
    let hint_ip = hint6.map_or(hint.ip(), |h| IpAddr::V6(*h.ip()));

    let mut fallback: Option<&Interface> = None;
    for ifa in interfaces {
        if !ifa.flags.up || ifa.addr.is_ipv4() != hint.is_ipv4() {
            continue;
        }
        if !ifa.flags.loopback && !listening_on(listen_addrs, &ifa.addr) {
            continue;
        }

        match (ifa.addr, hint6, caller6) {
            (IpAddr::V6(addr), Some(hint6), Some(caller6))
                if is_link_local(&addr)
                    && is_link_local(hint6.ip())
                    && is_link_local(caller6.ip()) =>
            {
                let ifa6 = normalize_link_local(SocketAddrV6::new(addr, 0, 0, ifa.scope_id));
                if ifa6.scope_id() == hint6.scope_id() {
                    return Some(ifa);
                }
            }
            _ => {
                let addr = match ifa.addr {
                    IpAddr::V6(addr) => IpAddr::V6(strip_embedded_scope(addr, ifa.scope_id)),
                    v4 => v4,
                };
                if same_subnet(&addr, &hint_ip, &ifa.netmask) {
                    return Some(ifa);
                }
            }
        }

        if fallback.map_or(true, |f| !f.is_plain() && ifa.is_plain()) {
            fallback = Some(ifa);
        }
    }
    fallback
}

fn strip_embedded_scope(addr: Ipv6Addr, scope_id: u32) -> Ipv6Addr {
    *normalize_link_local(SocketAddrV6::new(addr, 0, 0, scope_id)).ip()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl NetworkInterfaces for Failing {
        fn enumerate(&self) -> io::Result<Vec<Interface>> {
            Err(io::ErrorKind::PermissionDenied.into())
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn sa(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn host() -> Vec<Interface> {
        vec![
            Interface::new("lo", ip("127.0.0.1"), ip("255.0.0.0")).loopback(),
            Interface::new("tun0", ip("10.8.0.1"), ip("255.255.255.255")).point_to_point(),
            Interface::new("eth0", ip("192.168.1.1"), ip("255.255.255.0")),
            Interface::new("eth1", ip("172.16.0.1"), ip("255.255.0.0")),
            Interface::new("eth2", ip("10.1.0.1"), ip("255.255.0.0")).down(),
            Interface::new("lo", ip("::1"), ip("ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff")).loopback(),
            Interface::new("eth0", ip("fe80::1"), ip("ffff:ffff:ffff:ffff::")).with_scope_id(2),
            Interface::new("eth1", ip("fe80::2"), ip("ffff:ffff:ffff:ffff::")).with_scope_id(3),
            Interface::new("eth1", ip("2001:db8::1"), ip("ffff:ffff:ffff:ffff::")),
        ]
    }

    #[test]
    fn subnet_match() {
        let host = host();
        let caller = sa("172.16.40.2:800");
        let ifa = select(&host, caller, caller, &[]).unwrap();

        assert_eq!(ifa.name, "eth1");
    }

    #[test]
    fn fallback_prefers_plain_interface() {
        let host = host();
        let caller = sa("203.0.113.9:800");
        let ifa = select(&host, caller, caller, &[]).unwrap();

        assert_eq!(ifa.name, "eth0");
    }

    #[test]
    fn down_interfaces_are_skipped() {
        let host = host();
        let caller = sa("10.1.2.3:800");
        let ifa = select(&host, caller, caller, &[]).unwrap();

        assert_ne!(ifa.name, "eth2");
    }

    #[test]
    fn listen_addresses_restrict_candidates() {
        let host = host();
        let caller = sa("172.16.40.2:800");
        let ifa = select(&host, caller, caller, &[ip("192.168.1.1")]).unwrap();

        assert_eq!(ifa.name, "eth0");

        let ifa = select(&host, caller, caller, &[ip("192.0.2.1")]).unwrap();
        assert_eq!(ifa.name, "lo");
    }

    #[test]
    fn link_local_by_zone() {
        let host = host();
        let caller = sa("[fe80::99%3]:800");
        let ifa = select(&host, caller, caller, &[]).unwrap();

        assert_eq!(ifa.addr, ip("fe80::2"));
    }

    #[test]
    fn link_local_embedded_zone() {
        let host = host();
        let caller = sa("[fe80:2::99]:800");
        let ifa = select(&host, caller, caller, &[]).unwrap();

        assert_eq!(ifa.addr, ip("fe80::1"));
    }

    #[test]
    fn global_ipv6() {
        let host = host();
        let caller = sa("[2001:db8::77]:800");
        let ifa = select(&host, caller, caller, &[]).unwrap();

        assert_eq!(ifa.addr, ip("2001:db8::1"));
    }

    #[test]
    fn no_candidate_of_family() {
        let v4_only = vec![Interface::new("eth0", ip("192.168.1.1"), ip("255.255.255.0"))];
        let caller = sa("[2001:db8::77]:800");

        assert!(select(&v4_only, caller, caller, &[]).is_none());
    }

    #[async_std::test]
    async fn enumeration_failure() {
        let resolver = InterfaceResolver::new(Arc::new(Failing), vec![]);
        let caller = sa("192.168.1.50:800");

        assert!(resolver.select_interface(caller, caller).await.is_none());
    }

    #[async_std::test]
    async fn resolve_from_enumerator() {
        let resolver = InterfaceResolver::new(Arc::new(StaticInterfaces(host())), vec![]);
        let caller = sa("192.168.1.50:800");
        let ifa = resolver.select_interface(caller, caller).await.unwrap();

        assert_eq!(ifa.addr, ip("192.168.1.1"));
    }
}
