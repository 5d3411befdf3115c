//! Rewriting registered addresses from the vantage point of a caller.

use std::{
    fmt,
    net::{SocketAddr, TcpListener, UdpSocket},
    sync::Arc,
};

use async_std::task;

use crate::common::{
    netconfig::{NetworkConfig, TransportDescriptor},
    uaddr::{sockaddr_to_uaddr, uaddr_to_sockaddr, TransportAddress},
};

use super::interfaces::InterfaceResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeFailure {
    /// Unknown network id
    BadTransport,
    /// Registered address does not decode
    BadAddress,
    /// Caller and registration belong to different protocol families
    CrossFamily,
    /// No local interface to publish
    NoInterface,
}

impl fmt::Display for MergeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeFailure::BadTransport => write!(f, "unknown transport"),
            MergeFailure::BadAddress => write!(f, "bad registered address"),
            MergeFailure::CrossFamily => write!(f, "caller is of another protocol family"),
            MergeFailure::NoInterface => write!(f, "no usable interface"),
        }
    }
}

impl std::error::Error for MergeFailure {}

/// Tells whether a registered server still holds its address
pub trait BoundChecker: Send + Sync {
    fn is_bound(&self, transport: &TransportDescriptor, addr: &TransportAddress) -> bool;
}

/// Probes by binding the address: if the bind succeeds nobody is listening there.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketBoundChecker;

impl BoundChecker for SocketBoundChecker {
    fn is_bound(&self, transport: &TransportDescriptor, addr: &TransportAddress) -> bool {
        let TransportAddress::Inet(addr) = addr else {
            return true;
        };
        let probe = if transport.semantics.is_connectionless() {
            UdpSocket::bind(addr).map(drop)
        } else {
            TcpListener::bind(addr).map(drop)
        };
        match probe {
            Ok(()) => {
                log::debug!("{} {} is not bound", transport.netid, addr);
                false
            }
            Err(_) => true,
        }
    }
}

/// Never reports a server as gone
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeBound;

impl BoundChecker for AssumeBound {
    fn is_bound(&self, _transport: &TransportDescriptor, _addr: &TransportAddress) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct AddressMerger {
    netconfig: Arc<dyn NetworkConfig>,
    resolver: InterfaceResolver,
    bound: Arc<dyn BoundChecker>,
    check_bound: bool,
}

impl AddressMerger {
    pub fn new(
        netconfig: Arc<dyn NetworkConfig>,
        resolver: InterfaceResolver,
        bound: Arc<dyn BoundChecker>,
        check_bound: bool,
    ) -> Self {
        Self {
            netconfig,
            resolver,
            bound,
            check_bound,
        }
    }

    /// Probes off the executor, binding sockets blocks.
    async fn is_bound(&self, transport: TransportDescriptor, server: TransportAddress) -> bool {
        let bound = self.bound.clone();
        task::spawn_blocking(move || bound.is_bound(&transport, &server)).await
    }

    /// Address of the server registered at `server_uaddr` on `netid` as `caller` should use it.
    ///
    /// `hint` is the address the caller used to reach us. An empty string means the
    /// server is gone.
    pub async fn merge(
        &self,
        caller: &TransportAddress,
        server_uaddr: &str,
        hint: Option<&str>,
        netid: &str,
    ) -> Result<String, MergeFailure> {
        // No network location to adapt to
        let TransportAddress::Inet(caller_sa) = caller else {
            return Ok(server_uaddr.to_string());
        };
        if caller.is_wildcard() {
            return Ok(server_uaddr.to_string());
        }

        let transport = self
            .netconfig
            .resolve(netid)
            .ok_or(MergeFailure::BadTransport)?;
        if transport.family != caller.family() {
            return Err(MergeFailure::CrossFamily);
        }

        let server = uaddr_to_sockaddr(transport.family, server_uaddr)
            .map_err(|_| MergeFailure::BadAddress)?;
        let TransportAddress::Inet(server_sa) = server else {
            return Err(MergeFailure::BadAddress);
        };
        if self.check_bound && !self.is_bound(transport.clone(), server).await {
            return Ok(String::new());
        }

        let hint_sa = hint
            .and_then(|h| uaddr_to_sockaddr(transport.family, h).ok())
            .and_then(|h| match h {
                TransportAddress::Inet(sa) if sa.is_ipv4() == caller_sa.is_ipv4() => Some(sa),
                _ => None,
            })
            .unwrap_or(*caller_sa);

        let ifa = self
            .resolver
            .select_interface(hint_sa, *caller_sa)
            .await
            .ok_or(MergeFailure::NoInterface)?;

        let merged = TransportAddress::Inet(SocketAddr::new(ifa.addr, server_sa.port()));
        let uaddr = sockaddr_to_uaddr(&merged);
        log::debug!(
            "Merged {} on {} for {} via {}: {}",
            server_uaddr,
            netid,
            caller,
            ifa.name,
            uaddr
        );
        Ok(uaddr)
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;
    use crate::{
        common::netconfig::StaticNetconfig,
        server::interfaces::{Interface, StaticInterfaces},
    };

    struct Gone;

    impl BoundChecker for Gone {
        fn is_bound(&self, _transport: &TransportDescriptor, _addr: &TransportAddress) -> bool {
            false
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn caller(s: &str) -> TransportAddress {
        TransportAddress::Inet(s.parse().unwrap())
    }

    fn merger(bound: Arc<dyn BoundChecker>) -> AddressMerger {
        let interfaces = StaticInterfaces(vec![
            Interface::new("lo", ip("127.0.0.1"), ip("255.0.0.0")).loopback(),
            Interface::new("eth0", ip("192.168.1.1"), ip("255.255.255.0")),
            Interface::new("eth1", ip("10.20.0.1"), ip("255.255.0.0")),
            Interface::new("eth0", ip("2001:db8::1"), ip("ffff:ffff:ffff:ffff::")),
        ]);
        AddressMerger::new(
            Arc::new(StaticNetconfig::default()),
            InterfaceResolver::new(Arc::new(interfaces), vec![]),
            bound,
            true,
        )
    }

    #[async_std::test]
    async fn interface_ip_with_server_port() {
        let m = merger(Arc::new(AssumeBound));
        let merged = m
            .merge(&caller("192.168.1.50:700"), "10.0.0.5.0.111", None, "tcp")
            .await
            .unwrap();

        assert_eq!(merged, "192.168.1.1.0.111");
    }

    #[async_std::test]
    async fn wildcard_and_local_callers_get_registered_address() {
        let m = merger(Arc::new(Gone));
        for c in [
            caller("0.0.0.0:0"),
            caller("[::]:0"),
            TransportAddress::Local("/var/run/rpcbind.sock".into()),
        ] {
            for netid in ["tcp", "udp6", "nonsense"] {
                assert_eq!(
                    m.merge(&c, "garbage", Some("1.2.3.4.0.1"), netid).await,
                    Ok("garbage".to_string())
                );
            }
        }
    }

    #[async_std::test]
    async fn cross_family_never_merges() {
        let m = merger(Arc::new(AssumeBound));

        assert_eq!(
            m.merge(&caller("192.168.1.50:700"), "::.8.1", None, "tcp6").await,
            Err(MergeFailure::CrossFamily)
        );
        assert_eq!(
            m.merge(&caller("[2001:db8::7]:700"), "0.0.0.0.8.1", None, "udp").await,
            Err(MergeFailure::CrossFamily)
        );
    }

    #[async_std::test]
    async fn unknown_transport_and_bad_address() {
        let m = merger(Arc::new(AssumeBound));
        let c = caller("192.168.1.50:700");

        assert_eq!(
            m.merge(&c, "0.0.0.0.8.1", None, "ticotsord").await,
            Err(MergeFailure::BadTransport)
        );
        assert_eq!(
            m.merge(&c, "0.0.0.0.8", None, "tcp").await,
            Err(MergeFailure::BadAddress)
        );
    }

    #[async_std::test]
    async fn hint_selects_interface() {
        let m = merger(Arc::new(AssumeBound));
        let c = caller("192.168.1.50:700");

        assert_eq!(
            m.merge(&c, "0.0.0.0.8.1", Some("10.20.3.4.0.0"), "tcp").await,
            Ok("10.20.0.1.8.1".to_string())
        );
        // Unusable hints are ignored
        assert_eq!(
            m.merge(&c, "0.0.0.0.8.1", Some("bogus"), "tcp").await,
            Ok("192.168.1.1.8.1".to_string())
        );
    }

    #[async_std::test]
    async fn ipv6_caller() {
        let m = merger(Arc::new(AssumeBound));

        assert_eq!(
            m.merge(&caller("[2001:db8::7]:700"), "::.8.1", None, "tcp6").await,
            Ok("2001:db8::1.8.1".to_string())
        );
    }

    #[async_std::test]
    async fn dead_server_merges_to_empty() {
        let m = merger(Arc::new(Gone));

        assert_eq!(
            m.merge(&caller("192.168.1.50:700"), "0.0.0.0.8.1", None, "udp").await,
            Ok(String::new())
        );
    }

    #[async_std::test]
    async fn no_interface() {
        let m = AddressMerger::new(
            Arc::new(StaticNetconfig::default()),
            InterfaceResolver::new(Arc::new(StaticInterfaces::default()), vec![]),
            Arc::new(AssumeBound),
            false,
        );

        assert_eq!(
            m.merge(&caller("192.168.1.50:700"), "0.0.0.0.8.1", None, "tcp").await,
            Err(MergeFailure::NoInterface)
        );
    }

    #[async_std::test]
    async fn merge_checks_bound_on_blocking_task() {
        let m = merger(Arc::new(SocketBoundChecker));
        let held = TcpListener::bind("127.0.0.1:0").unwrap();
        let uaddr = sockaddr_to_uaddr(&TransportAddress::Inet(held.local_addr().unwrap()));
        let c = caller("192.168.1.50:700");

        let merged = m.merge(&c, &uaddr, None, "tcp").await.unwrap();
        assert!(merged.starts_with("192.168.1.1."));
        drop(held);
        assert_eq!(m.merge(&c, &uaddr, None, "tcp").await, Ok(String::new()));
    }

    #[test]
    fn bind_detects_held_port() {
        let held = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = TransportAddress::Inet(held.local_addr().unwrap());
        let tcp = StaticNetconfig::default().resolve("tcp").unwrap();

        assert!(SocketBoundChecker.is_bound(&tcp, &addr));
        drop(held);
        assert!(!SocketBoundChecker.is_bound(&tcp, &addr));
    }
}
