//! Static network configuration: what each network id means.

/// Protocol family of a transport, the `nc_protofmly` of a netconfig entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProtocolFamily {
    Inet,
    Inet6,
    Local,
}

impl ProtocolFamily {
    pub fn protofmly(&self) -> &'static str {
        match self {
            ProtocolFamily::Inet => "inet",
            ProtocolFamily::Inet6 => "inet6",
            ProtocolFamily::Local => "loopback",
        }
    }
}

/// Transport semantics, numbered like `nc_semantics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Semantics {
    Connectionless = 1,
    ConnectionOriented = 2,
    ConnectionOrientedOrd = 3,
}

impl Semantics {
    pub fn is_connectionless(&self) -> bool {
        *self == Semantics::Connectionless
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportDescriptor {
    pub netid: String,
    pub family: ProtocolFamily,
    pub semantics: Semantics,
}

impl TransportDescriptor {
    pub fn new(netid: impl Into<String>, family: ProtocolFamily, semantics: Semantics) -> Self {
        Self {
            netid: netid.into(),
            family,
            semantics,
        }
    }

    /// `nc_proto` of this transport
    pub fn proto(&self) -> &'static str {
        match (self.family, self.semantics) {
            (ProtocolFamily::Local, _) => "-",
            (_, Semantics::Connectionless) => "udp",
            (_, _) => "tcp",
        }
    }
}

/// Resolves network ids to transport descriptors.
pub trait NetworkConfig: Send + Sync {
    fn resolve(&self, netid: &str) -> Option<TransportDescriptor>;
}

/// The usual `/etc/netconfig` contents.
#[derive(Debug, Clone)]
pub struct StaticNetconfig {
    transports: Vec<TransportDescriptor>,
}

impl StaticNetconfig {
    pub fn new(transports: Vec<TransportDescriptor>) -> Self {
        Self { transports }
    }

    pub fn transports(&self) -> &[TransportDescriptor] {
        &self.transports
    }
}

impl Default for StaticNetconfig {
    fn default() -> Self {
        use ProtocolFamily::*;
        use Semantics::*;
        Self::new(vec![
            TransportDescriptor::new("udp6", Inet6, Connectionless),
            TransportDescriptor::new("tcp6", Inet6, ConnectionOrientedOrd),
            TransportDescriptor::new("udp", Inet, Connectionless),
            TransportDescriptor::new("tcp", Inet, ConnectionOrientedOrd),
            TransportDescriptor::new("local", Local, ConnectionOrientedOrd),
            TransportDescriptor::new("unix", Local, ConnectionOrientedOrd),
        ])
    }
}

impl NetworkConfig for StaticNetconfig {
    fn resolve(&self, netid: &str) -> Option<TransportDescriptor> {
        self.transports.iter().find(|t| t.netid == netid).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_transports() {
        let nc = StaticNetconfig::default();

        let tcp6 = nc.resolve("tcp6").unwrap();
        assert_eq!(tcp6.family, ProtocolFamily::Inet6);
        assert_eq!(tcp6.proto(), "tcp");
        assert_eq!(tcp6.family.protofmly(), "inet6");

        let udp = nc.resolve("udp").unwrap();
        assert!(udp.semantics.is_connectionless());
        assert_eq!(udp.proto(), "udp");

        assert_eq!(nc.resolve("local").unwrap().proto(), "-");
        assert!(nc.resolve("ticlts").is_none());
    }
}
