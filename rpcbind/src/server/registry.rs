//! The set of registered services.

use std::collections::BTreeMap;

use crate::common::{
    netconfig::{NetworkConfig, ProtocolFamily},
    rpcbind::{xdr::Rpcb, SUPERUSER},
};

/// One (program, version, netid) to address registration
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct ServiceBinding {
    pub program: u32,
    pub version: u32,
    pub netid: String,
    pub uaddr: String,
    pub owner: String,
}

impl ServiceBinding {
    pub fn new(
        program: u32,
        version: u32,
        netid: impl Into<String>,
        uaddr: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            program,
            version,
            netid: netid.into(),
            uaddr: uaddr.into(),
            owner: owner.into(),
        }
    }

    fn key(&self) -> (u32, u32, String) {
        (self.program, self.version, self.netid.clone())
    }
}

impl From<Rpcb> for ServiceBinding {
    fn from(rpcb: Rpcb) -> Self {
        Self {
            program: rpcb.r_prog,
            version: rpcb.r_vers,
            netid: rpcb.r_netid,
            uaddr: rpcb.r_addr,
            owner: rpcb.r_owner,
        }
    }
}

impl From<ServiceBinding> for Rpcb {
    fn from(binding: ServiceBinding) -> Self {
        Rpcb {
            r_prog: binding.program,
            r_vers: binding.version,
            r_netid: binding.netid,
            r_addr: binding.uaddr,
            r_owner: binding.owner,
        }
    }
}

/// Bindings keyed by (program, version, netid).
///
/// Key ordering doubles as the (program, version) index: all transports of
/// one program version are adjacent. Reads hand out copies, never references.
#[derive(Debug, Default)]
pub struct Registry {
    bindings: BTreeMap<(u32, u32, String), ServiceBinding>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Insert `binding`, replacing an existing one only when `requester` owns it or is the superuser.
    pub fn set(&mut self, binding: ServiceBinding, requester: &str) -> bool {
        let key = binding.key();
        if let Some(existing) = self.bindings.get(&key) {
            if existing.owner != requester && requester != SUPERUSER {
                return false;
            }
        }
        self.bindings.insert(key, binding);
        true
    }

    /// Remove (program, version) on `netid`, or on every transport if `None`.
    pub fn unset(&mut self, program: u32, version: u32, netid: Option<&str>) -> bool {
        let before = self.bindings.len();
        self.bindings.retain(|(prog, vers, id), _| {
            !(*prog == program && *vers == version && netid.map_or(true, |n| n == id))
        });
        self.bindings.len() != before
    }

    /// Like [Registry::unset] but fails, removing nothing, if any match is owned by someone else.
    pub fn unset_owned(
        &mut self,
        program: u32,
        version: u32,
        netid: Option<&str>,
        requester: &str,
    ) -> bool {
        let foreign = self
            .versions(program, version)
            .filter(|b| netid.map_or(true, |n| n == b.netid))
            .any(|b| b.owner != requester && requester != SUPERUSER);
        if foreign {
            return false;
        }
        self.unset(program, version, netid)
    }

    /// Remove `binding` only if it is still registered exactly as given.
    pub fn remove_stale(&mut self, binding: &ServiceBinding) -> bool {
        let key = binding.key();
        if self.bindings.get(&key) == Some(binding) {
            self.bindings.remove(&key);
            true
        } else {
            false
        }
    }

    /// Remove (program, version) from every transport, provided `probed` is still
    /// registered exactly as given.
    pub fn remove_dead(&mut self, probed: &ServiceBinding) -> bool {
        if self.bindings.get(&probed.key()) != Some(probed) {
            return false;
        }
        self.unset(probed.program, probed.version, None)
    }

    pub fn lookup_exact(&self, program: u32, version: u32, netid: &str) -> Option<ServiceBinding> {
        self.bindings
            .get(&(program, version, netid.to_string()))
            .cloned()
    }

    /// The highest registered version of `program` on `netid`
    pub fn lookup_any_version(&self, program: u32, netid: &str) -> Option<ServiceBinding> {
        self.bindings
            .range((program, 0, String::new())..)
            .take_while(|((prog, _, _), _)| *prog == program)
            .filter(|((_, _, id), _)| id == netid)
            .map(|(_, binding)| binding)
            .last()
            .cloned()
    }

    /// Any binding of (program, version) on `netid`, or on any transport if `None`
    pub fn contains(&self, program: u32, version: u32, netid: Option<&str>) -> bool {
        self.versions(program, version)
            .any(|b| netid.map_or(true, |n| n == b.netid))
    }

    /// Lowest and highest version of `program` registered on `netid`
    pub fn version_range(&self, program: u32, netid: &str) -> Option<(u32, u32)> {
        self.bindings
            .range((program, 0, String::new())..)
            .take_while(|((prog, _, _), _)| *prog == program)
            .filter(|((_, _, id), _)| id == netid)
            .map(|((_, vers, _), _)| *vers)
            .fold(None, |range, vers| match range {
                None => Some((vers, vers)),
                Some((low, high)) => Some((low.min(vers), high.max(vers))),
            })
    }

    /// Snapshot of every transport of (program, version) whose protocol family is `family`
    pub fn list_matching(
        &self,
        program: u32,
        version: u32,
        family: ProtocolFamily,
        netconfig: &dyn NetworkConfig,
    ) -> Vec<ServiceBinding> {
        self.versions(program, version)
            .filter(|b| {
                netconfig
                    .resolve(&b.netid)
                    .map_or(false, |nc| nc.family == family)
            })
            .cloned()
            .collect()
    }

    /// Snapshot of the whole registry
    pub fn dump_all(&self) -> Vec<ServiceBinding> {
        self.bindings.values().cloned().collect()
    }

    fn versions(&self, program: u32, version: u32) -> impl Iterator<Item = &ServiceBinding> {
        self.bindings
            .range((program, version, String::new())..)
            .take_while(move |((prog, vers, _), _)| *prog == program && *vers == version)
            .map(|(_, binding)| binding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::netconfig::StaticNetconfig;

    fn nfs(vers: u32, netid: &str, owner: &str) -> ServiceBinding {
        ServiceBinding::new(100003, vers, netid, "10.0.0.5.8.1", owner)
    }

    #[test]
    fn set_is_unique_per_key() {
        let mut reg = Registry::new();
        assert!(reg.set(nfs(3, "tcp", "1000"), "1000"));
        assert!(reg.set(
            ServiceBinding::new(100003, 3, "tcp", "10.0.0.6.8.1", "1000"),
            "1000"
        ));

        assert_eq!(reg.len(), 1);
        assert_eq!(
            reg.lookup_exact(100003, 3, "tcp").unwrap().uaddr,
            "10.0.0.6.8.1"
        );
    }

    #[test]
    fn set_respects_owner() {
        let mut reg = Registry::new();
        assert!(reg.set(nfs(3, "tcp", "1000"), "1000"));
        assert!(!reg.set(nfs(3, "tcp", "1001"), "1001"));
        assert_eq!(reg.lookup_exact(100003, 3, "tcp").unwrap().owner, "1000");

        assert!(reg.set(nfs(3, "tcp", SUPERUSER), SUPERUSER));
        assert_eq!(
            reg.lookup_exact(100003, 3, "tcp").unwrap().owner,
            SUPERUSER
        );
    }

    #[test]
    fn unset_any_transport() {
        let mut reg = Registry::new();
        reg.set(nfs(3, "tcp", "1000"), "1000");
        reg.set(nfs(3, "udp", "1000"), "1000");
        reg.set(nfs(4, "tcp", "1000"), "1000");

        assert!(reg.unset(100003, 3, None));
        assert!(reg.lookup_exact(100003, 3, "tcp").is_none());
        assert!(reg.lookup_exact(100003, 3, "udp").is_none());
        assert!(reg.lookup_exact(100003, 4, "tcp").is_some());

        assert!(!reg.unset(100003, 3, None));
    }

    #[test]
    fn unset_owned_is_all_or_nothing() {
        let mut reg = Registry::new();
        reg.set(nfs(3, "tcp", "1000"), "1000");
        reg.set(nfs(3, "udp", "0"), "0");

        assert!(!reg.unset_owned(100003, 3, None, "1000"));
        assert_eq!(reg.len(), 2);

        assert!(reg.unset_owned(100003, 3, Some("tcp"), "1000"));
        assert!(reg.unset_owned(100003, 3, None, SUPERUSER));
        assert!(reg.is_empty());
    }

    #[test]
    fn any_version_is_highest() {
        let mut reg = Registry::new();
        reg.set(nfs(2, "tcp", "1000"), "1000");
        reg.set(nfs(4, "tcp", "1000"), "1000");
        reg.set(nfs(3, "tcp", "1000"), "1000");
        reg.set(nfs(5, "udp", "1000"), "1000");
        reg.set(ServiceBinding::new(100004, 9, "tcp", "", ""), "1000");

        assert_eq!(reg.lookup_any_version(100003, "tcp").unwrap().version, 4);
        assert!(reg.lookup_any_version(100003, "tcp6").is_none());
        assert!(reg.lookup_any_version(100005, "tcp").is_none());

        assert_eq!(reg.version_range(100003, "tcp"), Some((2, 4)));
        assert_eq!(reg.version_range(100003, "tcp6"), None);
        assert!(reg.contains(100003, 5, None));
        assert!(!reg.contains(100003, 5, Some("tcp")));
    }

    #[test]
    fn list_by_family() {
        let nc = StaticNetconfig::default();
        let mut reg = Registry::new();
        reg.set(nfs(3, "tcp", "1000"), "1000");
        reg.set(nfs(3, "udp", "1000"), "1000");
        reg.set(nfs(3, "tcp6", "1000"), "1000");
        reg.set(nfs(3, "bogus", "1000"), "1000");

        let inet = reg.list_matching(100003, 3, ProtocolFamily::Inet, &nc);
        let netids: Vec<_> = inet.iter().map(|b| b.netid.as_str()).collect();
        assert_eq!(netids, ["tcp", "udp"]);

        let snapshot = reg.list_matching(100003, 3, ProtocolFamily::Inet6, &nc);
        reg.unset(100003, 3, None);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].netid, "tcp6");
    }

    #[test]
    fn stale_removal_is_conditional() {
        let mut reg = Registry::new();
        let probed = nfs(3, "tcp", "1000");
        reg.set(probed.clone(), "1000");
        reg.set(
            ServiceBinding::new(100003, 3, "tcp", "10.0.0.9.8.1", "1000"),
            "1000",
        );

        assert!(!reg.remove_stale(&probed));
        assert!(reg.lookup_exact(100003, 3, "tcp").is_some());

        let current = reg.lookup_exact(100003, 3, "tcp").unwrap();
        assert!(reg.remove_stale(&current));
        assert!(reg.is_empty());
    }

    #[test]
    fn dead_program_removal_is_conditional() {
        let mut reg = Registry::new();
        let probed = nfs(3, "udp", "1000");
        reg.set(probed.clone(), "1000");
        reg.set(nfs(3, "tcp", "1000"), "1000");
        reg.set(nfs(4, "udp", "1000"), "1000");

        // Re-registered while the dead server was being detected
        reg.set(
            ServiceBinding::new(100003, 3, "udp", "10.0.0.9.8.1", "1000"),
            "1000",
        );
        assert!(!reg.remove_dead(&probed));
        assert_eq!(reg.len(), 3);

        let current = reg.lookup_exact(100003, 3, "udp").unwrap();
        assert!(reg.remove_dead(&current));
        assert_eq!(reg.dump_all(), vec![nfs(4, "udp", "1000")]);
    }
}
