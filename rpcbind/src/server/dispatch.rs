//! Procedure dispatch for rpcbind versions 3 and 4.

use std::{
    fmt,
    io::{self, Cursor},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::{SystemTime, UNIX_EPOCH},
};

use crate::common::{
    netconfig::{Semantics, TransportDescriptor},
    onc_rpc::RpcError,
    rpcbind::{
        xdr::{List, Netbuf, RmtCallArgs, RmtCallRes, Rpcb, RpcbEntry},
        RPCBPROC_CALLIT, RPCBPROC_DUMP, RPCBPROC_GETADDR, RPCBPROC_GETADDRLIST,
        RPCBPROC_GETSTAT, RPCBPROC_GETTIME, RPCBPROC_GETVERSADDR, RPCBPROC_INDIRECT,
        RPCBPROC_NULL, RPCBPROC_SET, RPCBPROC_TADDR2UADDR, RPCBPROC_UADDR2TADDR,
        RPCBPROC_UNSET, RPCBVERS, RPCBVERS4, SUPERUSER, UNKNOWN_OWNER,
    },
    uaddr::{
        sockaddr_to_taddr, sockaddr_to_uaddr, taddr_to_sockaddr, uaddr_to_sockaddr,
        TransportAddress,
    },
    xdr::basic::{XdrDecode, XdrEncode},
};

use super::{registry::ServiceBinding, stats::Outcome, Rpcbind};

/// Procedures of rpcbind versions 3 and 4
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Procedure {
    Null,
    Set,
    Unset,
    GetAddr,
    Dump,
    /// `CALLIT` in version 3, `BCAST` in version 4
    Callit,
    GetTime,
    Uaddr2Taddr,
    Taddr2Uaddr,
    GetVersAddr,
    Indirect,
    GetAddrList,
    GetStat,
}

impl Procedure {
    pub fn from_call(version: u32, proc: u32) -> Option<Self> {
        let procedure = match proc {
            RPCBPROC_NULL => Procedure::Null,
            RPCBPROC_SET => Procedure::Set,
            RPCBPROC_UNSET => Procedure::Unset,
            RPCBPROC_GETADDR => Procedure::GetAddr,
            RPCBPROC_DUMP => Procedure::Dump,
            RPCBPROC_CALLIT => Procedure::Callit,
            RPCBPROC_GETTIME => Procedure::GetTime,
            RPCBPROC_UADDR2TADDR => Procedure::Uaddr2Taddr,
            RPCBPROC_TADDR2UADDR => Procedure::Taddr2Uaddr,
            RPCBPROC_GETVERSADDR if version == RPCBVERS4 => Procedure::GetVersAddr,
            RPCBPROC_INDIRECT if version == RPCBVERS4 => Procedure::Indirect,
            RPCBPROC_GETADDRLIST if version == RPCBVERS4 => Procedure::GetAddrList,
            RPCBPROC_GETSTAT if version == RPCBVERS4 => Procedure::GetStat,
            _ => return None,
        };
        Some(procedure)
    }

    pub fn number(&self) -> u32 {
        match self {
            Procedure::Null => RPCBPROC_NULL,
            Procedure::Set => RPCBPROC_SET,
            Procedure::Unset => RPCBPROC_UNSET,
            Procedure::GetAddr => RPCBPROC_GETADDR,
            Procedure::Dump => RPCBPROC_DUMP,
            Procedure::Callit => RPCBPROC_CALLIT,
            Procedure::GetTime => RPCBPROC_GETTIME,
            Procedure::Uaddr2Taddr => RPCBPROC_UADDR2TADDR,
            Procedure::Taddr2Uaddr => RPCBPROC_TADDR2UADDR,
            Procedure::GetVersAddr => RPCBPROC_GETVERSADDR,
            Procedure::Indirect => RPCBPROC_INDIRECT,
            Procedure::GetAddrList => RPCBPROC_GETADDRLIST,
            Procedure::GetStat => RPCBPROC_GETSTAT,
        }
    }
}

/// Decoded arguments of a call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arguments {
    None,
    Rpcb(Rpcb),
    RmtCall(RmtCallArgs),
    Uaddr(String),
    Taddr(Netbuf),
}

impl Arguments {
    fn decode(procedure: Procedure, args: &[u8]) -> io::Result<Self> {
        fn read<T: XdrDecode + Default>(args: &[u8]) -> io::Result<T> {
            let mut value = T::default();
            value.read_xdr(&mut Cursor::new(args))?;
            Ok(value)
        }

        Ok(match procedure {
            Procedure::Null | Procedure::Dump | Procedure::GetTime | Procedure::GetStat => {
                Arguments::None
            }
            Procedure::Set
            | Procedure::Unset
            | Procedure::GetAddr
            | Procedure::GetVersAddr
            | Procedure::GetAddrList => Arguments::Rpcb(read(args)?),
            Procedure::Callit | Procedure::Indirect => Arguments::RmtCall(read(args)?),
            Procedure::Uaddr2Taddr => Arguments::Uaddr(read(args)?),
            Procedure::Taddr2Uaddr => Arguments::Taddr(read(args)?),
        })
    }
}

/// The origin of a call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub addr: TransportAddress,
    /// Transport the call arrived on
    pub transport: TransportDescriptor,
    /// Uid of a local peer as reported by the kernel. AUTH_SYS claims never end up here.
    pub uid: Option<u32>,
}

impl Caller {
    pub fn new(addr: TransportAddress, transport: TransportDescriptor, uid: Option<u32>) -> Self {
        Self {
            addr,
            transport,
            uid,
        }
    }

    /// Arrived through a local socket or from a loopback address
    pub fn is_loopback(&self) -> bool {
        self.addr.is_loopback()
    }

    /// Owner recorded for registrations made by this caller
    pub fn owner(&self) -> String {
        match self.uid {
            Some(0) => SUPERUSER.to_string(),
            Some(uid) => uid.to_string(),
            None => UNKNOWN_OWNER.to_string(),
        }
    }
}

/// Protocol level failures of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyError {
    /// Arguments did not decode
    Decode,
    /// Denied by access control
    WeakAuth,
    SystemErr,
    ProcUnavail,
    ProgUnavail,
    ProgMismatch { low: u32, high: u32 },
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyError::Decode => write!(f, "cannot decode arguments"),
            ReplyError::WeakAuth => write!(f, "weak authentication"),
            ReplyError::SystemErr => write!(f, "system error"),
            ReplyError::ProcUnavail => write!(f, "procedure unavailable"),
            ReplyError::ProgUnavail => write!(f, "program unavailable"),
            ReplyError::ProgMismatch { low, high } => {
                write!(f, "program version mismatch ({}-{})", low, high)
            }
        }
    }
}

impl std::error::Error for ReplyError {}

/// Outcome of [Rpcbind::handle_request]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Success without results
    Empty,
    /// Success, XDR encoded results
    Value(Vec<u8>),
    Error(ReplyError),
    /// Send nothing back
    NoReply,
}

impl Reply {
    pub fn value<T: XdrEncode>(value: &T) -> Self {
        let mut cursor = Cursor::new(Vec::new());
        match value.write_xdr(&mut cursor) {
            Ok(()) => Reply::Value(cursor.into_inner()),
            Err(_) => Reply::Error(ReplyError::SystemErr),
        }
    }

    /// Decode the results of a successful reply
    pub fn decode<T: XdrDecode + Default>(&self) -> Option<T> {
        let Reply::Value(bytes) = self else {
            return None;
        };
        let mut value = T::default();
        value.read_xdr(&mut Cursor::new(bytes)).ok()?;
        Some(value)
    }
}

/// Wall clock for GETTIME
pub trait Clock: Send + Sync {
    /// Seconds since the unix epoch
    fn now(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs())
    }
}

/// Where to send a relayed call for a service registered at `addr`
fn relay_target(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

impl Rpcbind {
    /// Handle one call of procedure `proc` in rpcbind version `version`.
    ///
    /// Arguments are decoded and checked against access control before the
    /// call is counted and dispatched.
    pub async fn handle_request(
        &self,
        version: u32,
        proc: u32,
        args: &[u8],
        caller: &Caller,
    ) -> Reply {
        if version != RPCBVERS && version != RPCBVERS4 {
            return Reply::Error(ReplyError::ProgMismatch {
                low: RPCBVERS,
                high: RPCBVERS4,
            });
        }
        let Some(procedure) = Procedure::from_call(version, proc) else {
            return Reply::Error(ReplyError::ProcUnavail);
        };
        let arguments = match Arguments::decode(procedure, args) {
            Ok(arguments) => arguments,
            Err(err) => {
                log::debug!("{}: bad arguments to {:?}: {}", caller.addr, procedure, err);
                return Reply::Error(ReplyError::Decode);
            }
        };
        if !self
            .access
            .is_allowed(caller, procedure, &arguments, version)
        {
            return Reply::Error(ReplyError::WeakAuth);
        }

        self.stats.record(version, proc);
        if self.config.debug {
            log::debug!(
                "{} ({}): v{} {:?} {:?}",
                caller.addr,
                caller.transport.netid,
                version,
                procedure,
                arguments
            );
        }

        match (procedure, arguments) {
            (Procedure::Null, _) => Reply::Empty,
            (Procedure::Set, Arguments::Rpcb(rpcb)) => {
                Reply::value(&self.set(version, rpcb, caller).await)
            }
            (Procedure::Unset, Arguments::Rpcb(rpcb)) => {
                Reply::value(&self.unset(version, &rpcb, caller).await)
            }
            (Procedure::GetAddr, Arguments::Rpcb(rpcb)) => {
                Reply::value(&self.getaddr(version, &rpcb, caller, false).await)
            }
            (Procedure::GetVersAddr, Arguments::Rpcb(rpcb)) => {
                Reply::value(&self.getaddr(version, &rpcb, caller, true).await)
            }
            (Procedure::Dump, _) => Reply::value(&self.dump().await),
            (Procedure::Callit, Arguments::RmtCall(args)) => {
                self.rmtcall(version, &args, caller, false).await
            }
            (Procedure::Indirect, Arguments::RmtCall(args)) => {
                self.rmtcall(version, &args, caller, true).await
            }
            (Procedure::GetTime, _) => Reply::value(&(self.clock.now() as u32)),
            (Procedure::Uaddr2Taddr, Arguments::Uaddr(uaddr)) => {
                let netbuf = uaddr_to_sockaddr(caller.transport.family, &uaddr)
                    .map(|addr| Netbuf::new(sockaddr_to_taddr(&addr)))
                    .unwrap_or_default();
                Reply::value(&netbuf)
            }
            (Procedure::Taddr2Uaddr, Arguments::Taddr(netbuf)) => {
                let uaddr = taddr_to_sockaddr(&netbuf.buf.0)
                    .map(|addr| sockaddr_to_uaddr(&addr))
                    .unwrap_or_default();
                Reply::value(&uaddr)
            }
            (Procedure::GetAddrList, Arguments::Rpcb(rpcb)) => {
                Reply::value(&self.getaddrlist(&rpcb, caller).await)
            }
            (Procedure::GetStat, _) => Reply::value(&self.stats.snapshot()),
            (procedure, arguments) => {
                log::error!("{:?} dispatched with {:?}", procedure, arguments);
                Reply::Error(ReplyError::SystemErr)
            }
        }
    }

    async fn set(&self, version: u32, rpcb: Rpcb, caller: &Caller) -> bool {
        let Some(transport) = self.netconfig.resolve(&rpcb.r_netid) else {
            log::debug!("SET of {} on unknown transport {}", rpcb.r_prog, rpcb.r_netid);
            return false;
        };
        if uaddr_to_sockaddr(transport.family, &rpcb.r_addr).is_err() {
            log::debug!("SET of {} with bad address '{}'", rpcb.r_prog, rpcb.r_addr);
            return false;
        }

        let owner = caller.owner();
        let binding = ServiceBinding {
            owner: owner.clone(),
            ..ServiceBinding::from(rpcb)
        };
        let done = self.registry.write().await.set(binding, &owner);
        if done {
            self.stats.record_set(version);
        }
        done
    }

    async fn unset(&self, version: u32, rpcb: &Rpcb, caller: &Caller) -> bool {
        let netid = Some(rpcb.r_netid.as_str()).filter(|n| !n.is_empty());
        let owner = caller.owner();

        let mut registry = self.registry.write().await;
        let removed = registry.unset_owned(rpcb.r_prog, rpcb.r_vers, netid, &owner);
        let missing = !removed && !registry.contains(rpcb.r_prog, rpcb.r_vers, netid);
        drop(registry);

        if removed {
            self.stats.record_unset(version);
        }
        removed || (missing && self.config.unset_missing_ok)
    }

    /// Merged address of (prog, vers) on the caller's transport, empty if unknown.
    async fn getaddr(&self, version: u32, rpcb: &Rpcb, caller: &Caller, any_version: bool) -> String {
        let netid = &caller.transport.netid;
        let found = {
            let registry = self.registry.read().await;
            registry
                .lookup_exact(rpcb.r_prog, rpcb.r_vers, netid)
                .or_else(|| {
                    any_version
                        .then(|| registry.lookup_any_version(rpcb.r_prog, netid))
                        .flatten()
                })
        };

        let (uaddr, outcome) = match &found {
            Some(binding) => {
                let uaddr = self.merge(binding, rpcb, caller).await;
                let outcome = if uaddr.is_empty() {
                    Outcome::Failure
                } else {
                    Outcome::Success
                };
                (uaddr, outcome)
            }
            None => (String::new(), Outcome::Unregistered),
        };
        self.stats
            .record_addr_lookup(version, rpcb.r_prog, rpcb.r_vers, netid, outcome);
        uaddr
    }

    /// Merge `binding` for `caller`, dropping the program if the server is gone.
    async fn merge(&self, binding: &ServiceBinding, rpcb: &Rpcb, caller: &Caller) -> String {
        let hint = Some(rpcb.r_addr.as_str()).filter(|h| !h.is_empty());
        match self
            .merger
            .merge(&caller.addr, &binding.uaddr, hint, &binding.netid)
            .await
        {
            Ok(uaddr) if uaddr.is_empty() => {
                if self.registry.write().await.remove_dead(binding) {
                    log::info!(
                        "Server for {} version {} is gone, removed",
                        binding.program,
                        binding.version
                    );
                }
                uaddr
            }
            Ok(uaddr) => uaddr,
            Err(err) => {
                log::debug!(
                    "Cannot merge {} on {} for {}: {}",
                    binding.uaddr,
                    binding.netid,
                    caller.addr,
                    err
                );
                String::new()
            }
        }
    }

    async fn dump(&self) -> List<Rpcb> {
        let bindings = self.registry.read().await.dump_all();
        List(bindings.into_iter().map(Rpcb::from).collect())
    }

    async fn getaddrlist(&self, rpcb: &Rpcb, caller: &Caller) -> List<RpcbEntry> {
        let candidates = self.registry.read().await.list_matching(
            rpcb.r_prog,
            rpcb.r_vers,
            caller.transport.family,
            self.netconfig.as_ref(),
        );
        let hint = Some(rpcb.r_addr.as_str()).filter(|h| !h.is_empty());

        let mut entries = Vec::new();
        for binding in candidates {
            let Some(transport) = self.netconfig.resolve(&binding.netid) else {
                continue;
            };
            match self
                .merger
                .merge(&caller.addr, &binding.uaddr, hint, &binding.netid)
                .await
            {
                Ok(maddr) if maddr.is_empty() => {
                    if self.registry.write().await.remove_stale(&binding) {
                        log::info!(
                            "Removed stale {} version {} on {}",
                            binding.program,
                            binding.version,
                            binding.netid
                        );
                    }
                }
                Ok(maddr) => entries.push(RpcbEntry {
                    r_maddr: maddr,
                    r_nc_netid: binding.netid.clone(),
                    r_nc_semantics: transport.semantics as u32,
                    r_nc_protofmly: transport.family.protofmly().to_string(),
                    r_nc_proto: transport.proto().to_string(),
                }),
                Err(err) => {
                    log::debug!("Skipping {} on {}: {}", binding.uaddr, binding.netid, err)
                }
            }
        }
        List(entries)
    }

    /// CALLIT/BCAST and INDIRECT. Broadcast calls never report failures.
    async fn rmtcall(
        &self,
        version: u32,
        args: &RmtCallArgs,
        caller: &Caller,
        indirect: bool,
    ) -> Reply {
        let fail = |err: ReplyError| {
            if indirect {
                Reply::Error(err)
            } else {
                Reply::NoReply
            }
        };
        if caller.transport.semantics != Semantics::Connectionless {
            return fail(ReplyError::ProcUnavail);
        }

        let netid = &caller.transport.netid;
        let found = {
            let registry = self.registry.read().await;
            match registry.lookup_exact(args.prog, args.vers, netid) {
                Some(binding) => Ok(binding),
                None => Err(registry.version_range(args.prog, netid)),
            }
        };
        let record = |outcome| {
            self.stats.record_rmtcall(
                version, args.prog, args.vers, args.proc, netid, indirect, outcome,
            )
        };
        let binding = match found {
            Ok(binding) => binding,
            Err(range) => {
                record(Outcome::Unregistered);
                return fail(match range {
                    Some((low, high)) => ReplyError::ProgMismatch { low, high },
                    None => ReplyError::ProgUnavail,
                });
            }
        };

        // A server that cannot be merged for this caller is not called
        let merged = self.merge(&binding, &Rpcb::default(), caller).await;
        if merged.is_empty() {
            record(Outcome::Failure);
            return fail(ReplyError::ProgUnavail);
        }

        let target = match uaddr_to_sockaddr(caller.transport.family, &binding.uaddr) {
            Ok(TransportAddress::Inet(addr)) => relay_target(addr),
            _ => {
                record(Outcome::Failure);
                return fail(ReplyError::SystemErr);
            }
        };

        let result = self.forwarder.forward(target, args).await;
        record(if result.is_ok() {
            Outcome::Success
        } else {
            Outcome::Failure
        });
        match result {
            Ok(results) => Reply::value(&RmtCallRes {
                addr: merged,
                results: results.into(),
            }),
            Err(err) => {
                log::debug!(
                    "Relay of {}.{}.{} to {} failed: {}",
                    args.prog,
                    args.vers,
                    args.proc,
                    target,
                    err
                );
                fail(match err {
                    RpcError::ProgUnavail => ReplyError::ProgUnavail,
                    RpcError::ProgMismatch(m) => ReplyError::ProgMismatch {
                        low: m.low,
                        high: m.high,
                    },
                    RpcError::ProcUnavail => ReplyError::ProcUnavail,
                    _ => ReplyError::SystemErr,
                })
            }
        }
    }
}
