//! The rpcbind server: shared state, listeners and the RPC entry point.

use std::{
    fs,
    io::{self, Cursor, Write},
    net::{IpAddr, SocketAddr},
    path::Path,
    sync::Arc,
    time::Duration,
};

use async_listen::ListenExt;
use async_std::{
    net::{TcpListener, UdpSocket},
    os::unix::net::{UnixListener, UnixStream},
    sync::RwLock,
    task,
};
use futures::{try_join, AsyncRead, AsyncWrite, StreamExt};

use crate::common::{
    netconfig::{NetworkConfig, StaticNetconfig},
    onc_rpc::{xdr::Callbody, AuthStat, MismatchInfo, Peer, RpcError, RpcService},
    rpcbind::{RPCBPROG, RPCBVERS, RPCBVERS4, SUPERUSER},
    uaddr::{sockaddr_to_uaddr, TransportAddress},
};

use self::{
    access::{AccessControl, HostPolicy},
    dispatch::{Caller, Clock, Reply, ReplyError, SystemClock},
    interfaces::{InterfaceResolver, NetworkInterfaces, SystemInterfaces},
    merge::{AddressMerger, BoundChecker, SocketBoundChecker},
    registry::{Registry, ServiceBinding},
    relay::{Forwarder, UdpForwarder},
    stats::StatsCollector,
    warmstart::{NoPersistence, PersistenceHook},
};

pub mod access;
pub mod dispatch;
pub mod interfaces;
pub mod merge;
pub mod registry;
pub mod relay;
pub mod stats;
pub mod warmstart;

pub mod prelude {
    pub use super::{
        dispatch::{Caller, Reply, ReplyError},
        registry::ServiceBinding,
        Rpcbind, RpcbindBuilder, ServerConfig,
    };
    pub use crate::common::rpcbind::{RPCBIND_PORT, RPCBIND_SOCKET, RPCBPROG, RPCBVERS, RPCBVERS4};
}

/// Runtime options of the server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Log every dispatched call
    pub debug: bool,
    /// Log denied calls as warnings
    pub verbose: bool,
    /// Abort the process when a reply cannot be sent
    pub abort_on_fatal: bool,
    /// Accept SET and UNSET from remote hosts
    pub insecure: bool,
    /// UNSET of something that is not registered succeeds
    pub unset_missing_ok: bool,
    /// Probe registered addresses for dead servers
    pub check_bound: bool,
    /// Addresses we were asked to listen on, empty for all
    pub listen_addrs: Vec<IpAddr>,
    /// Timeout of relayed calls
    pub relay_timeout: Duration,
    /// Largest accepted record on stream transports
    pub max_record_size: usize,
    /// Stream connections without a complete call for this long are closed
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            debug: false,
            verbose: false,
            abort_on_fatal: false,
            insecure: false,
            unset_missing_ok: false,
            check_bound: true,
            listen_addrs: Vec::new(),
            relay_timeout: Duration::from_secs(3),
            max_record_size: 1024 * 1024,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn abort_on_fatal(mut self, abort_on_fatal: bool) -> Self {
        self.abort_on_fatal = abort_on_fatal;
        self
    }

    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn unset_missing_ok(mut self, unset_missing_ok: bool) -> Self {
        self.unset_missing_ok = unset_missing_ok;
        self
    }

    pub fn check_bound(mut self, check_bound: bool) -> Self {
        self.check_bound = check_bound;
        self
    }

    pub fn listen_addrs(mut self, listen_addrs: Vec<IpAddr>) -> Self {
        self.listen_addrs = listen_addrs;
        self
    }

    pub fn relay_timeout(mut self, relay_timeout: Duration) -> Self {
        self.relay_timeout = relay_timeout;
        self
    }

    pub fn max_record_size(mut self, max_record_size: usize) -> Self {
        self.max_record_size = max_record_size;
        self
    }

    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

/// Assembles an [Rpcbind] from its collaborators, system defaults unless replaced.
pub struct RpcbindBuilder {
    config: ServerConfig,
    netconfig: Arc<dyn NetworkConfig>,
    interfaces: Arc<dyn NetworkInterfaces>,
    bound: Arc<dyn BoundChecker>,
    access: Option<Arc<dyn AccessControl>>,
    clock: Arc<dyn Clock>,
    forwarder: Option<Arc<dyn Forwarder>>,
    persistence: Arc<dyn PersistenceHook>,
}

impl RpcbindBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            netconfig: Arc::new(StaticNetconfig::default()),
            interfaces: Arc::new(SystemInterfaces),
            bound: Arc::new(SocketBoundChecker),
            access: None,
            clock: Arc::new(SystemClock),
            forwarder: None,
            persistence: Arc::new(NoPersistence),
        }
    }

    pub fn netconfig(mut self, netconfig: impl NetworkConfig + 'static) -> Self {
        self.netconfig = Arc::new(netconfig);
        self
    }

    pub fn interfaces(mut self, interfaces: impl NetworkInterfaces + 'static) -> Self {
        self.interfaces = Arc::new(interfaces);
        self
    }

    pub fn bound_checker(mut self, bound: impl BoundChecker + 'static) -> Self {
        self.bound = Arc::new(bound);
        self
    }

    /// Replace the default [HostPolicy]
    pub fn access(mut self, access: impl AccessControl + 'static) -> Self {
        self.access = Some(Arc::new(access));
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Replace the default [UdpForwarder]
    pub fn forwarder(mut self, forwarder: impl Forwarder + 'static) -> Self {
        self.forwarder = Some(Arc::new(forwarder));
        self
    }

    pub fn persistence(mut self, persistence: impl PersistenceHook + 'static) -> Self {
        self.persistence = Arc::new(persistence);
        self
    }

    pub fn build(self) -> Arc<Rpcbind> {
        let resolver = InterfaceResolver::new(self.interfaces, self.config.listen_addrs.clone());
        let merger = AddressMerger::new(
            self.netconfig.clone(),
            resolver,
            self.bound,
            self.config.check_bound,
        );
        let access: Arc<dyn AccessControl> = match self.access {
            Some(access) => access,
            None => Arc::new(HostPolicy::new(self.config.insecure, self.config.verbose)),
        };
        let forwarder: Arc<dyn Forwarder> = match self.forwarder {
            Some(forwarder) => forwarder,
            None => Arc::new(UdpForwarder::new(self.config.relay_timeout)),
        };

        Arc::new(Rpcbind {
            config: self.config,
            registry: RwLock::new(Registry::new()),
            stats: StatsCollector::new(),
            netconfig: self.netconfig,
            merger,
            access,
            clock: self.clock,
            forwarder,
            persistence: self.persistence,
        })
    }
}

/// Shared server state
pub struct Rpcbind {
    pub(crate) config: ServerConfig,
    pub(crate) registry: RwLock<Registry>,
    pub(crate) stats: StatsCollector,
    pub(crate) netconfig: Arc<dyn NetworkConfig>,
    pub(crate) merger: AddressMerger,
    pub(crate) access: Arc<dyn AccessControl>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) forwarder: Arc<dyn Forwarder>,
    persistence: Arc<dyn PersistenceHook>,
}

impl Rpcbind {
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn stats(&self) -> &StatsCollector {
        &self.stats
    }

    /// Snapshot of all registrations
    pub async fn bindings(&self) -> Vec<ServiceBinding> {
        self.registry.read().await.dump_all()
    }

    pub async fn lookup(&self, program: u32, version: u32, netid: &str) -> Option<ServiceBinding> {
        self.registry.read().await.lookup_exact(program, version, netid)
    }

    /// Register rpcbind itself on `netid` at `addr`
    pub async fn register_self(&self, netid: &str, addr: &TransportAddress) {
        let uaddr = sockaddr_to_uaddr(addr);
        let mut registry = self.registry.write().await;
        for version in [RPCBVERS, RPCBVERS4] {
            registry.set(
                ServiceBinding::new(RPCBPROG, version, netid, uaddr.as_str(), SUPERUSER),
                SUPERUSER,
            );
        }
        log::debug!("Registered on {} at {}", netid, uaddr);
    }

    /// Restore registrations saved by [Rpcbind::save_warmstart], returns how many.
    pub async fn load_warmstart(&self) -> io::Result<usize> {
        let bindings = self.persistence.load()?;
        let mut registry = self.registry.write().await;
        let mut restored = 0;
        for binding in bindings {
            if self.netconfig.resolve(&binding.netid).is_none() {
                log::warn!("Dropping warm start entry on unknown transport {}", binding.netid);
                continue;
            }
            if registry.set(binding, SUPERUSER) {
                restored += 1;
            }
        }
        log::info!("Restored {} registrations", restored);
        Ok(restored)
    }

    pub async fn save_warmstart(&self) -> io::Result<()> {
        let bindings = self.registry.read().await.dump_all();
        self.persistence.save(&bindings)?;
        log::info!("Saved {} registrations", bindings.len());
        Ok(())
    }

    /// Serve UDP and TCP on `addr`
    pub async fn bind(self: Arc<Self>, addr: SocketAddr) -> io::Result<()> {
        let (udp, tcp) = if addr.is_ipv4() {
            ("udp", "tcp")
        } else {
            ("udp6", "tcp6")
        };
        let a = {
            let socket = UdpSocket::bind(addr).await?;
            self.clone().serve_udp(socket, udp)
        };
        let b = {
            let listener = TcpListener::bind(addr).await?;
            self.clone().serve_tcp(listener, tcp)
        };
        try_join!(a, b).map(|_| ())
    }

    /// Serve the local transport on a unix socket at `path`, replacing any stale socket file.
    pub async fn bind_unix(self: Arc<Self>, path: impl AsRef<Path>) -> io::Result<()> {
        match fs::remove_file(path.as_ref()) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err),
            _ => {}
        }
        let listener = UnixListener::bind(path.as_ref()).await?;
        self.serve_unix(listener).await
    }

    pub async fn serve_udp(self: Arc<Self>, socket: UdpSocket, netid: &str) -> io::Result<()> {
        let local = socket.local_addr()?;
        log::info!("Listening on UDP {}", local);
        self.register_self(netid, &local.into()).await;
        self.serve_udp_socket(Arc::new(socket), netid.to_string())
            .await
    }

    pub async fn serve_tcp(self: Arc<Self>, listener: TcpListener, netid: &str) -> io::Result<()> {
        let local = listener.local_addr()?;
        log::info!("Listening on TCP {}", local);
        self.register_self(netid, &local.into()).await;

        let mut incoming = listener
            .incoming()
            .log_warnings(|warn| log::warn!("Listening error: {}", warn))
            .handle_errors(Duration::from_millis(100))
            .backpressure(10);

        while let Some((token, stream)) = incoming.next().await {
            let peer = match stream.peer_addr() {
                Ok(addr) => Peer::from_socket(addr, netid),
                Err(err) => {
                    log::warn!("Dropped connection without peer address: {}", err);
                    continue;
                }
            };
            log::debug!("Accepted from: {}", peer.addr);

            let s = self.clone();
            task::spawn(async move {
                if let Err(err) = s.serve_connection(stream, peer).await {
                    log::debug!("Error processing client: {}", err)
                }
                drop(token);
            });
        }
        log::info!("Stopped");
        Ok(())
    }

    pub async fn serve_unix(self: Arc<Self>, listener: UnixListener) -> io::Result<()> {
        let path = listener
            .local_addr()?
            .as_pathname()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        log::info!("Listening on {}", path.display());
        let local = TransportAddress::Local(path.clone());
        self.register_self("local", &local).await;

        let mut incoming = listener
            .incoming()
            .log_warnings(|warn| log::warn!("Listening error: {}", warn))
            .handle_errors(Duration::from_millis(100))
            .backpressure(10);

        while let Some((token, stream)) = incoming.next().await {
            let peer = Peer::new(local.clone(), "local").with_uid(peer_uid(&stream));
            log::debug!("Accepted local connection (uid {:?})", peer.uid);

            let s = self.clone();
            task::spawn(async move {
                if let Err(err) = s.serve_connection(stream, peer).await {
                    log::debug!("Error processing client: {}", err)
                }
                drop(token);
            });
        }
        log::info!("Stopped");
        Ok(())
    }

    /// Serve one connected record-marked stream from `peer`
    pub async fn serve_connection<IO>(self: Arc<Self>, stream: IO, peer: Peer) -> io::Result<()>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let maxlen = self.config.max_record_size;
        let idle = self.config.idle_timeout;
        RpcService::serve_stream(self, stream, peer, maxlen, idle).await
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn peer_uid(stream: &UnixStream) -> Option<u32> {
    use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
    use std::os::fd::{AsRawFd, BorrowedFd};

    // SAFETY: the fd is owned by `stream`, which outlives this borrow.
    let fd = unsafe { BorrowedFd::borrow_raw(stream.as_raw_fd()) };
    getsockopt(&fd, PeerCredentials)
        .map(|cred| cred.uid())
        .map_err(|err| log::debug!("SO_PEERCRED: {}", err))
        .ok()
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn peer_uid(_stream: &UnixStream) -> Option<u32> {
    None
}

#[async_trait::async_trait]
impl RpcService for Rpcbind {
    async fn call(
        self: Arc<Self>,
        peer: &Peer,
        call: &Callbody,
        args: &mut Cursor<Vec<u8>>,
        ret: &mut Cursor<Vec<u8>>,
    ) -> Result<(), RpcError> {
        if call.prog != RPCBPROG {
            return Err(RpcError::ProgUnavail);
        }
        let Some(transport) = self.netconfig.resolve(&peer.netid) else {
            log::error!("Call on unknown transport {}", peer.netid);
            return Err(RpcError::SystemErr);
        };
        // Only kernel reported uids count, AUTH_SYS is trivially forged
        let caller = Caller::new(peer.addr.clone(), transport, peer.uid);

        let start = (args.position() as usize).min(args.get_ref().len());
        let reply = self
            .handle_request(call.vers, call.proc, &args.get_ref()[start..], &caller)
            .await;
        match reply {
            Reply::Empty => Ok(()),
            Reply::Value(results) => {
                ret.write_all(&results)?;
                Ok(())
            }
            Reply::NoReply => Err(RpcError::NoReply),
            Reply::Error(err) => Err(match err {
                ReplyError::Decode => RpcError::GarbageArgs,
                ReplyError::WeakAuth => RpcError::AuthError(AuthStat::TooWeak),
                ReplyError::SystemErr => RpcError::SystemErr,
                ReplyError::ProcUnavail => RpcError::ProcUnavail,
                ReplyError::ProgUnavail => RpcError::ProgUnavail,
                ReplyError::ProgMismatch { low, high } => {
                    RpcError::ProgMismatch(MismatchInfo { low, high })
                }
            }),
        }
    }

    fn reply_failed(&self, peer: &Peer, err: &io::Error) {
        log::error!("{}: failed to send reply: {}", peer.addr, err);
        if self.config.abort_on_fatal {
            std::process::abort();
        }
    }
}
