//! ONC RPC plumbing: message handling for servers and simple clients.

use std::{
    fmt,
    io::{Cursor, Error, ErrorKind, Read, Write},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use async_std::{io, net::UdpSocket, task};
use async_trait::async_trait;
use futures::{AsyncRead, AsyncWrite};

use super::{
    uaddr::{unmap_v4, TransportAddress},
    xdr::basic::{XdrDecode, XdrEncode},
};

pub(crate) use self::record::{read_record, write_record};
use self::xdr::{
    AcceptStat, AuthFlavour, Callbody, MsgType, RejectStat, RejectedReply, ReplyStat, Replybody,
    RpcMessage, RPC_VERSION,
};
pub use self::xdr::{AuthStat, MismatchInfo};

mod record;
pub(crate) mod xdr;

/// Largest datagram accepted or sent
pub const UDP_MSGSIZE: usize = 9000;

/// An error which occured during an RPC call
#[derive(Debug)]
pub enum RpcError {
    /// Program not available
    ProgUnavail,
    /// Program version not available (see accepted version low-high in [MismatchInfo])
    ProgMismatch(MismatchInfo),
    /// Procedure not available
    ProcUnavail,
    /// Arguments have too many or too few bytes to deserialize
    GarbageArgs,
    /// Internal error
    SystemErr,
    /// RPC version not supported
    RpcMismatch(MismatchInfo),
    /// Error during RPC authentication
    AuthError(AuthStat),
    /// Call is dropped without a reply
    NoReply,
    /// (De-)serialiation error on RPC channel
    Io(Error),
}

impl From<Error> for RpcError {
    fn from(err: Error) -> Self {
        Self::Io(err)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::ProgUnavail => write!(f, "program unavailable"),
            RpcError::ProgMismatch(m) => {
                write!(f, "program version mismatch ({}-{})", m.low, m.high)
            }
            RpcError::ProcUnavail => write!(f, "procedure unavailable"),
            RpcError::GarbageArgs => write!(f, "garbage arguments"),
            RpcError::SystemErr => write!(f, "system error"),
            RpcError::RpcMismatch(m) => write!(f, "RPC version mismatch ({}-{})", m.low, m.high),
            RpcError::AuthError(stat) => write!(f, "authentication error ({:?})", stat),
            RpcError::NoReply => write!(f, "no reply"),
            RpcError::Io(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RpcError::Io(err) => Some(err),
            _ => None,
        }
    }
}

/// The remote end of a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub addr: TransportAddress,
    /// Network id of the channel the call arrived on
    pub netid: String,
    /// Uid reported by the kernel for local sockets
    pub uid: Option<u32>,
}

impl Peer {
    pub fn new(addr: impl Into<TransportAddress>, netid: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            netid: netid.into(),
            uid: None,
        }
    }

    pub fn with_uid(mut self, uid: Option<u32>) -> Self {
        self.uid = uid;
        self
    }

    /// Peer of an IP socket. IPv4-mapped peers of an IPv6 transport become
    /// IPv4 peers of the matching IPv4 transport.
    pub fn from_socket(addr: SocketAddr, netid: &str) -> Self {
        let unmapped = unmap_v4(addr);
        let netid = match netid.strip_suffix('6') {
            Some(v4) if unmapped != addr => v4,
            _ => netid,
        };
        Self::new(unmapped, netid)
    }
}

#[async_trait]
pub(crate) trait RpcService: Send + Sync + 'static {
    /// Serve calls on a record-marked stream until it is closed or no call
    /// arrives within `idle`.
    async fn serve_stream<IO>(
        self: Arc<Self>,
        mut stream: IO,
        peer: Peer,
        maxlen: usize,
        idle: Duration,
    ) -> io::Result<()>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        loop {
            let fragment = io::timeout(idle, read_record(&mut stream, maxlen)).await?;

            if let Some(reply) = self.clone().handle_message(&peer, fragment).await? {
                if let Err(err) = write_record(&mut stream, reply).await {
                    self.reply_failed(&peer, &err);
                    return Err(err);
                }
            }
        }
    }

    /// Serve datagrams, each call is handled in its own task
    async fn serve_udp_socket(self: Arc<Self>, socket: Arc<UdpSocket>, netid: String) -> io::Result<()> {
        loop {
            let mut buf = vec![0; UDP_MSGSIZE];
            let (n, from) = socket.recv_from(&mut buf).await?;
            buf.truncate(n);

            let service = self.clone();
            let socket = socket.clone();
            let peer = Peer::from_socket(from, &netid);
            task::spawn(async move {
                match service.clone().handle_message(&peer, buf).await {
                    Ok(Some(reply)) => {
                        if let Err(err) = socket.send_to(&reply, from).await {
                            service.reply_failed(&peer, &err);
                        }
                    }
                    Ok(None) => {}
                    Err(err) => log::debug!("{}: dropped datagram: {}", from, err),
                }
            });
        }
    }

    /// Decode a call, dispatch it and encode the reply. `None` means that no reply is sent.
    async fn handle_message(
        self: Arc<Self>,
        peer: &Peer,
        data_in: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, Error> {
        let mut ret = Cursor::new(Vec::new());
        let mut data_in = Cursor::new(data_in);
        let mut msg = RpcMessage::default();
        msg.read_xdr(&mut data_in)?;
        log::trace!("{} -> {:?}", peer.addr, msg);

        let xid = msg.xid;

        let call = match msg.mtype {
            MsgType::Call(call) => call,
            MsgType::Reply(_) => return Err(ErrorKind::InvalidData.into()),
        };

        let stat = if call.rpc_vers != RPC_VERSION {
            ReplyStat::rpc_vers_mismatch(RPC_VERSION, RPC_VERSION)
        } else if !matches!(call.cred.flavour, AuthFlavour::None | AuthFlavour::Sys) {
            ReplyStat::auth_error(AuthStat::RejectedCred)
        } else if call.cred.flavour == AuthFlavour::Sys && call.cred.unix_uid().is_none() {
            ReplyStat::auth_error(AuthStat::BadCred)
        } else if call.verf.flavour != AuthFlavour::None {
            ReplyStat::auth_error(AuthStat::RejectedVerf)
        } else {
            match self.clone().call(peer, &call, &mut data_in, &mut ret).await {
                Ok(()) => ReplyStat::accepted(AcceptStat::Success),
                Err(RpcError::ProgUnavail) => ReplyStat::accepted(AcceptStat::ProgUnavail),
                Err(RpcError::ProgMismatch(m)) => {
                    ReplyStat::accepted(AcceptStat::ProgMismatch(m))
                }
                Err(RpcError::ProcUnavail) => ReplyStat::accepted(AcceptStat::ProcUnavail),
                Err(RpcError::GarbageArgs) => ReplyStat::accepted(AcceptStat::GarbageArgs),
                Err(RpcError::SystemErr) => ReplyStat::accepted(AcceptStat::SystemErr),
                Err(RpcError::RpcMismatch(m)) => ReplyStat::rpc_vers_mismatch(m.low, m.high),
                Err(RpcError::AuthError(stat)) => ReplyStat::auth_error(stat),
                Err(RpcError::NoReply) => return Ok(None),
                Err(RpcError::Io(err)) => return Err(err),
            }
        };
        let success = matches!(
            stat,
            ReplyStat::Accepted(ref accepted) if accepted.stat == AcceptStat::Success
        );
        let reply = RpcMessage::reply(xid, stat);
        log::trace!("{} <- {:?}", peer.addr, reply);

        let mut data_out = Cursor::new(Vec::new());
        reply.write_xdr(&mut data_out)?;
        if success {
            data_out.write_all(&ret.into_inner()[..])?;
        }

        Ok(Some(data_out.into_inner()))
    }

    /// A reply could not be sent
    fn reply_failed(&self, peer: &Peer, err: &Error) {
        log::error!("{}: failed to send reply: {}", peer.addr, err);
    }

    async fn call(
        self: Arc<Self>,
        peer: &Peer,
        call: &Callbody,
        args: &mut Cursor<Vec<u8>>,
        ret: &mut Cursor<Vec<u8>>,
    ) -> Result<(), RpcError>;
}

/// Decode the reply to call `xid`, returns the bytes of the results.
fn parse_reply(xid: u32, reply: Vec<u8>) -> Result<Option<Vec<u8>>, RpcError> {
    let mut ret_cursor = Cursor::new(reply);

    let mut reply = RpcMessage::default();
    reply.read_xdr(&mut ret_cursor)?;
    if reply.xid != xid {
        // Stale reply to an earlier call
        return Ok(None);
    }
    match reply.mtype {
        MsgType::Reply(Replybody {
            stat: ReplyStat::Accepted(accepted),
        }) => match accepted.stat {
            AcceptStat::Success => {
                let mut results = Vec::new();
                ret_cursor.read_to_end(&mut results)?;
                Ok(Some(results))
            }
            AcceptStat::ProgUnavail => Err(RpcError::ProgUnavail),
            AcceptStat::ProgMismatch(m) => Err(RpcError::ProgMismatch(m)),
            AcceptStat::ProcUnavail => Err(RpcError::ProcUnavail),
            AcceptStat::GarbageArgs => Err(RpcError::GarbageArgs),
            AcceptStat::SystemErr => Err(RpcError::SystemErr),
        },
        MsgType::Reply(Replybody {
            stat: ReplyStat::Denied(RejectedReply { stat }),
        }) => match stat {
            RejectStat::RpcMismatch(m) => Err(RpcError::RpcMismatch(m)),
            RejectStat::AuthError(err) => Err(RpcError::AuthError(err)),
        },
        MsgType::Call(..) => Err(RpcError::Io(ErrorKind::InvalidData.into())),
    }
}

fn encode_call(xid: u32, prog: u32, vers: u32, proc: u32, args: &[u8]) -> io::Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    RpcMessage::call(xid, prog, vers, proc).write_xdr(&mut cursor)?;
    cursor.write_all(args)?;
    Ok(cursor.into_inner())
}

/// A channel to call procedures of one program
#[async_trait]
pub trait RpcClient: Send {
    /// Call procedure `proc` of version `vers` with already encoded arguments,
    /// returns the encoded results.
    async fn call_raw(&mut self, vers: u32, proc: u32, args: Vec<u8>) -> Result<Vec<u8>, RpcError>;

    /// Call procedure `proc` with arguments of type `ARGS`. Returns `Ok(RET)` if successfull.
    async fn call<ARGS, RET>(&mut self, vers: u32, proc: u32, args: ARGS) -> Result<RET, RpcError>
    where
        ARGS: XdrEncode + Send,
        RET: XdrDecode + Default + Send,
    {
        let mut args_cursor = Cursor::new(Vec::new());
        args.write_xdr(&mut args_cursor)?;

        let results = self.call_raw(vers, proc, args_cursor.into_inner()).await?;

        let mut ret = RET::default();
        ret.read_xdr(&mut Cursor::new(results))?;
        Ok(ret)
    }
}

/// Calls over a connected datagram socket
pub struct UdpRpcClient {
    xid: u32,
    prog: u32,
    socket: UdpSocket,
}

impl UdpRpcClient {
    pub fn new(prog: u32, socket: UdpSocket) -> Self {
        Self {
            xid: 0,
            prog,
            socket,
        }
    }

    /// Bind an ephemeral socket and connect it to `addr`
    pub async fn connect(prog: u32, addr: SocketAddr) -> io::Result<Self> {
        let local: SocketAddr = match addr {
            SocketAddr::V4(_) => ([0u8; 4], 0).into(),
            SocketAddr::V6(_) => ([0u16; 8], 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;
        Ok(Self::new(prog, socket))
    }
}

#[async_trait]
impl RpcClient for UdpRpcClient {
    async fn call_raw(&mut self, vers: u32, proc: u32, args: Vec<u8>) -> Result<Vec<u8>, RpcError> {
        self.xid = self.xid.wrapping_add(1);

        let call = encode_call(self.xid, self.prog, vers, proc, &args)?;
        self.socket.send(&call).await?;

        loop {
            let mut buf = vec![0; UDP_MSGSIZE];
            let n = self.socket.recv(&mut buf).await?;
            buf.truncate(n);
            if let Some(results) = parse_reply(self.xid, buf)? {
                break Ok(results);
            }
        }
    }
}

/// Calls over a record-marked stream
pub struct StreamRpcClient<IO> {
    xid: u32,
    prog: u32,
    io: IO,
}

impl<IO> StreamRpcClient<IO> {
    pub fn new(io: IO, prog: u32) -> Self {
        Self { xid: 0, io, prog }
    }
}

#[async_trait]
impl<IO> RpcClient for StreamRpcClient<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn call_raw(&mut self, vers: u32, proc: u32, args: Vec<u8>) -> Result<Vec<u8>, RpcError> {
        self.xid = self.xid.wrapping_add(1);

        let call = encode_call(self.xid, self.prog, vers, proc, &args)?;
        write_record(&mut self.io, call).await?;

        loop {
            let fragment = read_record(&mut self.io, 1024 * 1024).await?;
            if let Some(results) = parse_reply(self.xid, fragment)? {
                break Ok(results);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::xdr::basic::Opaque;

    /// Program 7 version 1: procedure 1 echoes a u32, procedure 2 never replies
    struct Echo;

    #[async_trait]
    impl RpcService for Echo {
        async fn call(
            self: Arc<Self>,
            _peer: &Peer,
            call: &Callbody,
            args: &mut Cursor<Vec<u8>>,
            ret: &mut Cursor<Vec<u8>>,
        ) -> Result<(), RpcError> {
            if call.prog != 7 {
                return Err(RpcError::ProgUnavail);
            }
            match call.proc {
                1 => {
                    let mut x = 0u32;
                    x.read_xdr(args).map_err(|_| RpcError::GarbageArgs)?;
                    x.write_xdr(ret)?;
                    Ok(())
                }
                2 => Err(RpcError::NoReply),
                _ => Err(RpcError::ProcUnavail),
            }
        }
    }

    fn peer() -> Peer {
        Peer::new(SocketAddr::from(([127, 0, 0, 1], 600)), "udp")
    }

    async fn roundtrip(msg: RpcMessage, args: &[u8]) -> Result<Option<Vec<u8>>, RpcError> {
        let mut data = Cursor::new(Vec::new());
        msg.write_xdr(&mut data)?;
        data.write_all(args)?;
        let xid = msg.xid;
        match Arc::new(Echo).handle_message(&peer(), data.into_inner()).await? {
            Some(reply) => parse_reply(xid, reply),
            None => Ok(None),
        }
    }

    #[async_std::test]
    async fn success() {
        let results = roundtrip(RpcMessage::call(1, 7, 1, 1), &[0, 0, 0, 42])
            .await
            .unwrap();

        assert_eq!(results, Some(vec![0, 0, 0, 42]));
    }

    #[async_std::test]
    async fn accept_errors() {
        assert!(matches!(
            roundtrip(RpcMessage::call(1, 8, 1, 1), &[]).await,
            Err(RpcError::ProgUnavail)
        ));
        assert!(matches!(
            roundtrip(RpcMessage::call(2, 7, 1, 1), &[0, 0]).await,
            Err(RpcError::GarbageArgs)
        ));
        assert!(matches!(
            roundtrip(RpcMessage::call(3, 7, 1, 9), &[]).await,
            Err(RpcError::ProcUnavail)
        ));
    }

    #[async_std::test]
    async fn silent_call() {
        assert!(matches!(
            roundtrip(RpcMessage::call(1, 7, 1, 2), &[]).await,
            Ok(None)
        ));
    }

    #[async_std::test]
    async fn credentials() {
        let mut msg = RpcMessage::call(1, 7, 1, 1);
        if let MsgType::Call(ref mut call) = msg.mtype {
            call.cred.flavour = AuthFlavour::Other(6);
        }
        assert!(matches!(
            roundtrip(msg, &[0, 0, 0, 1]).await,
            Err(RpcError::AuthError(AuthStat::RejectedCred))
        ));

        let mut msg = RpcMessage::call(1, 7, 1, 1);
        if let MsgType::Call(ref mut call) = msg.mtype {
            call.cred.flavour = AuthFlavour::Sys;
            call.cred.body = Opaque(vec![0, 0]);
        }
        assert!(matches!(
            roundtrip(msg, &[0, 0, 0, 1]).await,
            Err(RpcError::AuthError(AuthStat::BadCred))
        ));
    }

    #[async_std::test]
    async fn rpc_version() {
        let mut msg = RpcMessage::call(1, 7, 1, 1);
        if let MsgType::Call(ref mut call) = msg.mtype {
            call.rpc_vers = 3;
        }
        assert!(matches!(
            roundtrip(msg, &[]).await,
            Err(RpcError::RpcMismatch(MismatchInfo { low: 2, high: 2 }))
        ));
    }

    #[test]
    fn mapped_peers() {
        let peer = Peer::from_socket("[::ffff:192.0.2.3]:900".parse().unwrap(), "udp6");
        assert_eq!(peer, Peer::new(SocketAddr::from(([192, 0, 2, 3], 900)), "udp"));

        let peer = Peer::from_socket("[2001:db8::3]:900".parse().unwrap(), "tcp6");
        assert_eq!(peer.netid, "tcp6");
    }
}
