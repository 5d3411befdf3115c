//! Typed rpcbind client.

use std::{net::SocketAddr, path::Path};

use async_std::{
    net::{TcpStream, ToSocketAddrs},
    os::unix::net::UnixStream,
};

use crate::common::{
    onc_rpc::{RpcClient, RpcError, StreamRpcClient, UdpRpcClient},
    rpcbind::{
        xdr::{List, Netbuf, RmtCallArgs, RmtCallRes, Rpcb, RpcbEntry, RpcbStatByVers},
        RPCBPROC_CALLIT, RPCBPROC_DUMP, RPCBPROC_GETADDR, RPCBPROC_GETADDRLIST,
        RPCBPROC_GETSTAT, RPCBPROC_GETTIME, RPCBPROC_GETVERSADDR, RPCBPROC_INDIRECT,
        RPCBPROC_NULL, RPCBPROC_SET, RPCBPROC_TADDR2UADDR, RPCBPROC_UADDR2TADDR,
        RPCBPROC_UNSET, RPCBPROG, RPCBVERS4,
    },
};

pub mod prelude {
    pub use super::RpcbindClient;
    pub use crate::common::rpcbind::{
        xdr::{List, Netbuf, RmtCallArgs, RmtCallRes, Rpcb, RpcbEntry},
        RPCBIND_PORT, RPCBIND_SOCKET, RPCBPROG, RPCBVERS, RPCBVERS4,
    };
}

/// Calls rpcbind procedures over any [RpcClient].
///
/// Procedures present in both versions take the protocol version to call,
/// version 4 only procedures always use [RPCBVERS4].
pub struct RpcbindClient<C>(C);

impl<IO> RpcbindClient<StreamRpcClient<IO>> {
    pub fn new(io: IO) -> Self {
        Self(StreamRpcClient::new(io, RPCBPROG))
    }
}

impl RpcbindClient<StreamRpcClient<TcpStream>> {
    pub async fn connect_tcp(addrs: impl ToSocketAddrs) -> Result<Self, RpcError> {
        let stream = TcpStream::connect(addrs).await?;
        Ok(Self::new(stream))
    }
}

impl RpcbindClient<StreamRpcClient<UnixStream>> {
    pub async fn connect_unix(path: impl AsRef<Path>) -> Result<Self, RpcError> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        Ok(Self::new(stream))
    }
}

impl RpcbindClient<UdpRpcClient> {
    pub async fn connect_udp(addr: SocketAddr) -> Result<Self, RpcError> {
        Ok(Self(UdpRpcClient::connect(RPCBPROG, addr).await?))
    }
}

impl<C> RpcbindClient<C>
where
    C: RpcClient,
{
    pub fn from_client(client: C) -> Self {
        Self(client)
    }

    pub async fn null(&mut self, vers: u32) -> Result<(), RpcError> {
        self.0.call(vers, RPCBPROC_NULL, ()).await
    }

    pub async fn set(&mut self, vers: u32, rpcb: Rpcb) -> Result<bool, RpcError> {
        self.0.call(vers, RPCBPROC_SET, rpcb).await
    }

    pub async fn unset(&mut self, vers: u32, rpcb: Rpcb) -> Result<bool, RpcError> {
        self.0.call(vers, RPCBPROC_UNSET, rpcb).await
    }

    /// Universal address of `rpcb.r_prog`/`rpcb.r_vers`, empty if not registered
    pub async fn getaddr(&mut self, vers: u32, rpcb: Rpcb) -> Result<String, RpcError> {
        self.0.call(vers, RPCBPROC_GETADDR, rpcb).await
    }

    pub async fn dump(&mut self, vers: u32) -> Result<Vec<Rpcb>, RpcError> {
        let list: List<Rpcb> = self.0.call(vers, RPCBPROC_DUMP, ()).await?;
        Ok(list.0)
    }

    /// `CALLIT` in version 3, `BCAST` in version 4
    pub async fn callit(&mut self, vers: u32, args: RmtCallArgs) -> Result<RmtCallRes, RpcError> {
        self.0.call(vers, RPCBPROC_CALLIT, args).await
    }

    /// Seconds since the unix epoch on the server
    pub async fn gettime(&mut self, vers: u32) -> Result<u32, RpcError> {
        self.0.call(vers, RPCBPROC_GETTIME, ()).await
    }

    pub async fn uaddr2taddr(&mut self, vers: u32, uaddr: String) -> Result<Netbuf, RpcError> {
        self.0.call(vers, RPCBPROC_UADDR2TADDR, uaddr).await
    }

    pub async fn taddr2uaddr(&mut self, vers: u32, taddr: Netbuf) -> Result<String, RpcError> {
        self.0.call(vers, RPCBPROC_TADDR2UADDR, taddr).await
    }

    /// Like [RpcbindClient::getaddr], falls back to any version of the program
    pub async fn getversaddr(&mut self, rpcb: Rpcb) -> Result<String, RpcError> {
        self.0.call(RPCBVERS4, RPCBPROC_GETVERSADDR, rpcb).await
    }

    pub async fn indirect(&mut self, args: RmtCallArgs) -> Result<RmtCallRes, RpcError> {
        self.0.call(RPCBVERS4, RPCBPROC_INDIRECT, args).await
    }

    pub async fn getaddrlist(&mut self, rpcb: Rpcb) -> Result<Vec<RpcbEntry>, RpcError> {
        let list: List<RpcbEntry> = self.0.call(RPCBVERS4, RPCBPROC_GETADDRLIST, rpcb).await?;
        Ok(list.0)
    }

    pub async fn getstat(&mut self) -> Result<RpcbStatByVers, RpcError> {
        self.0.call(RPCBVERS4, RPCBPROC_GETSTAT, ()).await
    }
}
