//! Forwarding of indirect calls.

use std::{io, net::SocketAddr, time::Duration};

use async_trait::async_trait;

use crate::common::{
    onc_rpc::{RpcClient, RpcError, UdpRpcClient},
    rpcbind::xdr::RmtCallArgs,
};

/// Performs a call on behalf of a CALLIT/BCAST/INDIRECT caller
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Call `call.proc` of the server at `target`, returns the encoded results.
    async fn forward(&self, target: SocketAddr, call: &RmtCallArgs) -> Result<Vec<u8>, RpcError>;
}

/// Relays over a fresh UDP socket
#[derive(Debug, Clone, Copy)]
pub struct UdpForwarder {
    timeout: Duration,
}

impl UdpForwarder {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Forwarder for UdpForwarder {
    async fn forward(&self, target: SocketAddr, call: &RmtCallArgs) -> Result<Vec<u8>, RpcError> {
        let mut client = UdpRpcClient::connect(call.prog, target).await?;
        async_std::future::timeout(
            self.timeout,
            client.call_raw(call.vers, call.proc, call.args.0.clone()),
        )
        .await
        .map_err(|_| RpcError::Io(io::ErrorKind::TimedOut.into()))?
    }
}
