//! rpcbind: maps ONC RPC program numbers to universal addresses (RFC 1833, versions 3 and 4).
//!
//! [server::Rpcbind] holds the registry and answers calls on UDP, TCP and a
//! local unix socket. [client::RpcbindClient] is a typed client for the same
//! protocol.

pub mod client;
pub mod common;
pub mod server;
