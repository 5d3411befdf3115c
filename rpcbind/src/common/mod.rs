pub mod netconfig;
pub mod onc_rpc;
pub mod rpcbind;
pub mod uaddr;
pub mod xdr;
