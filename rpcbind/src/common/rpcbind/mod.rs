//! Rpcbind protocol, versions 3 and 4.

pub mod xdr;

/// Well-known rpcbind port
pub const RPCBIND_PORT: u16 = 111;

/// Default path of the local transport socket
pub const RPCBIND_SOCKET: &str = "/var/run/rpcbind.sock";

// Program constants
/// Rpcbind program number
pub const RPCBPROG: u32 = 100000;
/// Portmapper version, not served
pub const PMAPVERS: u32 = 2;
/// Rpcbind version 3
pub const RPCBVERS: u32 = 3;
/// Rpcbind version 4
pub const RPCBVERS4: u32 = 4;

// Procedures
pub const RPCBPROC_NULL: u32 = 0;
pub const RPCBPROC_SET: u32 = 1;
pub const RPCBPROC_UNSET: u32 = 2;
pub const RPCBPROC_GETADDR: u32 = 3;
pub const RPCBPROC_DUMP: u32 = 4;
/// `RPCBPROC_BCAST` in version 4
pub const RPCBPROC_CALLIT: u32 = 5;
pub const RPCBPROC_GETTIME: u32 = 6;
pub const RPCBPROC_UADDR2TADDR: u32 = 7;
pub const RPCBPROC_TADDR2UADDR: u32 = 8;
pub const RPCBPROC_GETVERSADDR: u32 = 9;
pub const RPCBPROC_INDIRECT: u32 = 10;
pub const RPCBPROC_GETADDRLIST: u32 = 11;
pub const RPCBPROC_GETSTAT: u32 = 12;

/// Number of per-procedure counters in a statistics record
pub const RPCBSTAT_HIGHPROC: usize = 13;
/// Number of statistics records, one per version 2..=4
pub const RPCBVERS_STAT: usize = 3;

/// Owner recorded for registrations made by root
pub const SUPERUSER: &str = "superuser";
/// Owner recorded when the caller cannot be identified
pub const UNKNOWN_OWNER: &str = "unknown";
