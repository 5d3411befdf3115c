//! Access control for incoming calls.

use crate::common::rpcbind::RPCBPROG;

use super::dispatch::{Arguments, Caller, Procedure};

/// NFS
const NFS_PROGRAM: u32 = 100003;
/// NIS
const YPPROG: u32 = 100004;
/// NFS mount protocol
const MOUNTPROG: u32 = 100005;
/// NIS binder
const YPBINDPROG: u32 = 100007;

/// Programs that may not be called through rpcbind
const RELAY_DENIED: [u32; 5] = [RPCBPROG, NFS_PROGRAM, YPPROG, MOUNTPROG, YPBINDPROG];

/// Decides whether a decoded call may proceed
pub trait AccessControl: Send + Sync {
    fn is_allowed(
        &self,
        caller: &Caller,
        procedure: Procedure,
        args: &Arguments,
        version: u32,
    ) -> bool;
}

/// Registration from loopback only, no relaying to sensitive programs.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostPolicy {
    /// Allow SET and UNSET from remote hosts
    pub insecure: bool,
    /// Log denials as warnings
    pub verbose: bool,
}

impl HostPolicy {
    pub fn new(insecure: bool, verbose: bool) -> Self {
        Self { insecure, verbose }
    }

    fn deny(&self, caller: &Caller, procedure: Procedure, version: u32, why: &str) -> bool {
        if self.verbose {
            log::warn!(
                "{}: v{} {:?} declined ({})",
                caller.addr,
                version,
                procedure,
                why
            );
        } else {
            log::debug!(
                "{}: v{} {:?} declined ({})",
                caller.addr,
                version,
                procedure,
                why
            );
        }
        false
    }
}

impl AccessControl for HostPolicy {
    fn is_allowed(
        &self,
        caller: &Caller,
        procedure: Procedure,
        args: &Arguments,
        version: u32,
    ) -> bool {
        match (procedure, args) {
            (Procedure::Set | Procedure::Unset, _) if !self.insecure && !caller.is_loopback() => {
                self.deny(caller, procedure, version, "non-loopback sender")
            }
            (Procedure::Callit | Procedure::Indirect, Arguments::RmtCall(call))
                if RELAY_DENIED.contains(&call.prog) =>
            {
                self.deny(caller, procedure, version, "forwarding denied")
            }
            _ => true,
        }
    }
}

/// Allows everything
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn is_allowed(
        &self,
        _caller: &Caller,
        _procedure: Procedure,
        _args: &Arguments,
        _version: u32,
    ) -> bool {
        true
    }
}
