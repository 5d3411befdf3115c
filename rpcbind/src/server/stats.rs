//! Call statistics as reported by GETSTAT.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex, PoisonError,
    },
};

use crate::common::rpcbind::{
    xdr::{List, RpcbStat, RpcbStatByVers, RpcbsAddr, RpcbsRmtcall},
    PMAPVERS, RPCBSTAT_HIGHPROC, RPCBVERS_STAT,
};

/// Entries kept per lookup or remote call table
pub const MAX_TABLE_ENTRIES: usize = 1024;

/// How an address lookup or a relayed call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Failed for a registered program
    Failure,
    /// Nothing registered, only counted for programs already in the table
    Unregistered,
}

#[derive(Debug, Default, Clone, Copy)]
struct Outcomes {
    success: u32,
    failure: u32,
    indirect: u32,
}

impl Outcomes {
    fn count(&mut self, outcome: Outcome) {
        if outcome == Outcome::Success {
            self.success = self.success.wrapping_add(1);
        } else {
            self.failure = self.failure.wrapping_add(1);
        }
    }
}

/// Count `outcome` under `key`. New keys are only added for registered programs
/// while the table has room.
fn tally<K: Ord>(
    table: &mut BTreeMap<K, Outcomes>,
    key: K,
    outcome: Outcome,
) -> Option<&mut Outcomes> {
    let room = table.len() < MAX_TABLE_ENTRIES;
    let outcomes = match outcome {
        Outcome::Success | Outcome::Failure if room => table.entry(key).or_default(),
        _ => table.get_mut(&key)?,
    };
    outcomes.count(outcome);
    Some(outcomes)
}

#[derive(Debug, Default)]
struct VersionStats {
    info: [AtomicU32; RPCBSTAT_HIGHPROC],
    setinfo: AtomicU32,
    unsetinfo: AtomicU32,
    addrinfo: Mutex<BTreeMap<(u32, u32, String), Outcomes>>,
    rmtinfo: Mutex<BTreeMap<(u32, u32, u32, String), Outcomes>>,
}

impl VersionStats {
    fn snapshot(&self) -> RpcbStat {
        let mut stat = RpcbStat::default();
        for (dst, src) in stat.info.iter_mut().zip(&self.info) {
            *dst = src.load(Ordering::Relaxed);
        }
        stat.setinfo = self.setinfo.load(Ordering::Relaxed);
        stat.unsetinfo = self.unsetinfo.load(Ordering::Relaxed);

        let addrinfo = self.addrinfo.lock().unwrap_or_else(PoisonError::into_inner);
        stat.addrinfo = List(
            addrinfo
                .iter()
                .map(|((prog, vers, netid), o)| RpcbsAddr {
                    prog: *prog,
                    vers: *vers,
                    success: o.success,
                    failure: o.failure,
                    netid: netid.clone(),
                })
                .collect(),
        );
        drop(addrinfo);

        let rmtinfo = self.rmtinfo.lock().unwrap_or_else(PoisonError::into_inner);
        stat.rmtinfo = List(
            rmtinfo
                .iter()
                .map(|((prog, vers, proc, netid), o)| RpcbsRmtcall {
                    prog: *prog,
                    vers: *vers,
                    proc: *proc,
                    success: o.success,
                    failure: o.failure,
                    indirect: o.indirect,
                    netid: netid.clone(),
                })
                .collect(),
        );
        stat
    }

    fn zero(&self) {
        for counter in &self.info {
            counter.store(0, Ordering::Relaxed);
        }
        self.setinfo.store(0, Ordering::Relaxed);
        self.unsetinfo.store(0, Ordering::Relaxed);
        self.addrinfo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.rmtinfo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Counters per protocol version, updated concurrently by request handlers.
///
/// `version` arguments are rpcbind protocol versions, counts for versions
/// outside 2..=4 or procedures beyond the table are dropped.
#[derive(Debug, Default)]
pub struct StatsCollector {
    versions: [VersionStats; RPCBVERS_STAT],
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn version(&self, version: u32) -> Option<&VersionStats> {
        version
            .checked_sub(PMAPVERS)
            .and_then(|i| self.versions.get(i as usize))
    }

    /// Count a dispatched call
    pub fn record(&self, version: u32, proc: u32) {
        if let Some(counter) = self
            .version(version)
            .and_then(|v| v.info.get(proc as usize))
        {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count a successful SET
    pub fn record_set(&self, version: u32) {
        if let Some(v) = self.version(version) {
            v.setinfo.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count a successful UNSET
    pub fn record_unset(&self, version: u32) {
        if let Some(v) = self.version(version) {
            v.unsetinfo.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_addr_lookup(
        &self,
        version: u32,
        prog: u32,
        vers: u32,
        netid: &str,
        outcome: Outcome,
    ) {
        if let Some(v) = self.version(version) {
            let mut addrinfo = v.addrinfo.lock().unwrap_or_else(PoisonError::into_inner);
            tally(&mut addrinfo, (prog, vers, netid.to_string()), outcome);
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_rmtcall(
        &self,
        version: u32,
        prog: u32,
        vers: u32,
        proc: u32,
        netid: &str,
        indirect: bool,
        outcome: Outcome,
    ) {
        if let Some(v) = self.version(version) {
            let mut rmtinfo = v.rmtinfo.lock().unwrap_or_else(PoisonError::into_inner);
            let key = (prog, vers, proc, netid.to_string());
            if let Some(outcomes) = tally(&mut rmtinfo, key, outcome) {
                if indirect {
                    outcomes.indirect = outcomes.indirect.wrapping_add(1);
                }
            }
        }
    }

    pub fn snapshot(&self) -> RpcbStatByVers {
        [
            self.versions[0].snapshot(),
            self.versions[1].snapshot(),
            self.versions[2].snapshot(),
        ]
    }

    /// Reset every counter
    pub fn zero(&self) {
        for v in &self.versions {
            v.zero();
        }
    }
}
