//! Rpcbind XDR types, see [RFC1833](https://datatracker.ietf.org/doc/html/rfc1833).

use std::io::{Read, Result, Write};

use crate::common::xdr::prelude::*;

use super::{RPCBSTAT_HIGHPROC, RPCBVERS_STAT};

/// A mapping of (program, version, network ID) to address
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct Rpcb {
    pub r_prog: u32,
    pub r_vers: u32,
    pub r_netid: String,
    pub r_addr: String,
    pub r_owner: String,
}

impl Rpcb {
    pub fn new(
        r_prog: u32,
        r_vers: u32,
        r_netid: impl Into<String>,
        r_addr: impl Into<String>,
        r_owner: impl Into<String>,
    ) -> Self {
        Self {
            r_prog,
            r_vers,
            r_netid: r_netid.into(),
            r_addr: r_addr.into(),
            r_owner: r_owner.into(),
        }
    }
}

impl XdrEncode for Rpcb {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        self.r_prog.write_xdr(writer)?;
        self.r_vers.write_xdr(writer)?;
        self.r_netid.write_xdr(writer)?;
        self.r_addr.write_xdr(writer)?;
        self.r_owner.write_xdr(writer)
    }
}

impl XdrDecode for Rpcb {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        self.r_prog.read_xdr(reader)?;
        self.r_vers.read_xdr(reader)?;
        self.r_netid.read_xdr(reader)?;
        self.r_addr.read_xdr(reader)?;
        self.r_owner.read_xdr(reader)
    }
}

/// One address of a service as returned by GETADDRLIST
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RpcbEntry {
    pub r_maddr: String,
    pub r_nc_netid: String,
    pub r_nc_semantics: u32,
    pub r_nc_protofmly: String,
    pub r_nc_proto: String,
}

impl XdrEncode for RpcbEntry {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        self.r_maddr.write_xdr(writer)?;
        self.r_nc_netid.write_xdr(writer)?;
        self.r_nc_semantics.write_xdr(writer)?;
        self.r_nc_protofmly.write_xdr(writer)?;
        self.r_nc_proto.write_xdr(writer)
    }
}

impl XdrDecode for RpcbEntry {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        self.r_maddr.read_xdr(reader)?;
        self.r_nc_netid.read_xdr(reader)?;
        self.r_nc_semantics.read_xdr(reader)?;
        self.r_nc_protofmly.read_xdr(reader)?;
        self.r_nc_proto.read_xdr(reader)
    }
}

/// A linked list on the wire: every element is preceded by `TRUE`, the end by `FALSE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct List<T>(pub Vec<T>);

impl<T> Default for List<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> From<Vec<T>> for List<T> {
    fn from(items: Vec<T>) -> Self {
        Self(items)
    }
}

impl<T: XdrEncode> XdrEncode for List<T> {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        for item in &self.0 {
            true.write_xdr(writer)?;
            item.write_xdr(writer)?;
        }
        false.write_xdr(writer)
    }
}

impl<T: XdrDecode + Default> XdrDecode for List<T> {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        self.0.clear();
        loop {
            let mut more = false;
            more.read_xdr(reader)?;
            if !more {
                break Ok(());
            }
            let mut item = T::default();
            item.read_xdr(reader)?;
            self.0.push(item);
        }
    }
}

/// Transport specific address
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Netbuf {
    pub maxlen: u32,
    pub buf: Opaque,
}

impl Netbuf {
    pub fn new(buf: Vec<u8>) -> Self {
        Self {
            maxlen: buf.len() as u32,
            buf: Opaque(buf),
        }
    }
}

impl XdrEncode for Netbuf {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        self.maxlen.write_xdr(writer)?;
        self.buf.write_xdr(writer)
    }
}

impl XdrDecode for Netbuf {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        self.maxlen.read_xdr(reader)?;
        self.buf.read_xdr(reader)
    }
}

/// Arguments of CALLIT/BCAST/INDIRECT
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RmtCallArgs {
    pub prog: u32,
    pub vers: u32,
    pub proc: u32,
    pub args: Opaque,
}

impl XdrEncode for RmtCallArgs {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        self.prog.write_xdr(writer)?;
        self.vers.write_xdr(writer)?;
        self.proc.write_xdr(writer)?;
        self.args.write_xdr(writer)
    }
}

impl XdrDecode for RmtCallArgs {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        self.prog.read_xdr(reader)?;
        self.vers.read_xdr(reader)?;
        self.proc.read_xdr(reader)?;
        self.args.read_xdr(reader)
    }
}

/// Results of CALLIT/BCAST/INDIRECT
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RmtCallRes {
    pub addr: String,
    pub results: Opaque,
}

impl XdrEncode for RmtCallRes {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        self.addr.write_xdr(writer)?;
        self.results.write_xdr(writer)
    }
}

impl XdrDecode for RmtCallRes {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        self.addr.read_xdr(reader)?;
        self.results.read_xdr(reader)
    }
}

/// Address lookup statistics for one (program, version, netid)
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RpcbsAddr {
    pub prog: u32,
    pub vers: u32,
    pub success: u32,
    pub failure: u32,
    pub netid: String,
}

impl XdrEncode for RpcbsAddr {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        self.prog.write_xdr(writer)?;
        self.vers.write_xdr(writer)?;
        self.success.write_xdr(writer)?;
        self.failure.write_xdr(writer)?;
        self.netid.write_xdr(writer)
    }
}

impl XdrDecode for RpcbsAddr {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        self.prog.read_xdr(reader)?;
        self.vers.read_xdr(reader)?;
        self.success.read_xdr(reader)?;
        self.failure.read_xdr(reader)?;
        self.netid.read_xdr(reader)
    }
}

/// Remote call statistics for one (program, version, procedure, netid)
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RpcbsRmtcall {
    pub prog: u32,
    pub vers: u32,
    pub proc: u32,
    pub success: u32,
    pub failure: u32,
    /// Number of calls made through INDIRECT
    pub indirect: u32,
    pub netid: String,
}

impl XdrEncode for RpcbsRmtcall {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        self.prog.write_xdr(writer)?;
        self.vers.write_xdr(writer)?;
        self.proc.write_xdr(writer)?;
        self.success.write_xdr(writer)?;
        self.failure.write_xdr(writer)?;
        self.indirect.write_xdr(writer)?;
        self.netid.write_xdr(writer)
    }
}

impl XdrDecode for RpcbsRmtcall {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        self.prog.read_xdr(reader)?;
        self.vers.read_xdr(reader)?;
        self.proc.read_xdr(reader)?;
        self.success.read_xdr(reader)?;
        self.failure.read_xdr(reader)?;
        self.indirect.read_xdr(reader)?;
        self.netid.read_xdr(reader)
    }
}

/// Statistics of one protocol version
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RpcbStat {
    pub info: [u32; RPCBSTAT_HIGHPROC],
    pub setinfo: u32,
    pub unsetinfo: u32,
    pub addrinfo: List<RpcbsAddr>,
    pub rmtinfo: List<RpcbsRmtcall>,
}

impl XdrEncode for RpcbStat {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        self.info.write_xdr(writer)?;
        self.setinfo.write_xdr(writer)?;
        self.unsetinfo.write_xdr(writer)?;
        self.addrinfo.write_xdr(writer)?;
        self.rmtinfo.write_xdr(writer)
    }
}

impl XdrDecode for RpcbStat {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        self.info.read_xdr(reader)?;
        self.setinfo.read_xdr(reader)?;
        self.unsetinfo.read_xdr(reader)?;
        self.addrinfo.read_xdr(reader)?;
        self.rmtinfo.read_xdr(reader)
    }
}

/// Statistics of versions 2, 3 and 4, in that order
pub type RpcbStatByVers = [RpcbStat; RPCBVERS_STAT];
