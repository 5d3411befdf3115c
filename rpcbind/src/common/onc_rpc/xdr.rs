//! RPC message types, see [RFC5531](https://datatracker.ietf.org/doc/html/rfc5531).

use std::io::{Cursor, ErrorKind, Read, Result, Write};

use crate::common::xdr::prelude::*;

/// Only supported version of the RPC protocol
pub(crate) const RPC_VERSION: u32 = 2;

#[derive(Debug)]
pub(crate) enum MsgType {
    Call(Callbody),
    Reply(Replybody),
}

impl Default for MsgType {
    fn default() -> Self {
        Self::Call(Default::default())
    }
}

impl XdrEncode for MsgType {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        match self {
            MsgType::Call(cb) => {
                writer.write_u32::<NetworkEndian>(0)?;
                cb.write_xdr(writer)
            }
            MsgType::Reply(rb) => {
                writer.write_u32::<NetworkEndian>(1)?;
                rb.write_xdr(writer)
            }
        }
    }
}

impl XdrDecode for MsgType {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        *self = match reader.read_u32::<NetworkEndian>()? {
            0 => {
                let mut cb = Callbody::default();
                cb.read_xdr(reader)?;
                Self::Call(cb)
            }
            1 => {
                let mut rb = Replybody::default();
                rb.read_xdr(reader)?;
                Self::Reply(rb)
            }
            _ => return Err(ErrorKind::InvalidData.into()),
        };
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) enum ReplyStat {
    Accepted(AcceptedReply),
    Denied(RejectedReply),
}

impl ReplyStat {
    pub(crate) fn rpc_vers_mismatch(low: u32, high: u32) -> Self {
        Self::Denied(RejectedReply {
            stat: RejectStat::RpcMismatch(MismatchInfo { low, high }),
        })
    }

    pub(crate) fn auth_error(stat: AuthStat) -> Self {
        Self::Denied(RejectedReply {
            stat: RejectStat::AuthError(stat),
        })
    }

    pub(crate) fn accepted(stat: AcceptStat) -> Self {
        Self::Accepted(AcceptedReply {
            verf: Default::default(),
            stat,
        })
    }
}

impl Default for ReplyStat {
    fn default() -> Self {
        Self::Accepted(Default::default())
    }
}

impl XdrEncode for ReplyStat {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        match self {
            ReplyStat::Accepted(areply) => {
                writer.write_u32::<NetworkEndian>(0)?;
                areply.write_xdr(writer)
            }
            ReplyStat::Denied(rreply) => {
                writer.write_u32::<NetworkEndian>(1)?;
                rreply.write_xdr(writer)
            }
        }
    }
}

impl XdrDecode for ReplyStat {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        *self = match reader.read_u32::<NetworkEndian>()? {
            0 => {
                let mut areply = AcceptedReply::default();
                areply.read_xdr(reader)?;
                Self::Accepted(areply)
            }
            1 => {
                let mut rreply = RejectedReply::default();
                rreply.read_xdr(reader)?;
                Self::Denied(rreply)
            }
            _ => return Err(ErrorKind::InvalidData.into()),
        };
        Ok(())
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) enum AcceptStat {
    #[default]
    Success,
    ProgUnavail,
    ProgMismatch(MismatchInfo),
    ProcUnavail,
    GarbageArgs,
    SystemErr,
}

impl XdrEncode for AcceptStat {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        writer.write_u32::<NetworkEndian>(match *self {
            AcceptStat::Success => 0,
            AcceptStat::ProgUnavail => 1,
            AcceptStat::ProgMismatch(_) => 2,
            AcceptStat::ProcUnavail => 3,
            AcceptStat::GarbageArgs => 4,
            AcceptStat::SystemErr => 5,
        })?;
        if let AcceptStat::ProgMismatch(mismatch) = self {
            mismatch.write_xdr(writer)?;
        }
        Ok(())
    }
}

impl XdrDecode for AcceptStat {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        *self = match reader.read_u32::<NetworkEndian>()? {
            0 => Self::Success,
            1 => Self::ProgUnavail,
            2 => {
                let mut mismatch = MismatchInfo::default();
                mismatch.read_xdr(reader)?;
                Self::ProgMismatch(mismatch)
            }
            3 => Self::ProcUnavail,
            4 => Self::GarbageArgs,
            5 => Self::SystemErr,
            _ => return Err(ErrorKind::InvalidData.into()),
        };
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RejectStat {
    RpcMismatch(MismatchInfo),
    AuthError(AuthStat),
}

impl Default for RejectStat {
    fn default() -> Self {
        Self::RpcMismatch(Default::default())
    }
}

impl XdrEncode for RejectStat {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        match self {
            RejectStat::RpcMismatch(mismatch) => {
                writer.write_u32::<NetworkEndian>(0)?;
                mismatch.write_xdr(writer)
            }
            RejectStat::AuthError(err) => {
                writer.write_u32::<NetworkEndian>(1)?;
                err.write_xdr(writer)
            }
        }
    }
}

impl XdrDecode for RejectStat {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        *self = match reader.read_u32::<NetworkEndian>()? {
            0 => {
                let mut mismatch = MismatchInfo::default();
                mismatch.read_xdr(reader)?;
                Self::RpcMismatch(mismatch)
            }
            1 => {
                let mut authstat = AuthStat::default();
                authstat.read_xdr(reader)?;
                Self::AuthError(authstat)
            }
            _ => return Err(ErrorKind::InvalidData.into()),
        };
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum AuthStat {
    #[default]
    Ok,
    BadCred,
    RejectedCred,
    BadVerf,
    RejectedVerf,
    TooWeak,
    InvalidResp,
    Failed,
}

impl XdrEncode for AuthStat {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        writer.write_u32::<NetworkEndian>(*self as u32)
    }
}

impl XdrDecode for AuthStat {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        *self = match reader.read_u32::<NetworkEndian>()? {
            0 => Self::Ok,
            1 => Self::BadCred,
            2 => Self::RejectedCred,
            3 => Self::BadVerf,
            4 => Self::RejectedVerf,
            5 => Self::TooWeak,
            6 => Self::InvalidResp,
            7 => Self::Failed,
            _ => return Err(ErrorKind::InvalidData.into()),
        };
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthFlavour {
    #[default]
    None,
    Sys,
    Short,
    Other(u32),
}

impl XdrDecode for AuthFlavour {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        *self = match reader.read_u32::<NetworkEndian>()? {
            0 => Self::None,
            1 => Self::Sys,
            2 => Self::Short,
            other => Self::Other(other),
        };
        Ok(())
    }
}

impl XdrEncode for AuthFlavour {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        writer.write_u32::<NetworkEndian>(match self {
            AuthFlavour::None => 0,
            AuthFlavour::Sys => 1,
            AuthFlavour::Short => 2,
            AuthFlavour::Other(x) => *x,
        })
    }
}

#[derive(Debug, Default)]
pub(crate) struct OpaqueAuth {
    pub flavour: AuthFlavour,
    pub body: Opaque,
}

impl OpaqueAuth {
    /// The uid carried by an AUTH_SYS credential, if this is one.
    pub(crate) fn unix_uid(&self) -> Option<u32> {
        if self.flavour != AuthFlavour::Sys {
            return None;
        }
        let mut parms = AuthSysParms::default();
        parms.read_xdr(&mut Cursor::new(&self.body.0)).ok()?;
        Some(parms.uid)
    }
}

impl XdrEncode for OpaqueAuth {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        self.flavour.write_xdr(writer)?;
        self.body.write_xdr(writer)
    }
}

impl XdrDecode for OpaqueAuth {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        self.flavour.read_xdr(reader)?;
        self.body.read_xdr(reader)
    }
}

/// AUTH_SYS credential body, RFC5531 appendix A.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct AuthSysParms {
    pub stamp: u32,
    pub machinename: String,
    pub uid: u32,
    pub gid: u32,
    pub gids: Vec<u32>,
}

impl XdrEncode for AuthSysParms {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        self.stamp.write_xdr(writer)?;
        self.machinename.write_xdr(writer)?;
        self.uid.write_xdr(writer)?;
        self.gid.write_xdr(writer)?;
        self.gids.write_xdr(writer)
    }
}

impl XdrDecode for AuthSysParms {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        self.stamp.read_xdr(reader)?;
        self.machinename.read_xdr(reader)?;
        self.uid.read_xdr(reader)?;
        self.gid.read_xdr(reader)?;
        self.gids.read_xdr(reader)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Callbody {
    pub rpc_vers: u32,
    pub prog: u32,
    pub vers: u32,
    pub proc: u32,
    pub cred: OpaqueAuth,
    pub verf: OpaqueAuth, /* Args follows */
}

impl XdrEncode for Callbody {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        self.rpc_vers.write_xdr(writer)?;
        self.prog.write_xdr(writer)?;
        self.vers.write_xdr(writer)?;
        self.proc.write_xdr(writer)?;
        self.cred.write_xdr(writer)?;
        self.verf.write_xdr(writer)
    }
}

impl XdrDecode for Callbody {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        self.rpc_vers.read_xdr(reader)?;
        self.prog.read_xdr(reader)?;
        self.vers.read_xdr(reader)?;
        self.proc.read_xdr(reader)?;
        self.cred.read_xdr(reader)?;
        self.verf.read_xdr(reader)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd)]
pub struct MismatchInfo {
    pub low: u32,
    pub high: u32,
}

impl XdrEncode for MismatchInfo {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        self.low.write_xdr(writer)?;
        self.high.write_xdr(writer)
    }
}

impl XdrDecode for MismatchInfo {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        self.low.read_xdr(reader)?;
        self.high.read_xdr(reader)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Replybody {
    pub stat: ReplyStat,
}

impl XdrEncode for Replybody {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        self.stat.write_xdr(writer)
    }
}

impl XdrDecode for Replybody {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        self.stat.read_xdr(reader)
    }
}

#[derive(Debug, Default)]
pub(crate) struct AcceptedReply {
    pub verf: OpaqueAuth,
    pub stat: AcceptStat,
}

impl XdrEncode for AcceptedReply {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        self.verf.write_xdr(writer)?;
        self.stat.write_xdr(writer)
    }
}

impl XdrDecode for AcceptedReply {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        self.verf.read_xdr(reader)?;
        self.stat.read_xdr(reader)
    }
}

#[derive(Debug, Default)]
pub(crate) struct RejectedReply {
    pub stat: RejectStat,
}

impl XdrEncode for RejectedReply {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        self.stat.write_xdr(writer)
    }
}

impl XdrDecode for RejectedReply {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        self.stat.read_xdr(reader)
    }
}

/// A Rpc call or reply
#[derive(Debug, Default)]
pub(crate) struct RpcMessage {
    pub xid: u32,
    pub mtype: MsgType,
}

impl XdrEncode for RpcMessage {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        self.xid.write_xdr(writer)?;
        self.mtype.write_xdr(writer)
    }
}

impl XdrDecode for RpcMessage {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        self.xid.read_xdr(reader)?;
        self.mtype.read_xdr(reader)
    }
}

impl RpcMessage {
    pub(crate) fn call(xid: u32, prog: u32, vers: u32, proc: u32) -> Self {
        Self {
            xid,
            mtype: MsgType::Call(Callbody {
                rpc_vers: RPC_VERSION,
                prog,
                vers,
                proc,
                cred: Default::default(),
                verf: Default::default(),
            }),
        }
    }

    pub(crate) fn reply(xid: u32, stat: ReplyStat) -> Self {
        Self {
            xid,
            mtype: MsgType::Reply(Replybody { stat }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_header_layout() {
        let mut cursor = Cursor::new(Vec::new());
        RpcMessage::call(17, 100000, 4, 3)
            .write_xdr(&mut cursor)
            .unwrap();

        assert_eq!(
            cursor.get_ref()[..],
            [
                0, 0, 0, 17, // xid
                0, 0, 0, 0, // CALL
                0, 0, 0, 2, // rpcvers
                0, 1, 0x86, 0xa0, // prog
                0, 0, 0, 4, // vers
                0, 0, 0, 3, // proc
                0, 0, 0, 0, 0, 0, 0, 0, // cred
                0, 0, 0, 0, 0, 0, 0, 0, // verf
            ][..]
        );
    }

    #[test]
    fn auth_sys_uid() {
        let parms = AuthSysParms {
            stamp: 1,
            machinename: "host".to_string(),
            uid: 1000,
            gid: 100,
            gids: vec![100, 4],
        };
        let mut body = Cursor::new(Vec::new());
        parms.write_xdr(&mut body).unwrap();

        let cred = OpaqueAuth {
            flavour: AuthFlavour::Sys,
            body: Opaque(body.into_inner()),
        };
        assert_eq!(cred.unix_uid(), Some(1000));
        assert_eq!(OpaqueAuth::default().unix_uid(), None);
    }

    #[test]
    fn denied_reply_roundtrip() {
        let mut cursor = Cursor::new(Vec::new());
        RpcMessage::reply(9, ReplyStat::auth_error(AuthStat::TooWeak))
            .write_xdr(&mut cursor)
            .unwrap();

        cursor.set_position(0);
        let mut msg = RpcMessage::default();
        msg.read_xdr(&mut cursor).unwrap();
        let MsgType::Reply(Replybody {
            stat: ReplyStat::Denied(RejectedReply { stat }),
        }) = msg.mtype
        else {
            panic!("expected a denied reply, got {:?}", msg.mtype);
        };
        assert_eq!(stat, RejectStat::AuthError(AuthStat::TooWeak));
    }
}
