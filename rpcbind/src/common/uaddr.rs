//! Universal addresses, see [RFC5665](https://datatracker.ietf.org/doc/html/rfc5665#section-5.2.3).
//!
//! An IPv4 endpoint `192.0.2.10:2049` is written `192.0.2.10.8.1`, an IPv6 endpoint
//! `[2001:db8::1]:111` is written `2001:db8::1.0.111`. Local transports use the
//! socket path itself.

use std::{
    fmt,
    io::{Cursor, Read},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    path::PathBuf,
};

use byteorder::{NativeEndian, NetworkEndian, ReadBytesExt};
use nix::libc;

use super::netconfig::ProtocolFamily;

/// A transport endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransportAddress {
    Inet(SocketAddr),
    Local(PathBuf),
}

impl TransportAddress {
    pub fn family(&self) -> ProtocolFamily {
        match self {
            TransportAddress::Inet(SocketAddr::V4(_)) => ProtocolFamily::Inet,
            TransportAddress::Inet(SocketAddr::V6(_)) => ProtocolFamily::Inet6,
            TransportAddress::Local(_) => ProtocolFamily::Local,
        }
    }

    /// Unspecified IP addresses and local paths carry no network location.
    pub fn is_wildcard(&self) -> bool {
        match self {
            TransportAddress::Inet(addr) => addr.ip().is_unspecified(),
            TransportAddress::Local(_) => true,
        }
    }

    pub fn is_loopback(&self) -> bool {
        match self {
            TransportAddress::Inet(addr) => addr.ip().is_loopback(),
            TransportAddress::Local(_) => true,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            TransportAddress::Inet(addr) => Some(addr.port()),
            TransportAddress::Local(_) => None,
        }
    }
}

impl From<SocketAddr> for TransportAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::Inet(addr)
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportAddress::Inet(addr) => addr.fmt(f),
            TransportAddress::Local(path) => path.display().fmt(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Address does not parse for the expected family
    MalformedAddress(String),
    /// Native address image of an unknown family or size
    UnsupportedAddress,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::MalformedAddress(uaddr) => write!(f, "malformed address '{}'", uaddr),
            DecodeError::UnsupportedAddress => write!(f, "unsupported address"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Parse a universal address belonging to a transport of `family`.
pub fn uaddr_to_sockaddr(
    family: ProtocolFamily,
    uaddr: &str,
) -> Result<TransportAddress, DecodeError> {
    let malformed = || DecodeError::MalformedAddress(uaddr.to_string());

    if family == ProtocolFamily::Local {
        if uaddr.is_empty() {
            return Err(malformed());
        }
        return Ok(TransportAddress::Local(PathBuf::from(uaddr)));
    }

    let mut parts = uaddr.rsplitn(3, '.');
    let lo = parts.next().and_then(port_octet).ok_or_else(malformed)?;
    let hi = parts.next().and_then(port_octet).ok_or_else(malformed)?;
    let host = parts.next().ok_or_else(malformed)?;
    let port = u16::from_be_bytes([hi, lo]);

    let addr = match family {
        ProtocolFamily::Inet => {
            let ip: Ipv4Addr = host.parse().map_err(|_| malformed())?;
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        }
        _ => {
            let ip: Ipv6Addr = host.parse().map_err(|_| malformed())?;
            SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0))
        }
    };
    Ok(TransportAddress::Inet(addr))
}

/// A port group of a universal address: plain decimal digits
fn port_octet(group: &str) -> Option<u8> {
    if group.is_empty() || !group.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    group.parse().ok()
}

/// Format an address as a universal address. Scope ids are not represented.
pub fn sockaddr_to_uaddr(addr: &TransportAddress) -> String {
    match addr {
        TransportAddress::Inet(addr) => {
            let [hi, lo] = addr.port().to_be_bytes();
            format!("{}.{}.{}", addr.ip(), hi, lo)
        }
        TransportAddress::Local(path) => path.to_string_lossy().into_owned(),
    }
}

/// IPv4-mapped IPv6 addresses are reported as plain IPv4.
pub fn unmap_v4(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::V4(SocketAddrV4::new(v4, v6.port())),
            None => addr,
        },
        v4 => v4,
    }
}

pub(crate) fn is_link_local(ip: &Ipv6Addr) -> bool {
    ip.segments()[0] & 0xffc0 == 0xfe80
}

/// Recover a missing zone id from a KAME-style embedded interface index.
///
/// Some stacks report link-local addresses with the interface index stored in
/// the second 16-bit group and a zero scope id.
pub fn normalize_link_local(addr: SocketAddrV6) -> SocketAddrV6 {
    let mut segments = addr.ip().segments();
    if !is_link_local(addr.ip()) || addr.scope_id() != 0 || segments[1] == 0 {
        return addr;
    }
    let scope_id = segments[1] as u32;
    segments[1] = 0;
    SocketAddrV6::new(
        Ipv6Addr::from(segments),
        addr.port(),
        addr.flowinfo(),
        scope_id,
    )
}

#[cfg(any(
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "macos",
    target_os = "ios"
))]
mod image {
    //! `sockaddr` with a leading `sa_len` byte
    use super::*;

    pub(super) fn write_header(buf: &mut Vec<u8>, family: libc::c_int, len: usize) {
        buf.push(len as u8);
        buf.push(family as u8);
    }

    pub(super) fn read_header(cursor: &mut Cursor<&[u8]>) -> std::io::Result<libc::c_int> {
        let _len = cursor.read_u8()?;
        Ok(cursor.read_u8()? as libc::c_int)
    }
}

#[cfg(not(any(
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "macos",
    target_os = "ios"
)))]
mod image {
    //! `sockaddr` with a 16-bit host order family
    use super::*;

    pub(super) fn write_header(buf: &mut Vec<u8>, family: libc::c_int, _len: usize) {
        buf.extend_from_slice(&(family as u16).to_ne_bytes());
    }

    pub(super) fn read_header(cursor: &mut Cursor<&[u8]>) -> std::io::Result<libc::c_int> {
        Ok(cursor.read_u16::<NativeEndian>()? as libc::c_int)
    }
}

const SOCKADDR_IN_LEN: usize = 16;
const SOCKADDR_IN6_LEN: usize = 28;

/// Native `sockaddr` image of an address, the payload of a `netbuf`.
pub fn sockaddr_to_taddr(addr: &TransportAddress) -> Vec<u8> {
    let mut buf = Vec::with_capacity(SOCKADDR_IN6_LEN);
    match addr {
        TransportAddress::Inet(SocketAddr::V4(v4)) => {
            image::write_header(&mut buf, libc::AF_INET, SOCKADDR_IN_LEN);
            buf.extend_from_slice(&v4.port().to_be_bytes());
            buf.extend_from_slice(&v4.ip().octets());
            buf.resize(SOCKADDR_IN_LEN, 0);
        }
        TransportAddress::Inet(SocketAddr::V6(v6)) => {
            image::write_header(&mut buf, libc::AF_INET6, SOCKADDR_IN6_LEN);
            buf.extend_from_slice(&v6.port().to_be_bytes());
            buf.extend_from_slice(&v6.flowinfo().to_be_bytes());
            buf.extend_from_slice(&v6.ip().octets());
            buf.extend_from_slice(&v6.scope_id().to_ne_bytes());
        }
        TransportAddress::Local(path) => {
            let path = path.to_string_lossy();
            image::write_header(&mut buf, libc::AF_UNIX, 2 + path.len());
            buf.extend_from_slice(path.as_bytes());
        }
    }
    buf
}

/// Parse a native `sockaddr` image.
pub fn taddr_to_sockaddr(taddr: &[u8]) -> Result<TransportAddress, DecodeError> {
    let mut cursor = Cursor::new(taddr);
    let family =
        image::read_header(&mut cursor).map_err(|_| DecodeError::UnsupportedAddress)?;
    let short = |_| DecodeError::UnsupportedAddress;

    match family {
        libc::AF_INET => {
            let port = cursor.read_u16::<NetworkEndian>().map_err(short)?;
            let mut octets = [0u8; 4];
            cursor.read_exact(&mut octets).map_err(short)?;
            Ok(TransportAddress::Inet(SocketAddr::new(
                IpAddr::from(octets),
                port,
            )))
        }
        libc::AF_INET6 => {
            let port = cursor.read_u16::<NetworkEndian>().map_err(short)?;
            let flowinfo = cursor.read_u32::<NetworkEndian>().map_err(short)?;
            let mut octets = [0u8; 16];
            cursor.read_exact(&mut octets).map_err(short)?;
            let scope_id = cursor.read_u32::<NativeEndian>().map_err(short)?;
            Ok(TransportAddress::Inet(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                port,
                flowinfo,
                scope_id,
            ))))
        }
        libc::AF_UNIX => {
            let path = &taddr[cursor.position() as usize..];
            let end = path.iter().position(|b| *b == 0).unwrap_or(path.len());
            let path = std::str::from_utf8(&path[..end]).map_err(|_| DecodeError::UnsupportedAddress)?;
            if path.is_empty() {
                return Err(DecodeError::UnsupportedAddress);
            }
            Ok(TransportAddress::Local(PathBuf::from(path)))
        }
        _ => Err(DecodeError::UnsupportedAddress),
    }
}
