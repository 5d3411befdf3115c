//! Basic types for XDR, see [RFC4506](https://datatracker.ietf.org/doc/html/rfc4506).
//!
//! Provides the following types:
//!
//! | XDR Type         | Rust type |
//! |------------------|-----------|
//! | void             | ()        |
//! | integer          | i32       |
//! | unsigned integer | u32       |
//! | Boolean          | bool      |
//! | unsigned hyper   | u64       |
//! | opaque<>         | Opaque    |
//! | string<>         | String    |
//! | T ident[n]       | [T; N]    |
//! | T ident<n>       | Vec<T>    |
//! | T *ident         | Option<T> |
//!
//! Enums and structures implement XdrEncode and XdrDecode by hand.

use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Error, ErrorKind, Read, Result, Write};

macro_rules! read_padding {
    ($reader:expr, $len:expr) => {
        let pad = (4 - ($len & 3)) & 3;
        for _ in 0..pad {
            let _ = $reader.read_u8()?;
        }
    };
}

macro_rules! write_padding {
    ($writer:expr, $len:expr) => {
        let pad = (4 - ($len & 3)) & 3;
        for _ in 0..pad {
            $writer.write_u8(0)?;
        }
    };
}

pub trait XdrDecode {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read;
}

pub trait XdrEncode {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write;
}

/// Read exactly `len` bytes without trusting `len` for the allocation size.
fn read_counted<RD>(reader: &mut RD, len: u32) -> Result<Vec<u8>>
where
    RD: Read,
{
    let mut buf = Vec::new();
    Read::take(&mut *reader, len as u64).read_to_end(&mut buf)?;
    if buf.len() != len as usize {
        return Err(ErrorKind::UnexpectedEof.into());
    }
    read_padding!(reader, len);
    Ok(buf)
}

impl XdrDecode for () {
    fn read_xdr<RD>(&mut self, _reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        Ok(())
    }
}

impl XdrEncode for () {
    fn write_xdr<WR>(&self, _writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        Ok(())
    }
}

// 4.1.  Integer
impl XdrDecode for i32 {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        *self = reader.read_i32::<NetworkEndian>()?;
        Ok(())
    }
}

impl XdrEncode for i32 {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        writer.write_i32::<NetworkEndian>(*self)
    }
}

// 4.2 Unsigned Integer
impl XdrDecode for u32 {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        *self = reader.read_u32::<NetworkEndian>()?;
        Ok(())
    }
}

impl XdrEncode for u32 {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        writer.write_u32::<NetworkEndian>(*self)
    }
}

// 4.3 Enumerations
// Manually implemented where needed

// 4.4 Booleans
impl XdrDecode for bool {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        *self = match reader.read_u32::<NetworkEndian>()? {
            0 => false,
            1 => true,
            _ => return Err(ErrorKind::InvalidData.into()),
        };
        Ok(())
    }
}

impl XdrEncode for bool {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        writer.write_u32::<NetworkEndian>(*self as u32)
    }
}

// 4.5 Hyper Integer and Unsigned Hyper Integer
impl XdrDecode for u64 {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        *self = reader.read_u64::<NetworkEndian>()?;
        Ok(())
    }
}

impl XdrEncode for u64 {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        writer.write_u64::<NetworkEndian>(*self)
    }
}

// 4.10 Variable-Length Opaque Data
//
// A newtype, `Vec<u8>` is already taken by the variable-length array below.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Opaque(pub Vec<u8>);

impl From<Vec<u8>> for Opaque {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl XdrDecode for Opaque {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        let len = reader.read_u32::<NetworkEndian>()?;
        self.0 = read_counted(reader, len)?;
        Ok(())
    }
}

impl XdrEncode for Opaque {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        writer.write_u32::<NetworkEndian>(self.0.len() as u32)?;
        writer.write_all(&self.0)?;
        write_padding!(writer, self.0.len());
        Ok(())
    }
}

// 4.11  String
impl XdrDecode for String {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        let len = reader.read_u32::<NetworkEndian>()?;
        let bytes = read_counted(reader, len)?;
        *self = String::from_utf8(bytes).map_err(|_| Error::from(ErrorKind::InvalidData))?;
        Ok(())
    }
}

impl XdrEncode for String {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        let bytes = self.as_bytes();
        writer.write_u32::<NetworkEndian>(bytes.len() as u32)?;
        writer.write_all(bytes)?;
        write_padding!(writer, bytes.len());
        Ok(())
    }
}

// 4.12 Fixed-Length Array
impl<T: XdrDecode, const N: usize> XdrDecode for [T; N] {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        for x in self {
            x.read_xdr(reader)?;
        }
        Ok(())
    }
}

impl<T: XdrEncode, const N: usize> XdrEncode for [T; N] {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        for x in self {
            x.write_xdr(writer)?;
        }
        Ok(())
    }
}

// 4.13 Variable-Length Array
impl<T: XdrDecode + Default> XdrDecode for Vec<T> {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        let len = reader.read_u32::<NetworkEndian>()? as usize;
        self.clear();
        for _ in 0..len {
            let mut x: T = Default::default();
            x.read_xdr(reader)?;
            self.push(x);
        }
        Ok(())
    }
}

impl<T: XdrEncode> XdrEncode for Vec<T> {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        writer.write_u32::<NetworkEndian>(self.len() as u32)?;
        for x in self {
            x.write_xdr(writer)?;
        }
        Ok(())
    }
}

// 4.19 Optional data
impl<T: XdrDecode + Default> XdrDecode for Option<T> {
    fn read_xdr<RD>(&mut self, reader: &mut RD) -> Result<()>
    where
        RD: Read,
    {
        let mut present = false;
        present.read_xdr(reader)?;
        *self = if present {
            let mut t: T = Default::default();
            t.read_xdr(reader)?;
            Some(t)
        } else {
            None
        };
        Ok(())
    }
}

impl<T: XdrEncode> XdrEncode for Option<T> {
    fn write_xdr<WR>(&self, writer: &mut WR) -> Result<()>
    where
        WR: Write,
    {
        self.is_some().write_xdr(writer)?;
        if let Some(t) = self {
            t.write_xdr(writer)?;
        };
        Ok(())
    }
}

#[cfg(test)]
mod test_xdr_string {
    use std::io::Cursor;

    use super::{XdrDecode, XdrEncode};

    #[test]
    fn decode_padded() {
        let mut cursor = Cursor::new(b"\x00\x00\x00\x03tcp\x00");
        let mut s = String::new();
        s.read_xdr(&mut cursor).unwrap();

        assert_eq!(s, "tcp");
        assert_eq!(cursor.position(), 8);
    }

    #[test]
    fn encode_padded() {
        let mut cursor = Cursor::new(Vec::new());
        "udp6".to_string().write_xdr(&mut cursor).unwrap();

        assert_eq!(cursor.get_ref()[..], b"\x00\x00\x00\x04udp6"[..]);
    }

    #[test]
    fn truncated_is_an_error() {
        let mut cursor = Cursor::new(b"\x00\x00\x00\x08abc");
        let mut s = String::new();

        assert!(s.read_xdr(&mut cursor).is_err());
    }

    #[test]
    fn invalid_utf8_is_an_error() {
        let mut cursor = Cursor::new(b"\x00\x00\x00\x02\xff\xfe\x00\x00");
        let mut s = String::new();

        assert!(s.read_xdr(&mut cursor).is_err());
    }
}

#[cfg(test)]
mod test_xdr_opaque {
    use std::io::Cursor;

    use super::{Opaque, XdrDecode, XdrEncode};

    #[test]
    fn decode() {
        let mut cursor = Cursor::new(b"\x00\x00\x00\x02\x01\x02\x00\x00");
        let mut o = Opaque::default();
        o.read_xdr(&mut cursor).unwrap();

        assert_eq!(o.0, vec![1u8, 2u8]);
    }

    #[test]
    fn encode() {
        let mut cursor = Cursor::new(Vec::new());
        Opaque(vec![1, 2, 3, 4, 5]).write_xdr(&mut cursor).unwrap();

        assert_eq!(
            cursor.get_ref()[..],
            b"\x00\x00\x00\x05\x01\x02\x03\x04\x05\x00\x00\x00"[..]
        );
    }
}


#[cfg(test)]
mod test_xdr_optional {
    use std::io::Cursor;

    use super::{XdrDecode, XdrEncode};

    #[test]
    fn present_and_absent() {
        let mut cursor = Cursor::new(Vec::new());
        Some(7u32).write_xdr(&mut cursor).unwrap();
        None::<u32>.write_xdr(&mut cursor).unwrap();

        assert_eq!(
            cursor.get_ref()[..],
            b"\x00\x00\x00\x01\x00\x00\x00\x07\x00\x00\x00\x00"[..]
        );

        cursor.set_position(0);
        let mut a: Option<u32> = None;
        let mut b: Option<u32> = Some(1);
        a.read_xdr(&mut cursor).unwrap();
        b.read_xdr(&mut cursor).unwrap();

        assert_eq!(a, Some(7));
        assert_eq!(b, None);
    }
}
