//! Serialization of the CQL binary-protocol notation types
//! (`[short]`, `[int]`, `[string]`, `[long string]`, ...).

use bytes::{Buf, BufMut};
use std::collections::HashMap;
use std::str;
use thiserror::Error;

/// An error that occurred while decoding one of the notation types.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum ParseError {
    #[error("Not enough bytes: expected {expected}, {received} remain")]
    TooFewBytesReceived { expected: usize, received: usize },
    #[error("Length {0} does not fit the expected type")]
    InvalidLength(i32),
    #[error("String is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] str::Utf8Error),
    #[error("Unknown consistency value: {0}")]
    UnknownConsistency(u16),
}

impl From<std::num::TryFromIntError> for ParseError {
    fn from(_: std::num::TryFromIntError) -> Self {
        ParseError::InvalidLength(-1)
    }
}

fn ensure_remaining(buf: &[u8], count: usize) -> Result<(), ParseError> {
    if buf.len() < count {
        return Err(ParseError::TooFewBytesReceived {
            expected: count,
            received: buf.len(),
        });
    }
    Ok(())
}

pub(crate) fn read_raw_bytes<'a>(count: usize, buf: &mut &'a [u8]) -> Result<&'a [u8], ParseError> {
    ensure_remaining(buf, count)?;
    let (ret, rest) = buf.split_at(count);
    *buf = rest;
    Ok(ret)
}

pub fn read_byte(buf: &mut &[u8]) -> Result<u8, ParseError> {
    ensure_remaining(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn read_int(buf: &mut &[u8]) -> Result<i32, ParseError> {
    ensure_remaining(buf, 4)?;
    Ok(buf.get_i32())
}

pub fn write_int(v: i32, buf: &mut impl BufMut) {
    buf.put_i32(v);
}

pub(crate) fn read_int_length(buf: &mut &[u8]) -> Result<usize, ParseError> {
    let v = read_int(buf)?;
    usize::try_from(v).map_err(|_| ParseError::InvalidLength(v))
}

pub(crate) fn write_int_length(v: usize, buf: &mut impl BufMut) -> Result<(), ParseError> {
    let v: i32 = v.try_into()?;
    write_int(v, buf);
    Ok(())
}

#[test]
fn type_int() {
    let vals = [i32::MIN, -1, 0, 1, i32::MAX];
    for val in vals.iter() {
        let mut buf = Vec::new();
        write_int(*val, &mut buf);
        assert_eq!(read_int(&mut &buf[..]).unwrap(), *val);
    }
}

pub fn read_short(buf: &mut &[u8]) -> Result<u16, ParseError> {
    ensure_remaining(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn write_short(v: u16, buf: &mut impl BufMut) {
    buf.put_u16(v);
}

pub(crate) fn read_short_length(buf: &mut &[u8]) -> Result<usize, ParseError> {
    let v = read_short(buf)?;
    Ok(v.into())
}

pub(crate) fn write_short_length(v: usize, buf: &mut impl BufMut) -> Result<(), ParseError> {
    let v: u16 = v.try_into()?;
    write_short(v, buf);
    Ok(())
}

#[test]
fn type_short() {
    let vals: [u16; 3] = [0, 1, u16::MAX];
    for val in vals.iter() {
        let mut buf = Vec::new();
        write_short(*val, &mut buf);
        assert_eq!(read_short(&mut &buf[..]).unwrap(), *val);
    }
}

pub fn read_bytes_opt<'a>(buf: &mut &'a [u8]) -> Result<Option<&'a [u8]>, ParseError> {
    let len = read_int(buf)?;
    if len < 0 {
        return Ok(None);
    }
    Ok(Some(read_raw_bytes(len as usize, buf)?))
}

pub fn write_bytes_opt(v: Option<&[u8]>, buf: &mut impl BufMut) -> Result<(), ParseError> {
    match v {
        Some(bytes) => {
            write_int_length(bytes.len(), buf)?;
            buf.put_slice(bytes);
        }
        None => write_int(-1, buf),
    }
    Ok(())
}

pub fn read_short_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], ParseError> {
    let len = read_short_length(buf)?;
    read_raw_bytes(len, buf)
}

pub fn write_short_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), ParseError> {
    write_short_length(v.len(), buf)?;
    buf.put_slice(v);
    Ok(())
}

#[test]
fn type_short_bytes() {
    let vals: [&[u8]; 2] = [&[], &[1, 2, 3]];
    for val in vals.iter() {
        let mut buf = Vec::new();
        write_short_bytes(val, &mut buf).unwrap();
        assert_eq!(read_short_bytes(&mut &buf[..]).unwrap(), *val);
    }
}

pub fn read_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, ParseError> {
    let len = read_short_length(buf)?;
    let raw = read_raw_bytes(len, buf)?;
    Ok(str::from_utf8(raw)?)
}

pub fn write_string(v: &str, buf: &mut impl BufMut) -> Result<(), ParseError> {
    write_short_length(v.len(), buf)?;
    buf.put_slice(v.as_bytes());
    Ok(())
}

#[test]
fn type_string() {
    let vals = [String::from(""), String::from("hello, world!")];
    for val in vals.iter() {
        let mut buf = Vec::new();
        write_string(val, &mut buf).unwrap();
        assert_eq!(read_string(&mut &buf[..]).unwrap(), *val);
    }
}

pub fn read_long_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, ParseError> {
    let len = read_int_length(buf)?;
    let raw = read_raw_bytes(len, buf)?;
    Ok(str::from_utf8(raw)?)
}

pub fn write_long_string(v: &str, buf: &mut impl BufMut) -> Result<(), ParseError> {
    write_int_length(v.len(), buf)?;
    buf.put_slice(v.as_bytes());
    Ok(())
}

#[test]
fn type_long_string() {
    let vals = [String::from(""), String::from("hello, world!")];
    for val in vals.iter() {
        let mut buf = Vec::new();
        write_long_string(val, &mut buf).unwrap();
        assert_eq!(read_long_string(&mut &buf[..]).unwrap(), *val);
    }
}

pub fn read_string_map(buf: &mut &[u8]) -> Result<HashMap<String, String>, ParseError> {
    let len = read_short_length(buf)?;
    let mut v = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = read_string(buf)?.to_owned();
        v.insert(key, val);
    }
    Ok(v)
}

pub fn write_string_map(
    v: &HashMap<impl AsRef<str>, impl AsRef<str>>,
    buf: &mut impl BufMut,
) -> Result<(), ParseError> {
    write_short_length(v.len(), buf)?;
    for (key, val) in v.iter() {
        write_string(key.as_ref(), buf)?;
        write_string(val.as_ref(), buf)?;
    }
    Ok(())
}

#[test]
fn type_string_map() {
    let mut val = HashMap::new();
    val.insert(String::from("CQL_VERSION"), String::from("3.0.0"));
    val.insert(String::from("COMPRESSION"), String::from(""));
    let mut buf = Vec::new();
    write_string_map(&val, &mut buf).unwrap();
    assert_eq!(read_string_map(&mut &buf[..]).unwrap(), val);
}

/// CQL consistency level, carried in QUERY and EXECUTE parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum Consistency {
    Any = 0x0000,
    #[default]
    One = 0x0001,
    Two = 0x0002,
    Three = 0x0003,
    Quorum = 0x0004,
    All = 0x0005,
    LocalQuorum = 0x0006,
    EachQuorum = 0x0007,
    LocalOne = 0x000A,
}

pub fn read_consistency(buf: &mut &[u8]) -> Result<Consistency, ParseError> {
    let raw = read_short(buf)?;
    let parsed = match raw {
        0x0000 => Consistency::Any,
        0x0001 => Consistency::One,
        0x0002 => Consistency::Two,
        0x0003 => Consistency::Three,
        0x0004 => Consistency::Quorum,
        0x0005 => Consistency::All,
        0x0006 => Consistency::LocalQuorum,
        0x0007 => Consistency::EachQuorum,
        0x000A => Consistency::LocalOne,
        other => return Err(ParseError::UnknownConsistency(other)),
    };
    Ok(parsed)
}

pub fn write_consistency(c: Consistency, buf: &mut impl BufMut) {
    write_short(c as u16, buf);
}

#[test]
fn type_consistency() {
    let vals = [Consistency::One, Consistency::Quorum, Consistency::LocalOne];
    for val in vals.iter() {
        let mut buf = Vec::new();
        write_consistency(*val, &mut buf);
        assert_eq!(read_consistency(&mut &buf[..]).unwrap(), *val);
    }
}
