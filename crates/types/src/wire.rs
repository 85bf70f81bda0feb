//! Fixed-layout wire codec.
//!
//! Every message and certificate serializes with an explicit field order and
//! explicit integer widths (little-endian). There is no schema negotiation;
//! both ends of a connection must agree on the layout byte for byte.

use crate::{Hash, Signature};
use thiserror::Error;

/// Errors from decoding wire bytes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),
    #[error("length out of range: {0}")]
    LengthOverflow(&'static str),
    #[error("trailing bytes after message")]
    TrailingBytes,
}

/// Types that serialize to the wire.
pub trait WireEncode {
    fn encode(&self, out: &mut Vec<u8>);

    fn to_wire_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

/// Types that deserialize from the wire.
pub trait WireDecode: Sized {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError>;

    /// Decode and require the input to be fully consumed.
    fn from_wire_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let mut input = bytes;
        let value = Self::decode(&mut input)?;
        if !input.is_empty() {
            return Err(WireError::TrailingBytes);
        }
        Ok(value)
    }
}

pub fn put_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_i8(out: &mut Vec<u8>, v: i8) {
    out.push(v as u8);
}

pub fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes);
}

pub fn put_hash(out: &mut Vec<u8>, hash: &Hash) {
    out.extend_from_slice(hash.as_bytes());
}

pub fn put_signature(out: &mut Vec<u8>, sig: &Signature) {
    out.extend_from_slice(&sig.to_bytes());
}

/// Convert a collection length to a `u32` count field.
pub fn len_to_u32(len: usize, what: &'static str) -> Result<u32, WireError> {
    u32::try_from(len).map_err(|_| WireError::LengthOverflow(what))
}

pub fn get_u8(input: &mut &[u8]) -> Result<u8, WireError> {
    let (&first, rest) = input.split_first().ok_or(WireError::UnexpectedEof)?;
    *input = rest;
    Ok(first)
}

pub fn get_u16(input: &mut &[u8]) -> Result<u16, WireError> {
    let bytes = get_bytes(input, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub fn get_u32(input: &mut &[u8]) -> Result<u32, WireError> {
    let bytes = get_bytes(input, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn get_i8(input: &mut &[u8]) -> Result<i8, WireError> {
    Ok(get_u8(input)? as i8)
}

pub fn get_bytes<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], WireError> {
    if input.len() < n {
        return Err(WireError::UnexpectedEof);
    }
    let (taken, rest) = input.split_at(n);
    *input = rest;
    Ok(taken)
}

pub fn get_hash(input: &mut &[u8]) -> Result<Hash, WireError> {
    let bytes = get_bytes(input, Hash::LEN)?;
    let mut raw = [0u8; Hash::LEN];
    raw.copy_from_slice(bytes);
    Ok(Hash::from_bytes(raw))
}

pub fn get_signature(input: &mut &[u8]) -> Result<Signature, WireError> {
    let bytes = get_bytes(input, 64)?;
    let mut raw = [0u8; 64];
    raw.copy_from_slice(bytes);
    Ok(Signature::from_bytes(raw))
}

impl WireEncode for Hash {
    fn encode(&self, out: &mut Vec<u8>) {
        put_hash(out, self);
    }
}

impl WireDecode for Hash {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        get_hash(input)
    }
}
