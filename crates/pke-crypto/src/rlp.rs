//! Canonical length-prefixed list codec.
//!
//! Byte strings and nested lists are encoded with minimal prefixes:
//! - a single byte below `0x80` is its own encoding
//! - payloads shorter than 56 bytes get one prefix byte (`0x80 + len`, `0xc0 + len`)
//! - longer payloads get `0xb7 + n` / `0xf7 + n` followed by an `n`-byte
//!   big-endian length with no leading zeros
//!
//! `decode` accepts only the canonical form, so `encode(decode(b)) == b`
//! for every input it returns `Ok` for.

use alloy_primitives::{Address, U256};
use thiserror::Error;

const STRING_OFFSET: u8 = 0x80;
const LIST_OFFSET: u8 = 0xc0;
const SHORT_LIMIT: usize = 56;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("input truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("non-canonical encoding: {0}")]
    NonCanonical(&'static str),
    #[error("{0} trailing bytes after item")]
    TrailingBytes(usize),
    #[error("length prefix overflows")]
    LengthOverflow,
    #[error("unexpected item shape: expected {0}")]
    UnexpectedShape(&'static str),
    #[error("integer does not fit in {0} bytes")]
    IntegerOverflow(usize),
}

/// A node of the encoding tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Bytes(Vec<u8>),
    List(Vec<Item>),
    /// Already-encoded item spliced in verbatim. Never produced by `decode`.
    Raw(Vec<u8>),
}

impl Item {
    pub fn bytes(b: impl Into<Vec<u8>>) -> Self {
        Item::Bytes(b.into())
    }

    /// The empty byte string, encoded as `0x80`.
    pub fn empty() -> Self {
        Item::Bytes(Vec::new())
    }

    pub fn empty_list() -> Self {
        Item::List(Vec::new())
    }

    pub fn uint(v: u64) -> Self {
        Item::uint_be(&v.to_be_bytes())
    }

    pub fn uint128(v: u128) -> Self {
        Item::uint_be(&v.to_be_bytes())
    }

    pub fn u256(v: U256) -> Self {
        Item::uint_be(&v.to_be_bytes::<32>())
    }

    /// Big-endian unsigned integer; leading zeros are dropped so zero becomes
    /// the empty string.
    pub fn uint_be(bytes: &[u8]) -> Self {
        Item::Bytes(trim_leading_zeros(bytes).to_vec())
    }

    pub fn address(a: &Address) -> Self {
        Item::Bytes(a.as_slice().to_vec())
    }

    pub fn as_bytes(&self) -> Result<&[u8], CodecError> {
        match self {
            Item::Bytes(b) => Ok(b),
            _ => Err(CodecError::UnexpectedShape("byte string")),
        }
    }

    pub fn as_list(&self) -> Result<&[Item], CodecError> {
        match self {
            Item::List(items) => Ok(items),
            _ => Err(CodecError::UnexpectedShape("list")),
        }
    }

    /// Interpret a byte string as a canonical unsigned integer.
    pub fn as_u64(&self) -> Result<u64, CodecError> {
        let b = self.as_bytes()?;
        if b.first() == Some(&0) {
            return Err(CodecError::NonCanonical("integer with leading zero"));
        }
        if b.len() > 8 {
            return Err(CodecError::IntegerOverflow(8));
        }
        Ok(b.iter().fold(0u64, |acc, x| (acc << 8) | u64::from(*x)))
    }
}

pub fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

// ============================================================================
// Encoding
// ============================================================================

pub fn encode(item: &Item) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(item, &mut out);
    out
}

/// Encode `items` as one list.
pub fn encode_list(items: &[Item]) -> Vec<u8> {
    let mut payload = Vec::new();
    for item in items {
        encode_into(item, &mut payload);
    }
    let mut out = Vec::with_capacity(payload.len() + 9);
    push_header(&mut out, LIST_OFFSET, payload.len());
    out.extend_from_slice(&payload);
    out
}

fn encode_into(item: &Item, out: &mut Vec<u8>) {
    match item {
        Item::Bytes(b) => {
            if b.len() == 1 && b[0] < STRING_OFFSET {
                out.push(b[0]);
            } else {
                push_header(out, STRING_OFFSET, b.len());
                out.extend_from_slice(b);
            }
        }
        Item::List(items) => out.extend_from_slice(&encode_list(items)),
        Item::Raw(raw) => out.extend_from_slice(raw),
    }
}

fn push_header(out: &mut Vec<u8>, offset: u8, len: usize) {
    if len < SHORT_LIMIT {
        out.push(offset + len as u8);
    } else {
        let len_bytes = (len as u64).to_be_bytes();
        let len_bytes = trim_leading_zeros(&len_bytes);
        out.push(offset + 55 + len_bytes.len() as u8);
        out.extend_from_slice(len_bytes);
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode exactly one item; trailing bytes are an error.
pub fn decode(input: &[u8]) -> Result<Item, CodecError> {
    let (item, used) = decode_item(input)?;
    if used != input.len() {
        return Err(CodecError::TrailingBytes(input.len() - used));
    }
    Ok(item)
}

fn decode_item(input: &[u8]) -> Result<(Item, usize), CodecError> {
    let first = *input.first().ok_or(CodecError::Truncated {
        needed: 1,
        available: 0,
    })?;

    match first {
        0x00..=0x7f => Ok((Item::Bytes(vec![first]), 1)),
        0x80..=0xb7 => {
            let len = (first - STRING_OFFSET) as usize;
            let payload = take(input, 1, len)?;
            if len == 1 && payload[0] < STRING_OFFSET {
                return Err(CodecError::NonCanonical("single byte below 0x80 wrapped in a string"));
            }
            Ok((Item::Bytes(payload.to_vec()), 1 + len))
        }
        0xb8..=0xbf => {
            let len_of_len = (first - 0xb7) as usize;
            let len = read_long_length(input, len_of_len)?;
            let payload = take(input, 1 + len_of_len, len)?;
            Ok((Item::Bytes(payload.to_vec()), 1 + len_of_len + len))
        }
        0xc0..=0xf7 => {
            let len = (first - LIST_OFFSET) as usize;
            let payload = take(input, 1, len)?;
            Ok((Item::List(decode_payload(payload)?), 1 + len))
        }
        0xf8..=0xff => {
            let len_of_len = (first - 0xf7) as usize;
            let len = read_long_length(input, len_of_len)?;
            let payload = take(input, 1 + len_of_len, len)?;
            Ok((Item::List(decode_payload(payload)?), 1 + len_of_len + len))
        }
    }
}

fn decode_payload(mut payload: &[u8]) -> Result<Vec<Item>, CodecError> {
    let mut items = Vec::new();
    while !payload.is_empty() {
        let (item, used) = decode_item(payload)?;
        items.push(item);
        payload = &payload[used..];
    }
    Ok(items)
}

fn read_long_length(input: &[u8], len_of_len: usize) -> Result<usize, CodecError> {
    let bytes = take(input, 1, len_of_len)?;
    if bytes[0] == 0 {
        return Err(CodecError::NonCanonical("leading zero in length"));
    }
    if len_of_len > std::mem::size_of::<usize>() {
        return Err(CodecError::LengthOverflow);
    }
    let len = bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
    if len < SHORT_LIMIT {
        return Err(CodecError::NonCanonical("long form used for short payload"));
    }
    Ok(len)
}

fn take(input: &[u8], start: usize, len: usize) -> Result<&[u8], CodecError> {
    let end = start.checked_add(len).ok_or(CodecError::LengthOverflow)?;
    if end > input.len() {
        return Err(CodecError::Truncated {
            needed: end,
            available: input.len(),
        });
    }
    Ok(&input[start..end])
}
