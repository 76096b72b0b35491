//! Typed key values and the canonical byte codec
//!
//! Every encoding is chosen so that comparing canonical byte strings as
//! unsigned bytes, left to right, reproduces the engine's ordering:
//!
//! - signed integers and tick counts: big-endian with the sign bit flipped
//! - GUIDs: the engine's comparison order (node bytes first, then the
//!   clock sequence, then the time fields from least to most significant)
//! - binary: identity
//! - date/time offsets: the UTC instant followed by a zero-offset component

use crate::error::KeyError;
use crate::key_type::{MAX_BINARY_KEY_LEN, ShardKeyType};
use crate::time::{DateTime, DateTimeOffset, TimeSpan};
use std::fmt;
use uuid::Uuid;

/// A typed shard key value
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShardKeyValue {
    Int32(i32),
    Int64(i64),
    Guid(Uuid),
    Binary(Vec<u8>),
    DateTime(DateTime),
    TimeSpan(TimeSpan),
    DateTimeOffset(DateTimeOffset),
}

impl ShardKeyValue {
    #[must_use]
    pub const fn key_type(&self) -> ShardKeyType {
        match self {
            Self::Int32(_) => ShardKeyType::Int32,
            Self::Int64(_) => ShardKeyType::Int64,
            Self::Guid(_) => ShardKeyType::Guid,
            Self::Binary(_) => ShardKeyType::Binary,
            Self::DateTime(_) => ShardKeyType::DateTime,
            Self::TimeSpan(_) => ShardKeyType::TimeSpan,
            Self::DateTimeOffset(_) => ShardKeyType::DateTimeOffset,
        }
    }
}

impl fmt::Display for ShardKeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Guid(v) => write!(f, "{v}"),
            Self::Binary(v) => write!(f, "0x{}", hex::encode(v)),
            Self::DateTime(v) => write!(f, "{v}"),
            Self::TimeSpan(v) => write!(f, "{v}"),
            Self::DateTimeOffset(v) => write!(f, "{v}"),
        }
    }
}

impl From<i32> for ShardKeyValue {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for ShardKeyValue {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<Uuid> for ShardKeyValue {
    fn from(v: Uuid) -> Self {
        Self::Guid(v)
    }
}

impl From<Vec<u8>> for ShardKeyValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Binary(v)
    }
}

impl From<&[u8]> for ShardKeyValue {
    fn from(v: &[u8]) -> Self {
        Self::Binary(v.to_vec())
    }
}

impl From<DateTime> for ShardKeyValue {
    fn from(v: DateTime) -> Self {
        Self::DateTime(v)
    }
}

impl From<TimeSpan> for ShardKeyValue {
    fn from(v: TimeSpan) -> Self {
        Self::TimeSpan(v)
    }
}

impl From<DateTimeOffset> for ShardKeyValue {
    fn from(v: DateTimeOffset) -> Self {
        Self::DateTimeOffset(v)
    }
}

/// Encode a value into its canonical byte form.
///
/// Fixed-length types always produce `byte_len` bytes. Binary values are
/// returned as-is and must not exceed 128 bytes.
pub fn encode(value: &ShardKeyValue) -> Result<Vec<u8>, KeyError> {
    let bytes = match value {
        ShardKeyValue::Int32(v) => encode_i32(*v).to_vec(),
        ShardKeyValue::Int64(v) => encode_i64(*v).to_vec(),
        ShardKeyValue::Guid(v) => encode_guid(*v).to_vec(),
        ShardKeyValue::Binary(v) => {
            if v.len() > MAX_BINARY_KEY_LEN {
                return Err(KeyError::InvalidLength {
                    key_type: ShardKeyType::Binary,
                    len: v.len(),
                    max: MAX_BINARY_KEY_LEN,
                });
            }
            v.clone()
        }
        ShardKeyValue::DateTime(v) => encode_i64(v.ticks()).to_vec(),
        ShardKeyValue::TimeSpan(v) => encode_i64(v.ticks()).to_vec(),
        ShardKeyValue::DateTimeOffset(v) => encode_datetime_offset(v.utc_ticks()).to_vec(),
    };
    Ok(bytes)
}

/// Decode a byte sequence of the given type into a value.
///
/// Inputs shorter than the canonical length are right-padded with zeros.
/// Longer inputs are accepted only if every excess byte is zero.
pub fn decode(key_type: ShardKeyType, bytes: &[u8]) -> Result<ShardKeyValue, KeyError> {
    let value = match key_type {
        ShardKeyType::Binary => {
            check_binary_len(bytes)?;
            ShardKeyValue::Binary(bytes.to_vec())
        }
        ShardKeyType::Int32 => ShardKeyValue::Int32(decode_i32(&pad_fixed(key_type, bytes)?)),
        ShardKeyType::Int64 => ShardKeyValue::Int64(decode_i64(&pad_fixed(key_type, bytes)?)),
        ShardKeyType::Guid => ShardKeyValue::Guid(decode_guid(&pad_fixed(key_type, bytes)?)),
        ShardKeyType::DateTime => {
            let ticks = decode_i64(&pad_fixed(key_type, bytes)?);
            ShardKeyValue::DateTime(DateTime::from_ticks(ticks)?)
        }
        ShardKeyType::TimeSpan => {
            ShardKeyValue::TimeSpan(TimeSpan::from_ticks(decode_i64(&pad_fixed(key_type, bytes)?)))
        }
        ShardKeyType::DateTimeOffset => {
            // The offset component is not part of the key's identity
            let utc_ticks = decode_i64(&pad_fixed(key_type, bytes)?[..8]);
            ShardKeyValue::DateTimeOffset(DateTimeOffset::from_utc_ticks(utc_ticks)?)
        }
    };
    Ok(value)
}

/// Zero-pad a fixed-length raw value to its canonical length
pub(crate) fn pad_fixed(key_type: ShardKeyType, bytes: &[u8]) -> Result<Vec<u8>, KeyError> {
    let len = key_type.byte_len();
    if bytes.len() > len && bytes[len..].iter().any(|b| *b != 0) {
        return Err(KeyError::InvalidLength {
            key_type,
            len: bytes.len(),
            max: len,
        });
    }
    let mut canonical = vec![0u8; len];
    let n = bytes.len().min(len);
    canonical[..n].copy_from_slice(&bytes[..n]);
    Ok(canonical)
}

pub(crate) fn check_binary_len(bytes: &[u8]) -> Result<(), KeyError> {
    if bytes.len() > MAX_BINARY_KEY_LEN {
        return Err(KeyError::InvalidLength {
            key_type: ShardKeyType::Binary,
            len: bytes.len(),
            max: MAX_BINARY_KEY_LEN,
        });
    }
    Ok(())
}

const fn encode_i32(v: i32) -> [u8; 4] {
    let mut b = v.to_be_bytes();
    b[0] ^= 0x80;
    b
}

fn decode_i32(b: &[u8]) -> i32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&b[..4]);
    buf[0] ^= 0x80;
    i32::from_be_bytes(buf)
}

const fn encode_i64(v: i64) -> [u8; 8] {
    let mut b = v.to_be_bytes();
    b[0] ^= 0x80;
    b
}

pub(crate) fn decode_i64(b: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&b[..8]);
    buf[0] ^= 0x80;
    i64::from_be_bytes(buf)
}

/// Zero-offset component appended to every `DateTimeOffset` key
pub(crate) const ZERO_OFFSET_COMPONENT: [u8; 8] = encode_i64(0);

fn encode_datetime_offset(utc_ticks: i64) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&encode_i64(utc_ticks));
    out[8..].copy_from_slice(&ZERO_OFFSET_COMPONENT);
    out
}

// Permutation from the little-endian GUID layout (first three groups
// byte-swapped) into comparison order.
fn encode_guid(v: Uuid) -> [u8; 16] {
    let le = v.to_bytes_le();
    let mut out = [0u8; 16];
    out[0..6].copy_from_slice(&le[10..16]);
    out[6..8].copy_from_slice(&le[8..10]);
    out[8..10].copy_from_slice(&le[6..8]);
    out[10..12].copy_from_slice(&le[4..6]);
    out[12..16].copy_from_slice(&le[0..4]);
    out
}

fn decode_guid(b: &[u8]) -> Uuid {
    let mut le = [0u8; 16];
    le[10..16].copy_from_slice(&b[0..6]);
    le[8..10].copy_from_slice(&b[6..8]);
    le[6..8].copy_from_slice(&b[8..10]);
    le[4..6].copy_from_slice(&b[10..12]);
    le[0..4].copy_from_slice(&b[12..16]);
    Uuid::from_bytes_le(le)
}
