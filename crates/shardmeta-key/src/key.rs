//! Shard keys
//!
//! A `ShardKey` is a key type plus its raw bytes. The raw bytes are the
//! canonical encoding with trailing zeros removed (all types except
//! `Binary`), the empty sequence for the minimum sentinel, or absent for
//! the maximum sentinel.

use crate::error::KeyError;
use crate::key_type::{MAX_BINARY_KEY_LEN, ShardKeyType};
use crate::time::MAX_DATETIME_TICKS;
use crate::value::{
    self, ShardKeyValue, ZERO_OFFSET_COMPONENT, check_binary_len, decode_i64, pad_fixed,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Immutable, canonically encoded shard key
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawShardKey", into = "RawShardKey")]
pub struct ShardKey {
    key_type: ShardKeyType,
    /// `None` is the maximum sentinel
    raw: Option<Vec<u8>>,
}

impl ShardKey {
    /// Create a key from a typed value
    pub fn new(value: impl Into<ShardKeyValue>) -> Result<Self, KeyError> {
        let value = value.into();
        let key_type = value.key_type();
        let bytes = value::encode(&value)?;
        Ok(Self {
            key_type,
            raw: Some(canonicalize(key_type, bytes)),
        })
    }

    /// Rebuild a key from raw bytes as stored in a metadata row
    pub fn from_raw(key_type: ShardKeyType, raw: &[u8]) -> Result<Self, KeyError> {
        let bytes = if key_type.is_fixed_length() {
            pad_fixed(key_type, raw)?
        } else {
            check_binary_len(raw)?;
            raw.to_vec()
        };
        Ok(Self {
            key_type,
            raw: Some(canonicalize(key_type, bytes)),
        })
    }

    /// Rebuild a key from an optional raw value, `None` being the maximum
    pub fn from_raw_opt(key_type: ShardKeyType, raw: Option<&[u8]>) -> Result<Self, KeyError> {
        match raw {
            Some(raw) => Self::from_raw(key_type, raw),
            None => Ok(Self::max(key_type)),
        }
    }

    /// Minimum sentinel: sorts at or below every value of the type
    #[must_use]
    pub const fn min(key_type: ShardKeyType) -> Self {
        Self {
            key_type,
            raw: Some(Vec::new()),
        }
    }

    /// Maximum sentinel: sorts above every value of the type
    #[must_use]
    pub const fn max(key_type: ShardKeyType) -> Self {
        Self {
            key_type,
            raw: None,
        }
    }

    #[must_use]
    pub const fn key_type(&self) -> ShardKeyType {
        self.key_type
    }

    /// Raw stored bytes; `None` for the maximum sentinel
    #[must_use]
    pub fn raw_value(&self) -> Option<&[u8]> {
        self.raw.as_deref()
    }

    #[must_use]
    pub const fn is_max(&self) -> bool {
        self.raw.is_none()
    }

    #[must_use]
    pub fn is_min(&self) -> bool {
        self.raw.as_ref().is_some_and(Vec::is_empty)
    }

    /// Raw bytes zero-padded to the canonical length.
    ///
    /// Binary keys are returned unpadded since their length is significant.
    #[must_use]
    pub fn canonical_bytes(&self) -> Option<Vec<u8>> {
        let raw = self.raw.as_ref()?;
        if self.key_type.trailing_zeros_significant() {
            return Some(raw.clone());
        }
        let mut bytes = raw.clone();
        bytes.resize(self.key_type.byte_len(), 0);
        Some(bytes)
    }

    /// Decode the typed value; `None` for the maximum sentinel
    pub fn value(&self) -> Result<Option<ShardKeyValue>, KeyError> {
        self.raw
            .as_ref()
            .map(|raw| value::decode(self.key_type, raw))
            .transpose()
    }

    /// The next key in canonical order.
    ///
    /// The raw value is widened to the type's full length (128 bytes for
    /// `Binary`) and incremented as an unsigned big-endian integer. Overflow,
    /// or a step past the last representable date, yields the maximum
    /// sentinel.
    pub fn successor(&self) -> Result<Self, KeyError> {
        let raw = self
            .raw
            .as_ref()
            .ok_or(KeyError::NoSuccessor(self.key_type))?;

        let width = self.key_type.successor_width();
        let mut buf = vec![0u8; width];
        let n = raw.len().min(width);
        buf[..n].copy_from_slice(&raw[..n]);

        if !increment(&mut buf) {
            return Ok(Self::max(self.key_type));
        }

        match self.key_type {
            ShardKeyType::DateTime if decode_i64(&buf) > MAX_DATETIME_TICKS => {
                return Ok(Self::max(self.key_type));
            }
            ShardKeyType::DateTimeOffset => {
                if decode_i64(&buf) > MAX_DATETIME_TICKS {
                    return Ok(Self::max(self.key_type));
                }
                buf.extend_from_slice(&ZERO_OFFSET_COMPONENT);
            }
            _ => {}
        }

        Self::from_raw(self.key_type, &buf)
    }

    /// Check that this key has the expected type
    pub fn expect_type(&self, expected: ShardKeyType) -> Result<(), KeyError> {
        if self.key_type == expected {
            Ok(())
        } else {
            Err(KeyError::TypeMismatch {
                expected,
                actual: self.key_type,
            })
        }
    }
}

/// Increment a big-endian unsigned integer in place; false on overflow
fn increment(buf: &mut [u8]) -> bool {
    for byte in buf.iter_mut().rev() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            return true;
        }
    }
    false
}

fn canonicalize(key_type: ShardKeyType, mut bytes: Vec<u8>) -> Vec<u8> {
    if !key_type.trailing_zeros_significant() {
        let len = bytes.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        bytes.truncate(len);
    }
    bytes
}

impl PartialOrd for ShardKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ShardKey {
    /// Keys of one type compare by raw bytes with the maximum sentinel on
    /// top. Keys of different types are ordered by type first so the order
    /// stays total; that ordering carries no meaning.
    fn cmp(&self, other: &Self) -> Ordering {
        self.key_type
            .cmp(&other.key_type)
            .then_with(|| match (&self.raw, &other.raw) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl fmt::Debug for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.raw {
            Some(raw) => write!(f, "ShardKey({}, 0x{})", self.key_type, hex::encode(raw)),
            None => write!(f, "ShardKey({}, +inf)", self.key_type),
        }
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value() {
            Ok(Some(value)) => write!(f, "{value}"),
            Ok(None) => f.write_str("+inf"),
            Err(_) if self.is_min() => f.write_str("-inf"),
            Err(_) => write!(
                f,
                "0x{}",
                hex::encode(self.raw.as_deref().unwrap_or_default())
            ),
        }
    }
}

/// Serialized form of a `ShardKey`, validated on the way back in
#[derive(Serialize, Deserialize)]
struct RawShardKey {
    key_type: ShardKeyType,
    raw: Option<Vec<u8>>,
}

impl TryFrom<RawShardKey> for ShardKey {
    type Error = KeyError;

    fn try_from(value: RawShardKey) -> Result<Self, Self::Error> {
        Self::from_raw_opt(value.key_type, value.raw.as_deref())
    }
}

impl From<ShardKey> for RawShardKey {
    fn from(key: ShardKey) -> Self {
        Self {
            key_type: key.key_type,
            raw: key.raw,
        }
    }
}

/// Largest concrete key of a type
#[must_use]
pub fn max_concrete(key_type: ShardKeyType) -> ShardKey {
    let raw = match key_type {
        ShardKeyType::Binary => vec![0xff; MAX_BINARY_KEY_LEN],
        ShardKeyType::DateTime => {
            let mut b = MAX_DATETIME_TICKS.to_be_bytes();
            b[0] ^= 0x80;
            b.to_vec()
        }
        ShardKeyType::DateTimeOffset => {
            let mut b = MAX_DATETIME_TICKS.to_be_bytes().to_vec();
            b[0] ^= 0x80;
            b.extend_from_slice(&ZERO_OFFSET_COMPONENT);
            b
        }
        other => vec![0xff; other.byte_len()],
    };
    ShardKey {
        key_type,
        raw: Some(canonicalize(key_type, raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{DateTime, DateTimeOffset, TimeSpan};
    use rand::Rng;
    use uuid::Uuid;

    fn int32(v: i32) -> ShardKey {
        ShardKey::new(v).unwrap()
    }

    fn guid(s: &str) -> ShardKey {
        ShardKey::new(Uuid::parse_str(s).unwrap()).unwrap()
    }

    #[test]
    fn test_raw_value_truncates_trailing_zeros() {
        assert_eq!(int32(0).raw_value().unwrap(), &[0x80]);
        assert_eq!(int32(1).raw_value().unwrap(), &[0x80, 0, 0, 1]);
        assert_eq!(
            ShardKey::new(vec![1u8, 0, 0]).unwrap().raw_value().unwrap(),
            &[1, 0, 0]
        );
    }

    #[test]
    fn test_type_minimum_is_min_sentinel() {
        assert_eq!(int32(i32::MIN), ShardKey::min(ShardKeyType::Int32));
        assert_eq!(
            ShardKey::new(i64::MIN).unwrap(),
            ShardKey::min(ShardKeyType::Int64)
        );
        assert_eq!(
            ShardKey::new(Uuid::nil()).unwrap(),
            ShardKey::min(ShardKeyType::Guid)
        );
        assert!(ShardKey::new(Vec::<u8>::new()).unwrap().is_min());
        // DateTime's first day sits above the sentinel
        assert!(ShardKey::new(DateTime::MIN).unwrap() > ShardKey::min(ShardKeyType::DateTime));
    }

    #[test]
    fn test_round_trip_all_types() {
        let values: Vec<ShardKeyValue> = vec![
            0i32.into(),
            i32::MAX.into(),
            (-7i64).into(),
            Uuid::new_v4().into(),
            vec![0u8, 1, 0].into(),
            DateTime::from_ticks(1).unwrap().into(),
            TimeSpan::from_ticks(i64::MAX).into(),
            DateTimeOffset::from_utc_ticks(99).unwrap().into(),
        ];
        for value in values {
            let key = ShardKey::new(value.clone()).unwrap();
            assert_eq!(key.value().unwrap().unwrap(), value);
            let rebuilt = ShardKey::from_raw(key.key_type(), key.raw_value().unwrap()).unwrap();
            assert_eq!(rebuilt, key);
        }
    }

    #[test]
    fn test_zero_pad_tolerance_fixed_types() {
        for key in [
            int32(5),
            ShardKey::new(1i64 << 40).unwrap(),
            guid("00000000-0000-0000-0000-000000000100"),
            ShardKey::new(DateTime::from_ticks(10).unwrap()).unwrap(),
            ShardKey::new(TimeSpan::from_ticks(-10)).unwrap(),
            ShardKey::new(DateTimeOffset::from_utc_ticks(10).unwrap()).unwrap(),
        ] {
            let mut padded = key.raw_value().unwrap().to_vec();
            padded.resize(key.key_type().byte_len(), 0);
            let rebuilt = ShardKey::from_raw(key.key_type(), &padded).unwrap();
            assert_eq!(rebuilt, key);
            assert_eq!(rebuilt.value().unwrap(), key.value().unwrap());
        }
    }

    #[test]
    fn test_binary_padding_is_a_different_greater_key() {
        let short = ShardKey::new(vec![1u8, 2]).unwrap();
        let padded = ShardKey::new(vec![1u8, 2, 0]).unwrap();
        assert_ne!(short, padded);
        assert!(padded > short);
    }

    #[test]
    fn test_ordering_matches_values() {
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let a: i32 = rng.r#gen();
            let b: i32 = rng.r#gen();
            assert_eq!(a.cmp(&b), int32(a).cmp(&int32(b)));
        }
        let max = ShardKey::max(ShardKeyType::Int32);
        assert!(int32(i32::MAX) < max);
        assert!(ShardKey::min(ShardKeyType::Int32) <= int32(i32::MIN));
        assert!(ShardKey::min(ShardKeyType::Int32) < int32(i32::MIN + 1));
    }

    #[test]
    fn test_successor() {
        assert_eq!(int32(5).successor().unwrap(), int32(6));
        assert_eq!(int32(-1).successor().unwrap(), int32(0));
        assert_eq!(
            ShardKey::min(ShardKeyType::Int32).successor().unwrap(),
            int32(i32::MIN + 1)
        );
        assert!(int32(i32::MAX).successor().unwrap().is_max());
        assert!(matches!(
            ShardKey::max(ShardKeyType::Int32).successor(),
            Err(KeyError::NoSuccessor(ShardKeyType::Int32))
        ));
    }

    #[test]
    fn test_successor_of_max_concrete_is_max() {
        for t in ShardKeyType::ALL {
            let key = max_concrete(t);
            assert!(!key.is_max());
            assert!(key.successor().unwrap().is_max(), "{t}");
        }
    }

    #[test]
    fn test_successor_is_strictly_greater() {
        let keys = vec![
            ShardKey::new(vec![0xffu8]).unwrap(),
            ShardKey::new(vec![0u8; 3]).unwrap(),
            ShardKey::min(ShardKeyType::Binary),
            guid("ffffffff-ffff-ffff-ffff-fffffffffffe"),
            ShardKey::new(DateTime::MIN).unwrap(),
            ShardKey::new(DateTimeOffset::from_utc_ticks(0).unwrap()).unwrap(),
            ShardKey::new(TimeSpan::from_ticks(-1)).unwrap(),
        ];
        for key in keys {
            let next = key.successor().unwrap();
            assert!(next > key, "{key:?} -> {next:?}");
        }
    }

    #[test]
    fn test_binary_successor_widens_to_max_length() {
        let next = ShardKey::new(vec![1u8]).unwrap().successor().unwrap();
        let raw = next.raw_value().unwrap();
        assert_eq!(raw.len(), MAX_BINARY_KEY_LEN);
        assert_eq!(raw[0], 1);
        assert_eq!(raw[MAX_BINARY_KEY_LEN - 1], 1);
    }

    #[test]
    fn test_datetime_offset_successor_steps_instant() {
        let key = ShardKey::new(DateTimeOffset::new(1_000, 90).unwrap()).unwrap();
        let next = key.successor().unwrap();
        assert_eq!(
            next.value().unwrap().unwrap(),
            ShardKeyValue::DateTimeOffset(DateTimeOffset::from_utc_ticks(1_001).unwrap())
        );
    }

    #[test]
    fn test_guid_ordering_fixture() {
        // Descending order as the engine sorts uniqueidentifier values
        let descending = [
            "ffffffff-ffff-ffff-ffff-ffffffffffff",
            "00000000-0000-0000-0000-010000000000",
            "00000000-0000-0000-0000-000100000000",
            "00000000-0000-0000-0000-000001000000",
            "00000000-0000-0000-0000-000000010000",
            "00000000-0000-0000-0000-000000000100",
            "00000000-0000-0000-0000-000000000001",
            "00000000-0000-0000-0100-000000000000",
            "00000000-0000-0000-0001-000000000000",
            "00000000-0000-0001-0000-000000000000",
            "00000000-0000-0100-0000-000000000000",
            "00000000-0001-0000-0000-000000000000",
            "00000000-0100-0000-0000-000000000000",
            "00000001-0000-0000-0000-000000000000",
            "00000100-0000-0000-0000-000000000000",
            "00010000-0000-0000-0000-000000000000",
            "01000000-0000-0000-0000-000000000000",
            "00000000-0000-0000-0000-000000000000",
        ];
        assert_eq!(descending.len(), 18);
        let keys: Vec<ShardKey> = descending.iter().map(|s| guid(s)).collect();
        for pair in keys.windows(2) {
            assert!(pair[0] > pair[1], "{:?} should sort above {:?}", pair[0], pair[1]);
        }

        let mut shuffled = keys.clone();
        shuffled.reverse();
        shuffled.sort_by(|a, b| b.cmp(a));
        assert_eq!(shuffled, keys);

        assert!(
            guid("00000000-0000-0000-0000-000000000001")
                < guid("00000000-0000-0000-0000-000000000100")
        );
    }

    #[test]
    fn test_datetime_offset_collision() {
        let a = ShardKey::new(DateTimeOffset::new(5_000_000_000, 330).unwrap()).unwrap();
        let b = ShardKey::new(DateTimeOffset::new(5_000_000_000, -480).unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_from_raw_rejects_oversized() {
        assert!(ShardKey::from_raw(ShardKeyType::Binary, &[1u8; 129]).is_err());
        assert!(ShardKey::from_raw(ShardKeyType::Int32, &[1, 2, 3, 4, 5]).is_err());
        assert_eq!(
            ShardKey::from_raw(ShardKeyType::Int32, &[0x80, 0, 0, 0, 0]).unwrap(),
            int32(0)
        );
    }

    #[test]
    fn test_serde_round_trip() {
        let keys = [
            int32(17),
            ShardKey::max(ShardKeyType::Guid),
            ShardKey::new(vec![0u8, 0]).unwrap(),
        ];
        for key in keys {
            let json = serde_json::to_string(&key).unwrap();
            let back: ShardKey = serde_json::from_str(&json).unwrap();
            assert_eq!(back, key);
        }
        let bad = r#"{"key_type":"Int32","raw":[1,2,3,4,5]}"#;
        assert!(serde_json::from_str::<ShardKey>(bad).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(int32(-3).to_string(), "-3");
        assert_eq!(ShardKey::max(ShardKeyType::Int64).to_string(), "+inf");
        assert_eq!(ShardKey::min(ShardKeyType::DateTime).to_string(), "-inf");
        assert_eq!(ShardKey::new(vec![0xabu8]).unwrap().to_string(), "0xab");
    }
}
