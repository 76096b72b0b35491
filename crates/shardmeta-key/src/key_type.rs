//! Shard key types and their per-type encoding policy

use crate::error::KeyError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum length of a `Binary` key in bytes
pub const MAX_BINARY_KEY_LEN: usize = 128;

/// Logical type of a shard key.
///
/// Discriminants are the values persisted in the metadata stores.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ShardKeyType {
    Int32 = 1,
    Int64 = 2,
    Guid = 3,
    Binary = 4,
    DateTime = 5,
    TimeSpan = 6,
    DateTimeOffset = 7,
}

impl ShardKeyType {
    /// All supported key types
    pub const ALL: [Self; 7] = [
        Self::Int32,
        Self::Int64,
        Self::Guid,
        Self::Binary,
        Self::DateTime,
        Self::TimeSpan,
        Self::DateTimeOffset,
    ];

    /// Canonical encoded length. For `Binary` this is the maximum length.
    #[must_use]
    pub const fn byte_len(self) -> usize {
        match self {
            Self::Int32 => 4,
            Self::Int64 | Self::DateTime | Self::TimeSpan => 8,
            Self::Guid | Self::DateTimeOffset => 16,
            Self::Binary => MAX_BINARY_KEY_LEN,
        }
    }

    /// Whether every value of this type encodes to exactly `byte_len` bytes
    #[must_use]
    pub const fn is_fixed_length(self) -> bool {
        !matches!(self, Self::Binary)
    }

    /// Whether trailing zero bytes are part of a key's identity.
    ///
    /// Kept separate from `is_fixed_length` on purpose: the two properties
    /// happen to coincide today but are independent codec policies.
    #[must_use]
    pub const fn trailing_zeros_significant(self) -> bool {
        matches!(self, Self::Binary)
    }

    /// Number of leading canonical bytes the successor function increments.
    ///
    /// `DateTimeOffset` only steps its UTC instant; the offset component of
    /// a canonical key is constant.
    #[must_use]
    pub(crate) const fn successor_width(self) -> usize {
        match self {
            Self::DateTimeOffset => 8,
            other => other.byte_len(),
        }
    }

    /// Persisted discriminant
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Guid => "guid",
            Self::Binary => "binary",
            Self::DateTime => "datetime",
            Self::TimeSpan => "timespan",
            Self::DateTimeOffset => "datetimeoffset",
        }
    }
}

impl fmt::Display for ShardKeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for ShardKeyType {
    type Error = KeyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_u8() == value)
            .ok_or_else(|| KeyError::UnsupportedKeyType(value.to_string()))
    }
}

impl FromStr for ShardKeyType {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == lower)
            .ok_or_else(|| KeyError::UnsupportedKeyType(s.to_string()))
    }
}
