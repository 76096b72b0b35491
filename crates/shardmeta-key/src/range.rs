//! Half-open key ranges

use crate::error::KeyError;
use crate::key::ShardKey;
use crate::key_type::ShardKeyType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key range `[low, high)`. `high` may be the maximum sentinel.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawShardRange")]
pub struct ShardRange {
    low: ShardKey,
    high: ShardKey,
}

impl ShardRange {
    pub fn new(low: ShardKey, high: ShardKey) -> Result<Self, KeyError> {
        high.expect_type(low.key_type())?;
        if low >= high {
            return Err(KeyError::InvalidRange {
                low: low.to_string(),
                high: high.to_string(),
            });
        }
        Ok(Self { low, high })
    }

    /// Range covering every key of the type
    #[must_use]
    pub const fn full(key_type: ShardKeyType) -> Self {
        Self {
            low: ShardKey::min(key_type),
            high: ShardKey::max(key_type),
        }
    }

    /// Range holding exactly one key: `[key, successor(key))`
    pub fn point(key: ShardKey) -> Result<Self, KeyError> {
        let high = key.successor()?;
        Ok(Self { low: key, high })
    }

    #[must_use]
    pub const fn low(&self) -> &ShardKey {
        &self.low
    }

    #[must_use]
    pub const fn high(&self) -> &ShardKey {
        &self.high
    }

    #[must_use]
    pub const fn key_type(&self) -> ShardKeyType {
        self.low.key_type()
    }

    #[must_use]
    pub fn contains(&self, key: &ShardKey) -> bool {
        key.key_type() == self.key_type() && *key >= self.low && *key < self.high
    }

    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.key_type() == other.key_type() && self.low < other.high && other.low < self.high
    }

    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        if !self.intersects(other) {
            return None;
        }
        Some(Self {
            low: self.low.clone().max(other.low.clone()),
            high: self.high.clone().min(other.high.clone()),
        })
    }

    /// Whether the range holds exactly its low key
    #[must_use]
    pub fn is_point(&self) -> bool {
        self.low.successor().is_ok_and(|next| next == self.high)
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.low.is_min() && self.high.is_max()
    }
}

impl fmt::Display for ShardRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.low, self.high)
    }
}

/// Deserialized form of a `ShardRange`, validated on the way in
#[derive(Deserialize)]
struct RawShardRange {
    low: ShardKey,
    high: ShardKey,
}

impl TryFrom<RawShardRange> for ShardRange {
    type Error = KeyError;

    fn try_from(raw: RawShardRange) -> Result<Self, Self::Error> {
        Self::new(raw.low, raw.high)
    }
}
