//! Tick-based date/time values
//!
//! The backing engine stores date/time keys as 100ns ticks counted from
//! 0001-01-01T00:00:00. These types carry the tick count directly and
//! convert to and from `chrono` values at the edges.

use crate::error::KeyError;
use crate::key_type::ShardKeyType;
use chrono::{FixedOffset, NaiveDateTime, TimeDelta, TimeZone};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Ticks per second (one tick is 100ns)
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Ticks per minute
pub const TICKS_PER_MINUTE: i64 = 60 * TICKS_PER_SECOND;

/// Largest valid `DateTime` tick count (9999-12-31T23:59:59.9999999)
pub const MAX_DATETIME_TICKS: i64 = 3_155_378_975_999_999_999;

/// Tick count of 1970-01-01T00:00:00
const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

/// Largest accepted UTC offset, in minutes (+/-14:00)
pub const MAX_OFFSET_MINUTES: i16 = 14 * 60;

/// Calendar instant without a time zone, as ticks since 0001-01-01
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DateTime {
    ticks: i64,
}

impl DateTime {
    pub const MIN: Self = Self { ticks: 0 };
    pub const MAX: Self = Self {
        ticks: MAX_DATETIME_TICKS,
    };

    /// Create from a tick count, rejecting values outside the calendar
    pub fn from_ticks(ticks: i64) -> Result<Self, KeyError> {
        if (0..=MAX_DATETIME_TICKS).contains(&ticks) {
            Ok(Self { ticks })
        } else {
            Err(KeyError::out_of_range(
                ShardKeyType::DateTime,
                format!("{ticks} ticks"),
            ))
        }
    }

    #[must_use]
    pub const fn ticks(self) -> i64 {
        self.ticks
    }

    /// Convert from a `chrono` timestamp (sub-tick precision is truncated)
    pub fn from_naive(value: NaiveDateTime) -> Result<Self, KeyError> {
        let utc = value.and_utc();
        let ticks = utc
            .timestamp()
            .checked_mul(TICKS_PER_SECOND)
            .and_then(|t| t.checked_add(i64::from(utc.timestamp_subsec_nanos()) / 100))
            .and_then(|t| t.checked_add(UNIX_EPOCH_TICKS))
            .ok_or_else(|| KeyError::out_of_range(ShardKeyType::DateTime, value.to_string()))?;
        Self::from_ticks(ticks)
    }

    #[must_use]
    pub fn to_naive(self) -> Option<NaiveDateTime> {
        ticks_to_naive(self.ticks)
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_naive() {
            Some(naive) => write!(f, "{}", naive.format("%Y-%m-%dT%H:%M:%S%.7f")),
            None => write!(f, "{} ticks", self.ticks),
        }
    }
}

/// Signed elapsed time in ticks
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeSpan {
    ticks: i64,
}

impl TimeSpan {
    pub const MIN: Self = Self { ticks: i64::MIN };
    pub const MAX: Self = Self { ticks: i64::MAX };
    pub const ZERO: Self = Self { ticks: 0 };

    #[must_use]
    pub const fn from_ticks(ticks: i64) -> Self {
        Self { ticks }
    }

    #[must_use]
    pub const fn ticks(self) -> i64 {
        self.ticks
    }

    /// Convert from a `chrono` duration (sub-tick precision is truncated)
    pub fn from_duration(value: TimeDelta) -> Result<Self, KeyError> {
        value
            .num_seconds()
            .checked_mul(TICKS_PER_SECOND)
            .and_then(|t| t.checked_add(i64::from(value.subsec_nanos()) / 100))
            .map(Self::from_ticks)
            .ok_or_else(|| KeyError::out_of_range(ShardKeyType::TimeSpan, value.to_string()))
    }

    #[must_use]
    pub fn to_duration(self) -> Option<TimeDelta> {
        let secs = self.ticks.div_euclid(TICKS_PER_SECOND);
        let nanos = self.ticks.rem_euclid(TICKS_PER_SECOND) * 100;
        TimeDelta::new(secs, u32::try_from(nanos).ok()?)
    }
}

impl fmt::Display for TimeSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ticks", self.ticks)
    }
}

/// Instant with the UTC offset it was observed in.
///
/// Equality, ordering and hashing look only at the UTC instant, so two
/// values with the same instant and different offsets are equal.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct DateTimeOffset {
    utc_ticks: i64,
    offset_minutes: i16,
}

impl DateTimeOffset {
    pub const MIN: Self = Self {
        utc_ticks: 0,
        offset_minutes: 0,
    };
    pub const MAX: Self = Self {
        utc_ticks: MAX_DATETIME_TICKS,
        offset_minutes: 0,
    };

    /// Create from the UTC tick count and an offset in minutes
    pub fn new(utc_ticks: i64, offset_minutes: i16) -> Result<Self, KeyError> {
        let key_type = ShardKeyType::DateTimeOffset;
        if offset_minutes.unsigned_abs() > MAX_OFFSET_MINUTES.unsigned_abs() {
            return Err(KeyError::out_of_range(
                key_type,
                format!("offset {offset_minutes} minutes"),
            ));
        }
        let local = utc_ticks
            .checked_add(i64::from(offset_minutes) * TICKS_PER_MINUTE)
            .unwrap_or(-1);
        if !(0..=MAX_DATETIME_TICKS).contains(&utc_ticks)
            || !(0..=MAX_DATETIME_TICKS).contains(&local)
        {
            return Err(KeyError::out_of_range(
                key_type,
                format!("{utc_ticks} ticks at offset {offset_minutes} minutes"),
            ));
        }
        Ok(Self {
            utc_ticks,
            offset_minutes,
        })
    }

    /// UTC instant with a zero offset
    pub fn from_utc_ticks(utc_ticks: i64) -> Result<Self, KeyError> {
        Self::new(utc_ticks, 0)
    }

    pub fn from_chrono(value: chrono::DateTime<FixedOffset>) -> Result<Self, KeyError> {
        let utc = DateTime::from_naive(value.naive_utc())
            .map_err(|_| KeyError::out_of_range(ShardKeyType::DateTimeOffset, value.to_rfc3339()))?;
        let offset_minutes = i16::try_from(value.offset().local_minus_utc() / 60)
            .map_err(|_| KeyError::out_of_range(ShardKeyType::DateTimeOffset, value.to_rfc3339()))?;
        Self::new(utc.ticks(), offset_minutes)
    }

    #[must_use]
    pub fn to_chrono(self) -> Option<chrono::DateTime<FixedOffset>> {
        let offset = FixedOffset::east_opt(i32::from(self.offset_minutes) * 60)?;
        let naive = ticks_to_naive(self.utc_ticks)?;
        Some(offset.from_utc_datetime(&naive))
    }

    #[must_use]
    pub const fn utc_ticks(self) -> i64 {
        self.utc_ticks
    }

    #[must_use]
    pub const fn offset_minutes(self) -> i16 {
        self.offset_minutes
    }
}

impl PartialEq for DateTimeOffset {
    fn eq(&self, other: &Self) -> bool {
        self.utc_ticks == other.utc_ticks
    }
}

impl Eq for DateTimeOffset {}

impl PartialOrd for DateTimeOffset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DateTimeOffset {
    fn cmp(&self, other: &Self) -> Ordering {
        self.utc_ticks.cmp(&other.utc_ticks)
    }
}

impl Hash for DateTimeOffset {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.utc_ticks.hash(state);
    }
}

impl fmt::Display for DateTimeOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_chrono() {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.7f%:z")),
            None => write!(f, "{} ticks", self.utc_ticks),
        }
    }
}

fn ticks_to_naive(ticks: i64) -> Option<NaiveDateTime> {
    let since_epoch = ticks.checked_sub(UNIX_EPOCH_TICKS)?;
    let secs = since_epoch.div_euclid(TICKS_PER_SECOND);
    let nanos = u32::try_from(since_epoch.rem_euclid(TICKS_PER_SECOND) * 100).ok()?;
    chrono::DateTime::from_timestamp(secs, nanos).map(|dt| dt.naive_utc())
}
