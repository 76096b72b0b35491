//! Configuration types for ShardMeta
//!
//! Every section has defaults so a partial TOML file is enough.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration for ShardMeta
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Metadata store configuration
    pub store: StoreConfig,
    /// Transient fault retry configuration
    pub retry: RetryConfig,
    /// Pending operation recovery configuration
    pub recovery: RecoveryConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Metadata store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding `global.redb` and the `local/` stores
    pub data_dir: PathBuf,
    /// Keep every store in memory (tests and dry runs)
    pub in_memory: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/shardmeta"),
            in_memory: false,
        }
    }
}

/// Retry policy for transient store faults
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry (milliseconds, 0 allowed)
    pub initial_delay_ms: u64,
    /// Upper bound on the delay between attempts (milliseconds)
    pub max_delay_ms: u64,
    /// Growth factor applied to the delay after each retry
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

/// What to do with a pending operation left behind by another caller
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingResolution {
    /// Roll the partial change back
    #[default]
    Undo,
    /// Finish the remaining steps
    Resume,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub pending_resolution: PendingResolution,
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "shardmeta_manager=debug")
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
