//! ShardMeta Common - Shared types and utilities
//!
//! This crate provides the shard map domain types, error definitions and
//! configuration used across all ShardMeta components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, ErrorCategory, Result};
pub use types::*;
