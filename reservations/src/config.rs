//! Configuration management for the reservation engine.
//!
//! Loads configuration from environment variables with sensible defaults.

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::env;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Offset outside ±24h
    #[error("UTC offset of {0} minutes is out of range")]
    InvalidUtcOffset(i32),
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Business rules configuration
    pub service: ServiceConfig,
    /// Log level (trace, debug, info, warn, error) or a full `EnvFilter` directive
    pub log_level: String,
}

/// Business rules configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Offset of the condominium's local time from UTC, in minutes
    /// (default: -180, Brasília)
    pub utc_offset_minutes: i32,
    /// Candidates tried before giving up on finding an unused protocol
    pub protocol_max_attempts: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: -180,
            protocol_max_attempts: 16,
        }
    }
}

impl ServiceConfig {
    /// Local time offset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidUtcOffset`] when the offset is a day or more.
    pub fn utc_offset(&self) -> Result<FixedOffset, ConfigError> {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or(ConfigError::InvalidUtcOffset(self.utc_offset_minutes))
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Falls back to defaults if environment variables are not set.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = ServiceConfig::default();
        Self {
            service: ServiceConfig {
                utc_offset_minutes: env::var("CONDO_UTC_OFFSET_MINUTES")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.utc_offset_minutes),
                protocol_max_attempts: env::var("PROTOCOL_MAX_ATTEMPTS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .filter(|attempts| *attempts > 0)
                    .unwrap_or(defaults.protocol_max_attempts),
            },
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        }
    }
}
