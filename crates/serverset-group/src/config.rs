//! Group timing and retry configuration.
//!
//! Durations are written the way operators write them in TOML
//! (`"5s"`, `"250ms"`, `"2m"`, or a bare number of seconds).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while validating configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid duration for {field}: {value:?}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Timeouts and retry policy for one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// How long `join` waits for a connected session.
    pub connect_timeout: String,
    /// How long `join`/`leave` wait for the coordination service to
    /// acknowledge a write.
    pub operation_timeout: String,
    /// Pause between retries of listings and re-registrations.
    pub retry_backoff: String,
    /// Attempts to re-create a member node after session expiry before the
    /// group is declared failed.
    pub reregister_attempts: u32,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            connect_timeout: "10s".to_string(),
            operation_timeout: "5s".to_string(),
            retry_backoff: "250ms".to_string(),
            reregister_attempts: 3,
        }
    }
}

impl GroupConfig {
    /// Check every field, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        duration_field("connect_timeout", &self.connect_timeout)?;
        duration_field("operation_timeout", &self.operation_timeout)?;
        duration_field("retry_backoff", &self.retry_backoff)?;
        if self.reregister_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "reregister_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        parse_duration(&self.connect_timeout).unwrap_or(Duration::from_secs(10))
    }

    pub fn operation_timeout(&self) -> Duration {
        parse_duration(&self.operation_timeout).unwrap_or(Duration::from_secs(5))
    }

    pub fn retry_backoff(&self) -> Duration {
        parse_duration(&self.retry_backoff).unwrap_or(Duration::from_millis(250))
    }

    pub fn reregister_attempts(&self) -> u32 {
        self.reregister_attempts.max(1)
    }
}

/// Parse a field as a duration, naming the field on failure.
pub fn duration_field(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
        field,
        value: value.to_string(),
    })
}

/// Parse `"500ms"`, `"5s"`, `"2m"`, `"1h"` or a bare number of seconds.
/// Values that do not fit a [`Duration`] are rejected.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (digits, unit) = s.split_at(s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len()));
    let value: u64 = digits.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "" | "s" => Some(Duration::from_secs(value)),
        "m" => value.checked_mul(60).map(Duration::from_secs),
        "h" => value.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}
