//! ServerSet configuration, usually loaded from a TOML file:
//!
//! ```toml
//! path = "/services/api"
//! initial_listing_timeout = "5s"
//! callback_timeout = "1s"
//!
//! [group]
//! connect_timeout = "10s"
//! operation_timeout = "5s"
//! retry_backoff = "250ms"
//! reregister_attempts = 3
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serverset_coord::path::validate_path;
use serverset_group::GroupConfig;
use serverset_group::config::{ConfigError, duration_field, parse_duration};

use crate::host_set::DispatchConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSetConfig {
    /// Group path members register under.
    pub path: String,
    #[serde(default)]
    pub group: GroupConfig,
    /// How long a new monitor waits for the first listing.
    #[serde(default = "default_initial_listing_timeout")]
    pub initial_listing_timeout: String,
    /// Budget for one watcher callback.
    #[serde(default = "default_callback_timeout")]
    pub callback_timeout: String,
}

fn default_initial_listing_timeout() -> String {
    "5s".to_string()
}

fn default_callback_timeout() -> String {
    "1s".to_string()
}

impl ServerSetConfig {
    /// Defaults for everything but the group path.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            group: GroupConfig::default(),
            initial_listing_timeout: default_initial_listing_timeout(),
            callback_timeout: default_callback_timeout(),
        }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("invalid config in {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: ServerSetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_path(&self.path).map_err(|e| ConfigError::InvalidValue {
            field: "path",
            reason: e.to_string(),
        })?;
        self.group.validate()?;
        duration_field("initial_listing_timeout", &self.initial_listing_timeout)?;
        duration_field("callback_timeout", &self.callback_timeout)?;
        Ok(())
    }

    pub fn initial_listing_timeout(&self) -> Duration {
        parse_duration(&self.initial_listing_timeout).unwrap_or(Duration::from_secs(5))
    }

    pub fn callback_timeout(&self) -> Duration {
        parse_duration(&self.callback_timeout).unwrap_or(Duration::from_secs(1))
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            initial_listing_timeout: self.initial_listing_timeout(),
            callback_timeout: self.callback_timeout(),
        }
    }
}
