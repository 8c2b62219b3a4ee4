//! Bridge configuration.
//!
//! Loaded from TOML; every field has a default so an empty file is valid.
//!
//! ```toml
//! service_name = "my-service"
//! startup_timeout = "10s"
//! poll_interval = "250ms"
//! stop_policy = "delegate"
//! ```

use crate::error::{Error, Result};
use crate::status::ControlsAccepted;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Who completes the stop sequence when the manager sends a stop code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StopPolicy {
    /// The `stop` callback owns shutdown; the handler stops by itself only
    /// when no callback is registered
    #[default]
    Delegate,
    /// The handler always completes the stop sequence after firing the callback
    AutoStop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Name the service is registered under
    pub service_name: String,
    /// How long `run()` waits for the manager to invoke the entry point
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,
    /// How often the entry confirmation is polled
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// How long `run()` waits for the dispatcher to return once stopped
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    /// Wait hint reported with every status push, in milliseconds
    pub wait_hint_ms: u32,
    pub stop_policy: StopPolicy,
    /// Advertise pause/continue to the manager
    pub accept_pause_continue: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            service_name: "generic-service".to_string(),
            startup_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(250),
            shutdown_grace: Duration::from_secs(5),
            wait_hint_ms: 0,
            stop_policy: StopPolicy::Delegate,
            accept_pause_continue: true,
        }
    }
}

impl BridgeConfig {
    /// Default configuration for `service_name`.
    pub fn named(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.service_name.is_empty() {
            return Err(Error::ConfigError("service_name must not be empty".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::ConfigError("poll_interval must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Controls-accepted mask derived from this configuration.
    pub fn controls_accepted(&self) -> ControlsAccepted {
        if self.accept_pause_continue {
            ControlsAccepted::STOP | ControlsAccepted::PAUSE_CONTINUE
        } else {
            ControlsAccepted::STOP
        }
    }
}
