//! Bridge configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::adapters::AdapterKind;
use crate::{AppError, Result};

/// Configurable timeout values, in seconds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Bound on a single session request.
    #[serde(default = "default_request_seconds")]
    pub request_seconds: u64,
    /// Bound on the initialize → configurationDone handshake.
    #[serde(default = "default_handshake_seconds")]
    pub handshake_seconds: u64,
    /// Bound on the adapter acknowledging a terminate.
    #[serde(default = "default_terminate_seconds")]
    pub terminate_seconds: u64,
    /// How long to keep retrying a socket connect.
    #[serde(default = "default_connect_seconds")]
    pub connect_seconds: u64,
    /// Default bound when waiting for the debuggee to stop.
    #[serde(default = "default_stop_wait_seconds")]
    pub stop_wait_seconds: u64,
}

fn default_request_seconds() -> u64 {
    30
}

fn default_handshake_seconds() -> u64 {
    30
}

fn default_terminate_seconds() -> u64 {
    5
}

fn default_connect_seconds() -> u64 {
    10
}

fn default_stop_wait_seconds() -> u64 {
    300
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_seconds: default_request_seconds(),
            handshake_seconds: default_handshake_seconds(),
            terminate_seconds: default_terminate_seconds(),
            connect_seconds: default_connect_seconds(),
            stop_wait_seconds: default_stop_wait_seconds(),
        }
    }
}

impl TimeoutConfig {
    /// Request bound as a [`Duration`].
    #[must_use]
    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_seconds)
    }

    /// Handshake bound as a [`Duration`].
    #[must_use]
    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_seconds)
    }

    /// Terminate bound as a [`Duration`].
    #[must_use]
    pub fn terminate(&self) -> Duration {
        Duration::from_secs(self.terminate_seconds)
    }

    /// Connect bound as a [`Duration`].
    #[must_use]
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_seconds)
    }

    /// Stop-wait bound as a [`Duration`].
    #[must_use]
    pub fn stop_wait(&self) -> Duration {
        Duration::from_secs(self.stop_wait_seconds)
    }

    fn validate(&self) -> Result<()> {
        let fields = [
            ("request_seconds", self.request_seconds),
            ("handshake_seconds", self.handshake_seconds),
            ("terminate_seconds", self.terminate_seconds),
            ("connect_seconds", self.connect_seconds),
            ("stop_wait_seconds", self.stop_wait_seconds),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(AppError::Config(format!(
                    "timeouts.{name} must be greater than zero"
                )));
            }
        }
        Ok(())
    }
}

/// Per-adapter overrides from an `[adapters.<name>]` table.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AdapterOverride {
    /// Whether sessions may be created for this adapter.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Executable replacing the built-in launch command.
    #[serde(default)]
    pub command: Option<String>,
    /// Arguments replacing the built-in launch arguments.
    #[serde(default)]
    pub args: Option<Vec<String>>,
}

fn default_true() -> bool {
    true
}

fn default_adapter() -> String {
    AdapterKind::Debugpy.name().to_owned()
}

fn default_output_buffer_lines() -> usize {
    1000
}

/// Bridge configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BridgeConfig {
    /// Adapter used when a caller names none.
    #[serde(default = "default_adapter")]
    pub default_adapter: String,
    /// Output lines buffered per session before the oldest are dropped.
    #[serde(default = "default_output_buffer_lines")]
    pub output_buffer_lines: usize,
    /// Timeout configuration.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Adapter overrides keyed by adapter name or alias.
    #[serde(default)]
    pub adapters: HashMap<String, AdapterOverride>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_adapter: default_adapter(),
            output_buffer_lines: default_output_buffer_lines(),
            timeouts: TimeoutConfig::default(),
            adapters: HashMap::new(),
        }
    }
}

impl BridgeConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Override for `kind`, whichever of its names the table used.
    #[must_use]
    pub fn adapter_override(&self, kind: AdapterKind) -> Option<&AdapterOverride> {
        self.adapters
            .iter()
            .find(|(name, _)| AdapterKind::from_name(name) == Some(kind))
            .map(|(_, entry)| entry)
    }

    /// Check value ranges and adapter names.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violation.
    pub fn validate(&self) -> Result<()> {
        self.timeouts.validate()?;

        if self.output_buffer_lines == 0 {
            return Err(AppError::Config(
                "output_buffer_lines must be greater than zero".into(),
            ));
        }

        for name in self.adapters.keys() {
            if AdapterKind::from_name(name).is_none() {
                return Err(AppError::Config(format!("unknown adapter table: {name}")));
            }
        }

        let default = AdapterKind::from_name(&self.default_adapter).ok_or_else(|| {
            AppError::Config(format!("unknown default_adapter: {}", self.default_adapter))
        })?;
        if self.adapter_override(default).is_some_and(|entry| !entry.enabled) {
            return Err(AppError::Config(format!(
                "default_adapter {} is disabled",
                self.default_adapter
            )));
        }

        Ok(())
    }
}
