//! Courier configuration
//!
//! Loads pump and logging settings from TOML:
//!
//! ```toml
//! [logging]
//! level = "info"
//!
//! [[pumps]]
//! job_id = "orders"
//! max_concurrent_receives = 10
//! recovery_period_ms = 30000
//! probe_interval_ms = 10000
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use courier_common::{LoggingSettings, PumpConfig, RecoveryOptions, UnmatchedPolicy};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level configuration file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub logging: LoggingSettings,
    pub pumps: Vec<PumpSettings>,
}

/// One `[[pumps]]` table
#[derive(Debug, Clone, Deserialize)]
pub struct PumpSettings {
    pub job_id: String,
    #[serde(default = "default_concurrency")]
    pub max_concurrent_receives: u32,
    #[serde(default = "default_batch_size")]
    pub max_batch_size: u32,
    #[serde(default = "default_recovery_period_ms")]
    pub recovery_period_ms: u64,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_empty_poll_delay_ms")]
    pub empty_poll_delay_ms: u64,
    #[serde(default = "default_receive_error_backoff_ms")]
    pub receive_error_backoff_ms: u64,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default)]
    pub unmatched_policy: UnmatchedPolicy,
}

fn default_concurrency() -> u32 { 10 }
fn default_batch_size() -> u32 { 10 }
fn default_recovery_period_ms() -> u64 { 30_000 }
fn default_probe_interval_ms() -> u64 { 10_000 }
fn default_empty_poll_delay_ms() -> u64 { 100 }
fn default_receive_error_backoff_ms() -> u64 { 1_000 }
fn default_drain_timeout_ms() -> u64 { 60_000 }

impl PumpSettings {
    pub fn to_pump_config(&self) -> PumpConfig {
        PumpConfig {
            job_id: self.job_id.clone(),
            max_concurrent_receives: self.max_concurrent_receives,
            max_batch_size: self.max_batch_size,
            recovery: RecoveryOptions {
                recovery_period: Duration::from_millis(self.recovery_period_ms),
                probe_interval: Duration::from_millis(self.probe_interval_ms),
            },
            empty_poll_delay: Duration::from_millis(self.empty_poll_delay_ms),
            receive_error_backoff: Duration::from_millis(self.receive_error_backoff_ms),
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            unmatched_policy: self.unmatched_policy,
        }
    }
}

impl CourierConfig {
    /// Read and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_toml_str(&content)?;
        info!(path = %path.display(), pumps = config.pumps.len(), "Loaded configuration");
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CourierConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for pump in &self.pumps {
            if !seen.insert(pump.job_id.as_str()) {
                return Err(ConfigError::Validation(format!("duplicate job id '{}'", pump.job_id)));
            }
            pump.to_pump_config()
                .validate()
                .map_err(|e| ConfigError::Validation(e.to_string()))?;
        }
        Ok(())
    }

    pub fn pump_configs(&self) -> Vec<PumpConfig> {
        self.pumps.iter().map(PumpSettings::to_pump_config).collect()
    }
}
