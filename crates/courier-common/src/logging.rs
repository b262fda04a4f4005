//! Tracing subscriber bootstrap shared by the Courier binaries

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use crate::{CourierError, Result};

/// Logging section of the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive, overridden by `RUST_LOG` when set
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Install the global `fmt` subscriber.
///
/// Fails when the configured filter directive is invalid or a global
/// subscriber has already been installed.
pub fn init_logging(settings: &LoggingSettings) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&settings.level).map_err(|e| {
            CourierError::InvalidConfiguration(format!("invalid log level '{}': {}", settings.level, e))
        })?,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if settings.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| CourierError::InvalidConfiguration(format!("failed to install logger: {}", e)))
}
