//! Logging configuration and initialization.

use serde::Deserialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

/// Logging of the peer side, and the levels handed to chaincodes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Level of the shim library inside chaincodes.
    pub shim_level: String,
    /// `pretty` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            shim_level: "warning".into(),
            format: "pretty".into(),
        }
    }
}

impl LoggingConfig {
    /// Installs the global tracing subscriber. `RUST_LOG` takes precedence
    /// over the configured level. Does nothing if a subscriber is already
    /// installed.
    pub fn init(&self) {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));

        let result = match self.format.as_str() {
            "json" => fmt().json().with_env_filter(filter).try_init(),
            _ => fmt().with_env_filter(filter).try_init(),
        };
        if result.is_err() {
            tracing::debug!("tracing subscriber already installed");
        }
    }

    /// Environment every chaincode is started with.
    pub fn chaincode_env(&self) -> Vec<String> {
        vec![
            format!("CORE_CHAINCODE_LOGGING_LEVEL={}", self.level),
            format!("CORE_CHAINCODE_LOGGING_SHIM={}", self.shim_level),
            format!("CORE_CHAINCODE_LOGGING_FORMAT={}", self.format),
        ]
    }
}
