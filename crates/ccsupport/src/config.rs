//! Chaincode support configuration.
//!
//! Loaded from TOML. Every field has a default, so an empty file is a valid
//! configuration:
//!
//! ```toml
//! peer_address = "peer0:7052"
//! keepalive_ms = 0
//! execute_timeout_ms = 30000
//! startup_timeout_ms = 300000
//! user_runs_cc = false
//!
//! [logging]
//! level = "info"
//! shim_level = "warning"
//! format = "pretty"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::logging::LoggingConfig;

const DEFAULT_EXECUTE_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_EXECUTE_TIMEOUT: Duration = Duration::from_secs(1);
const MIN_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address chaincodes dial back to.
    pub peer_address: String,
    /// Interval between keepalives to a chaincode; 0 disables them.
    pub keepalive_ms: u64,
    pub execute_timeout_ms: u64,
    pub startup_timeout_ms: u64,
    /// Developer mode: chaincodes are started by the user, not the peer.
    pub user_runs_cc: bool,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_address: "0.0.0.0:7052".into(),
            keepalive_ms: 0,
            execute_timeout_ms: 30_000,
            startup_timeout_ms: 300_000,
            user_runs_cc: false,
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Reads, parses and validates a config file, then applies the
    /// `CORE_PEER_ADDRESS` and `CORE_CHAINCODE_MODE` overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        let mut config: Self = toml::from_str(&content).map_err(ConfigError::Parse)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates without consulting the environment.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = var("CORE_PEER_ADDRESS") {
            self.peer_address = addr;
        }
        if var("CORE_CHAINCODE_MODE").as_deref() == Some("dev") {
            self.user_runs_cc = true;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.peer_address.trim().is_empty() {
            return Err(ConfigError::MissingField { field: "peer_address" });
        }
        match self.logging.format.as_str() {
            "pretty" | "json" => Ok(()),
            other => Err(ConfigError::InvalidValue {
                field: "logging.format",
                reason: format!("expected \"pretty\" or \"json\", got {:?}", other),
            }),
        }
    }

    pub fn keepalive(&self) -> Option<Duration> {
        match self.keepalive_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Falls back to 30s when set below one second.
    pub fn execute_timeout(&self) -> Duration {
        let timeout = Duration::from_millis(self.execute_timeout_ms);
        if timeout < MIN_EXECUTE_TIMEOUT {
            DEFAULT_EXECUTE_TIMEOUT
        } else {
            timeout
        }
    }

    /// Never shorter than 5s.
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms).max(MIN_STARTUP_TIMEOUT)
    }
}
