//! Application configuration loading, validation, and management.
//!
//! The top-level `Config` aggregates logging, bridge, and MQTT transport settings.
//! It is read once from TOML at startup, overlaid with the `MQTT_*` environment
//! variables, validated, and left immutable thereafter.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::config::{bridge::BridgeConfig, logger::LoggerConfig};

pub mod bridge;
pub mod logger;

/// Timestamped console output for use before the tracing subscriber exists.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style(
                time::OffsetDateTime::now_utc()
                    .format(&time::format_description::well_known::Rfc3339)
                    .unwrap_or_default()
            ).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style(
                time::OffsetDateTime::now_utc()
                    .format(&time::format_description::well_known::Rfc3339)
                    .unwrap_or_default()
            ).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style(
                time::OffsetDateTime::now_utc()
                    .format(&time::format_description::well_known::Rfc3339)
                    .unwrap_or_default()
            ).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "DECKBRIDGE_CONFIG";

/// Used when `DECKBRIDGE_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/deckbridge/config.toml";

/// Errors raised while loading, parsing, or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Top-level application configuration.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// Logging subsystem configuration.
    #[validate(nested)]
    pub logger: LoggerConfig,

    /// Device session behaviour: state file, icons, event publishing.
    #[validate(nested)]
    pub bridge: BridgeConfig,

    /// MQTT connection settings.
    #[validate(nested)]
    pub transport: deckbridge_mqtt::Config,
}

impl Config {
    /// Locates, loads, and validates the configuration.
    ///
    /// Falls back to built-in defaults when no file exists; the broker can still
    /// be set through the environment.
    pub fn new() -> Result<Self, ConfigError> {
        let mut config = match Self::get_config_path()? {
            Some(path) => Self::parse_file(&path)?,
            None => {
                print_warn!("No configuration file found, using built-in defaults");
                Config::default()
            }
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.check()?;
        Ok(config)
    }

    /// Priority: `DECKBRIDGE_CONFIG`, then `/etc/deckbridge/config.toml`.
    ///
    /// An explicitly named file that does not exist is an error.
    fn get_config_path() -> Result<Option<PathBuf>, ConfigError> {
        if let Ok(config_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(config_path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            if !path.exists() {
                return Err(ConfigError::Config(format!(
                    "configuration file not found: {}",
                    path.display()
                )));
            }
            return Ok(Some(path));
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(Some(fallback.to_path_buf()));
        }

        Ok(None)
    }

    fn parse_file(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        let config_str = fs::read_to_string(path)?;
        toml::from_str(&config_str).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    fn check(&self) -> Result<(), ConfigError> {
        self.validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Overlays `MQTT_HOST`, `MQTT_PORT`, `MQTT_USER` and `MQTT_PASS`.
    ///
    /// `lookup` abstracts the environment so tests need not mutate it.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MQTT_HOST") {
            self.transport.host = host;
        }

        if let Some(port) = lookup("MQTT_PORT") {
            self.transport.port = port.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!("MQTT_PORT is not a valid port: {port}"))
            })?;
        }

        if let Some(user) = lookup("MQTT_USER") {
            self.transport.username = Some(user);
        }

        if let Some(pass) = lookup("MQTT_PASS") {
            self.transport.password = Some(pass);
        }

        Ok(())
    }
}
