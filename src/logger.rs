//! Logging initialization.
//!
//! `LoggerManager` validates the `[logger]` section and installs the global
//! `tracing` subscriber with a console layer, a systemd journald layer, or both.
//! `RUST_LOG` overrides the configured level for every layer.

use std::{fmt as std_fmt, io};

use thiserror::Error;
use time::{
    format_description::{well_known::Rfc3339, OwnedFormatItem},
    OffsetDateTime,
};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, format::Writer, time::FormatTime},
    prelude::*,
    EnvFilter, Layer,
};
use validator::{Validate, ValidationErrors};

use crate::{
    config::logger::{ConsoleConfig, LogFormat, LoggerConfig, TimestampFormat},
    print_info, print_warn,
};

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Logger initialization error: {0}")]
    InitializationError(String),

    #[error("Logger configuration validation error: {0}")]
    ValidationError(#[from] ValidationErrors),

    #[error("Invalid timestamp format: {0}")]
    TimestampFormat(String),

    /// Typically the journald socket is unavailable.
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("No logging layers were configured or successfully initialized")]
    NoLayersConfigured,

    #[error(
        "Failed to initialize journald logger while console logging is enabled. Please check your configuration."
    )]
    JournaldFailedWithConsoleEnabled,
}

type BoxedLayer = Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>;

/// Console timestamp rendering for the configured `TimestampFormat`.
#[derive(Debug, Clone)]
pub struct LogTimer {
    format: TimestampFormat,
    custom: Option<OwnedFormatItem>,
}

impl LogTimer {
    pub fn new(format: &TimestampFormat) -> Result<Self, LoggerError> {
        let custom = match format {
            TimestampFormat::Custom(description) => Some(
                time::format_description::parse_owned::<2>(description)
                    .map_err(|e| LoggerError::TimestampFormat(e.to_string()))?,
            ),
            _ => None,
        };

        Ok(Self {
            format: format.clone(),
            custom,
        })
    }

    fn render(&self, now: OffsetDateTime) -> Result<String, std_fmt::Error> {
        match (&self.format, &self.custom) {
            (TimestampFormat::Unix, _) => {
                Ok(format!("{}.{:06}", now.unix_timestamp(), now.microsecond()))
            }
            (TimestampFormat::Custom(_), Some(items)) => {
                now.format(items).map_err(|_| std_fmt::Error)
            }
            _ => now.format(&Rfc3339).map_err(|_| std_fmt::Error),
        }
    }
}

impl FormatTime for LogTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std_fmt::Result {
        write!(w, "{}", self.render(OffsetDateTime::now_utc())?)
    }
}

pub struct LoggerManager {
    config: LoggerConfig,
}

impl LoggerManager {
    /// # Errors
    ///
    /// `LoggerError::ValidationError` if the configuration is invalid.
    pub fn new(config: LoggerConfig) -> Result<Self, LoggerError> {
        config.validate()?;

        Ok(LoggerManager { config })
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.config.level))
    }

    /// Installs the global subscriber. Call once, before any session starts.
    ///
    /// # Errors
    ///
    /// Fails when no layer could be built, or when journald cannot be reached
    /// while console output is also enabled (a half-configured setup is treated
    /// as a configuration mistake).
    pub fn init(&mut self) -> Result<(), LoggerError> {
        let mut layers = self.build_layers()?;

        if let Some(journald_config) = self.config.journald.as_ref().filter(|j| j.enabled) {
            match tracing_journald::layer() {
                Ok(layer) => {
                    layers.push(
                        layer
                            .with_syslog_identifier(journald_config.identifier.clone())
                            .with_filter(self.filter())
                            .boxed(),
                    );
                    print_info!(
                        "Systemd journald logger initialized with identifier: {}",
                        journald_config.identifier
                    );
                }
                Err(e) => {
                    print_warn!("Failed to initialize systemd journald logger: {}", e);
                    if self.config.console.as_ref().is_some_and(|c| c.enabled) {
                        return Err(LoggerError::JournaldFailedWithConsoleEnabled);
                    }
                }
            }
        }

        if layers.is_empty() {
            print_warn!("No logging layers were initialized. Please check your configuration.");
            return Err(LoggerError::NoLayersConfigured);
        }

        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .map_err(|e| LoggerError::InitializationError(e.to_string()))
    }

    /// Console layers only; journald is attached in `init`.
    fn build_layers(&self) -> Result<Vec<BoxedLayer>, LoggerError> {
        let mut layers = Vec::new();
        if let Some(console_config) = self.config.console.as_ref().filter(|c| c.enabled) {
            let timer = LogTimer::new(&self.config.timestamp_format)?;
            layers.push(Self::console_layer(console_config, timer, self.filter()));
        }
        Ok(layers)
    }

    fn console_layer(config: &ConsoleConfig, timer: LogTimer, filter: EnvFilter) -> BoxedLayer {
        let span_events = if config.show_spans {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let base = fmt::layer()
            .with_timer(timer)
            .with_target(config.show_target)
            .with_thread_ids(config.show_thread_ids)
            .with_span_events(span_events)
            .with_ansi(config.ansi_colors)
            .with_writer(io::stdout);

        match config.format {
            LogFormat::Json => base.json().with_filter(filter).boxed(),
            LogFormat::Pretty => base.pretty().with_filter(filter).boxed(),
            LogFormat::Compact => base.compact().with_filter(filter).boxed(),
        }
    }
}
