//! Configuration structures for the MQTT connection.
//!
//! All types deserialize with serde (the application embeds them in its TOML file
//! under `[transport]`) and are checked with the `validator` crate before a client
//! is built.
//!
//! # Base Topic
//!
//! `base_topic` namespaces every subscribe and publish made through
//! [`MqttInstance`](crate::MqttInstance). With the default `streamdeck`, a
//! subscription to `brightness` becomes `streamdeck/brightness`.
//!
//! # Example
//!
//! ```toml
//! [transport]
//! base_topic = "streamdeck"
//! host = "mqtt.home.local"
//! port = 1883
//! username = "deck"
//! password = "secret"
//! keep_alive = 60
//! max_reconnect_attempts = 0  # retry forever
//!
//! [transport.tls]
//! ca_cert_path = "/etc/mqtt/ca.pem"
//! ```

use std::{fmt, path::Path};

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Main MQTT connection configuration.
///
/// `Debug` output masks the password.
#[derive(Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    /// Topic namespace applied to all subscribe/publish operations.
    ///
    /// Must not contain wildcards; leading/trailing slashes are trimmed when joining.
    #[validate(
        length(max = 255, message = "Base topic must not exceed 255 characters"),
        custom(function = "validate_base_topic")
    )]
    pub base_topic: String,

    /// Broker hostname or IP address.
    #[validate(length(
        min = 1,
        max = 255,
        message = "Host must be between 1 and 255 characters"
    ))]
    pub host: String,

    /// Broker port (1883 plain, 8883 TLS).
    #[validate(range(min = 1, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// Broker username. Sent only when set.
    pub username: Option<String>,

    /// Broker password. Ignored unless `username` is set.
    pub password: Option<String>,

    /// MQTT client identifier.
    ///
    /// Empty means "derive one": the application appends the device serial so each
    /// session gets a distinct id; the client builder falls back to a UUID.
    #[validate(length(max = 64, message = "Client ID must not exceed 64 characters"))]
    pub client_id: String,

    /// Whether the broker should discard session state on connect.
    pub clean_session: bool,

    /// Keep-alive interval in seconds.
    #[validate(range(
        min = 5,
        max = 3600,
        message = "Keep alive must be between 5 and 3600 seconds"
    ))]
    pub keep_alive: u64,

    /// Maximum number of QoS 1/2 publishes awaiting acknowledgement.
    #[validate(range(
        min = 1,
        max = 1000,
        message = "Max inflight must be between 1 and 1000"
    ))]
    pub max_inflight: u16,

    /// Maximum incoming/outgoing packet size in bytes.
    ///
    /// Inline SVG key configs can be large, so the ceiling is well above a typical
    /// telemetry payload.
    #[validate(range(
        min = 1024,
        max = 16_777_216,
        message = "Max packet size must be between 1KB and 16MB"
    ))]
    pub max_packet_size: Option<u32>,

    /// Capacity of rumqttc's request channel (pending publishes/subscribes).
    #[validate(range(
        min = 1,
        max = 1024,
        message = "Request channel capacity must be between 1 and 1024"
    ))]
    pub request_channel_capacity: Option<u16>,

    /// Capacity of the channel carrying inbound PUBLISH packets to the session.
    ///
    /// When full, further messages are dropped with a warning so the event loop
    /// keeps servicing keep-alives.
    #[validate(range(
        min = 1,
        max = 65536,
        message = "Inbound channel capacity must be between 1 and 65536"
    ))]
    pub inbound_channel_capacity: usize,

    /// Initial reconnect delay in seconds.
    #[validate(range(
        min = 1,
        max = 60,
        message = "Reconnect delay must be between 1 and 60 seconds"
    ))]
    pub reconnect_delay: u64,

    /// Upper bound for the reconnect delay in seconds.
    #[validate(range(
        min = 1,
        max = 3600,
        message = "Reconnect max delay must be between 1 and 3600 seconds"
    ))]
    pub reconnect_max_delay: u64,

    /// Growth factor applied to the delay after each failed attempt.
    #[validate(range(
        min = 1.0,
        max = 30.0,
        message = "Reconnect backoff multiplier must be between 1 and 30"
    ))]
    pub reconnect_backoff_multiplier: f64,

    /// Consecutive failed attempts before the session gives up. 0 = unlimited.
    #[validate(range(max = 1000, message = "Max reconnect attempts must not exceed 1000"))]
    pub max_reconnect_attempts: u32,

    /// Optional TLS configuration; enabled when a CA certificate is set.
    #[validate(nested)]
    pub tls: Option<TlsConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            base_topic: "streamdeck".to_string(),
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: String::new(),
            clean_session: true,
            keep_alive: 60,
            max_inflight: 100,
            max_packet_size: Some(1_048_576),
            request_channel_capacity: Some(64),
            inbound_channel_capacity: 128,
            reconnect_delay: 1,
            reconnect_max_delay: 60,
            reconnect_backoff_multiplier: 2.0,
            max_reconnect_attempts: 0,
            tls: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("base_topic", &self.base_topic)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("client_id", &self.client_id)
            .field("clean_session", &self.clean_session)
            .field("keep_alive", &self.keep_alive)
            .field("max_inflight", &self.max_inflight)
            .field("max_packet_size", &self.max_packet_size)
            .field("request_channel_capacity", &self.request_channel_capacity)
            .field("inbound_channel_capacity", &self.inbound_channel_capacity)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("reconnect_max_delay", &self.reconnect_max_delay)
            .field(
                "reconnect_backoff_multiplier",
                &self.reconnect_backoff_multiplier,
            )
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("tls", &self.tls)
            .finish()
    }
}

fn validate_base_topic(topic: &str) -> Result<(), ValidationError> {
    if topic.contains(['+', '#']) {
        return Err(ValidationError::new("wildcard_in_base_topic")
            .with_message("Base topic must not contain MQTT wildcards".into()));
    }
    Ok(())
}

/// TLS settings. Paths point to PEM files.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TlsConfig {
    #[validate(custom(
        function = "validate_file_path",
        message = "CA certificate file does not exist"
    ))]
    pub ca_cert_path: Option<String>,

    #[validate(custom(
        function = "validate_file_path",
        message = "Client certificate file does not exist"
    ))]
    pub client_cert_path: Option<String>,

    #[validate(custom(
        function = "validate_file_path",
        message = "Client key file does not exist"
    ))]
    pub client_key_path: Option<String>,
}

impl TlsConfig {
    pub fn is_enabled(&self) -> bool {
        self.ca_cert_path.is_some()
    }

    /// Checks that the configured certificate set is complete and readable.
    pub fn validate_config(&self) -> Result<(), ValidationError> {
        let Some(ca) = self.ca_cert_path.as_deref() else {
            return Err(ValidationError::new("missing_ca_cert")
                .with_message("CA certificate path is required".into()));
        };
        validate_file_path(ca)?;

        match (
            self.client_cert_path.as_deref(),
            self.client_key_path.as_deref(),
        ) {
            (Some(cert), Some(key)) => {
                validate_file_path(cert)?;
                validate_file_path(key)?;
            }
            (None, None) => {}
            _ => {
                return Err(ValidationError::new("incomplete_client_auth").with_message(
                    "Both client certificate and key must be provided or neither".into(),
                ));
            }
        }

        Ok(())
    }
}

fn validate_file_path(path: &str) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(
            ValidationError::new("empty_path").with_message("File path cannot be empty".into())
        );
    }

    let path_obj = Path::new(path);

    if !path_obj.exists() {
        return Err(ValidationError::new("file_not_found")
            .with_message(format!("File does not exist: {path}").into()));
    }

    if !path_obj.is_file() {
        return Err(ValidationError::new("not_a_file")
            .with_message(format!("Path is not a file: {path}").into()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.base_topic, "streamdeck");
        assert_eq!(config.port, 1883);
    }

    #[test]
    fn test_empty_host_rejected() {
        let config = Config {
            host: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_wildcard_base_topic_rejected() {
        let config = Config {
            base_topic: "streamdeck/#".into(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.field_errors().contains_key("base_topic"));
    }

    #[test]
    fn test_multiplier_out_of_range_rejected() {
        let config = Config {
            reconnect_backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            host = "broker.local"
            username = "deck"
            password = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.host, "broker.local");
        assert_eq!(config.username.as_deref(), Some("deck"));
        assert_eq!(config.keep_alive, 60);
        assert_eq!(config.base_topic, "streamdeck");
        assert!(config.tls.is_none());
    }

    #[test]
    fn test_tls_missing_ca_file() {
        let tls = TlsConfig {
            ca_cert_path: Some("/nonexistent/ca.pem".into()),
            ..Default::default()
        };
        assert!(tls.validate_config().is_err());
        assert!(tls.validate().is_err());
    }

    #[test]
    fn test_tls_incomplete_client_auth() {
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("ca.pem");
        std::fs::File::create(&ca)
            .unwrap()
            .write_all(b"ca")
            .unwrap();

        let tls = TlsConfig {
            ca_cert_path: Some(ca.to_string_lossy().into_owned()),
            client_cert_path: Some(ca.to_string_lossy().into_owned()),
            client_key_path: None,
        };
        let err = tls.validate_config().unwrap_err();
        assert_eq!(err.code, "incomplete_client_auth");
    }

    #[test]
    fn test_tls_is_enabled() {
        assert!(!TlsConfig::default().is_enabled());
        let ca_only = TlsConfig {
            ca_cert_path: Some("ca.pem".into()),
            ..Default::default()
        };
        assert!(ca_only.is_enabled());
    }

    #[test]
    fn test_debug_masks_password() {
        let config = Config {
            username: Some("deck".into()),
            password: Some("hunter2".into()),
            ..Default::default()
        };
        let rendered = format!("{config:#?}");

        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("***"));
        assert!(rendered.contains("deck"));
        assert!(format!("{:?}", Config::default()).contains("password: None"));
    }
}
