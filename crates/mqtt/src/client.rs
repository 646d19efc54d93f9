//! MQTT client builder with credentials, TLS and last-will support.
//!
//! `ClientBuilder` assembles rumqttc's `MqttOptions` and returns the
//! `AsyncClient`/`EventLoop` pair. The client is cheap to clone and used for
//! commands; the event loop must be driven by exactly one task (the
//! [`ConnectionKernel`](crate::ConnectionKernel)).
//!
//! ```ignore
//! let (client, event_loop) = ClientBuilder::from_config(&config)?
//!     .set_last_will("streamdeck/AL12H1A01234/status")
//!     .build()?;
//! ```

use std::{fs, time::Duration};

use rumqttc::{AsyncClient, EventLoop, LastWill, MqttOptions, QoS, TlsConfiguration, Transport};
use validator::Validate;

use super::{
    config::{Config, TlsConfig},
    error::TransferError,
};

/// Payload of the retained last-will message.
pub const OFFLINE_PAYLOAD: &str = "offline";

/// Fluent builder for an `AsyncClient` and its `EventLoop`.
pub struct ClientBuilder {
    opts: MqttOptions,
    cap: usize,
    tls_config: Option<TlsConfig>,
}

impl ClientBuilder {
    /// Creates a builder from a validated `Config`.
    ///
    /// An empty `client_id` is replaced with a random UUID; brokers drop the older
    /// connection when two clients share an id.
    ///
    /// # Errors
    /// `TransferError::ConfigError` when the configuration fails validation.
    pub fn from_config(config: &Config) -> Result<Self, TransferError> {
        config.validate()?;

        let client_id = if config.client_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            config.client_id.clone()
        };

        let mut opts = MqttOptions::new(client_id, config.host.clone(), config.port);
        opts.set_keep_alive(Duration::from_secs(config.keep_alive));
        opts.set_clean_session(config.clean_session);
        opts.set_inflight(config.max_inflight);

        if let Some(max_packet_size) = config.max_packet_size {
            opts.set_max_packet_size(max_packet_size as usize, max_packet_size as usize);
        }

        if let Some(username) = config.username.as_deref() {
            opts.set_credentials(username, config.password.clone().unwrap_or_default());
        }

        let cap = config.request_channel_capacity.unwrap_or(10) as usize;

        let tls_config = config.tls.clone().filter(TlsConfig::is_enabled);

        Ok(Self {
            opts,
            cap,
            tls_config,
        })
    }

    /// Registers a retained `offline` last will on `status_topic`.
    ///
    /// The broker publishes it if the session drops without a clean DISCONNECT;
    /// the supervisor publishes the matching `online` on every CONNACK.
    pub fn set_last_will(mut self, status_topic: &str) -> Self {
        let last_will = LastWill::new(
            status_topic,
            OFFLINE_PAYLOAD.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
        );
        self.opts.set_last_will(last_will);
        self
    }

    pub fn client_id(&self) -> String {
        self.opts.client_id()
    }

    fn load_file(path: &str) -> Result<Vec<u8>, TransferError> {
        Ok(fs::read(path)?)
    }

    fn build_tls_transport(tls_config: &TlsConfig) -> Result<Transport, TransferError> {
        tls_config
            .validate_config()
            .map_err(|e| TransferError::ClientSetup(format!("Invalid TLS configuration: {e}")))?;

        let ca_path = tls_config
            .ca_cert_path
            .as_deref()
            .ok_or_else(|| TransferError::ClientSetup("TLS configuration is not set".into()))?;
        let ca = Self::load_file(ca_path)?;

        let client_auth = match (
            tls_config.client_cert_path.as_deref(),
            tls_config.client_key_path.as_deref(),
        ) {
            (Some(cert), Some(key)) => Some((Self::load_file(cert)?, Self::load_file(key)?)),
            _ => None,
        };

        Ok(Transport::Tls(TlsConfiguration::Simple {
            ca,
            client_auth,
            alpn: None,
        }))
    }

    /// Builds the client and event loop, loading TLS material if configured.
    pub fn build(self) -> Result<(AsyncClient, EventLoop), TransferError> {
        let mut opts = self.opts;

        if let Some(tls_config) = self.tls_config.as_ref() {
            opts.set_transport(Self::build_tls_transport(tls_config)?);
        }

        Ok(AsyncClient::new(opts, self.cap))
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::Write};

    use tempfile::TempDir;

    use super::*;

    struct TestFiles {
        _temp_dir: TempDir,
        ca_cert: String,
        client_cert: String,
        client_key: String,
    }

    impl TestFiles {
        fn new() -> std::io::Result<Self> {
            let temp_dir = TempDir::new()?;

            let ca_cert = temp_dir.path().join("ca.crt");
            let client_cert = temp_dir.path().join("client.crt");
            let client_key = temp_dir.path().join("client.key");

            File::create(&ca_cert)?.write_all(b"ca certificate content")?;
            File::create(&client_cert)?.write_all(b"client certificate content")?;
            File::create(&client_key)?.write_all(b"client key content")?;

            Ok(TestFiles {
                _temp_dir: temp_dir,
                ca_cert: ca_cert.to_string_lossy().into_owned(),
                client_cert: client_cert.to_string_lossy().into_owned(),
                client_key: client_key.to_string_lossy().into_owned(),
            })
        }
    }

    fn tls_config(tls: TlsConfig) -> Config {
        Config {
            client_id: "test_client".into(),
            port: 8883,
            tls: Some(tls),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_tcp_client() {
        let builder = ClientBuilder::from_config(&Config {
            client_id: "test_client".into(),
            ..Default::default()
        })
        .unwrap()
        .set_last_will("streamdeck/SN1/status");

        assert!(builder.tls_config.is_none());
        assert!(builder.build().is_ok());
    }

    #[test]
    fn test_build_tls_client_with_client_auth() {
        let files = TestFiles::new().expect("Failed to create test files");
        let config = tls_config(TlsConfig {
            ca_cert_path: Some(files.ca_cert.clone()),
            client_cert_path: Some(files.client_cert.clone()),
            client_key_path: Some(files.client_key.clone()),
        });

        let result = ClientBuilder::from_config(&config).unwrap().build();
        assert!(result.is_ok());
    }

    #[test]
    fn test_build_tls_client_ca_only() {
        let files = TestFiles::new().expect("Failed to create test files");
        let config = tls_config(TlsConfig {
            ca_cert_path: Some(files.ca_cert.clone()),
            ..Default::default()
        });

        let result = ClientBuilder::from_config(&config).unwrap().build();
        assert!(result.is_ok());
    }

    #[test]
    fn test_build_tls_missing_ca() {
        let builder = ClientBuilder {
            opts: MqttOptions::new("test_client", "localhost", 8883),
            cap: 10,
            tls_config: Some(TlsConfig {
                ca_cert_path: Some("/nonexistent/ca.crt".into()),
                ..Default::default()
            }),
        };

        assert!(matches!(builder.build(), Err(TransferError::ClientSetup(_))));
    }

    #[test]
    fn test_empty_tls_section_means_plain_tcp() {
        let builder = ClientBuilder::from_config(&tls_config(TlsConfig::default())).unwrap();
        assert!(builder.tls_config.is_none());
    }

    #[test]
    fn test_from_config_generates_client_id() {
        let builder = ClientBuilder::from_config(&Config::default()).unwrap();
        assert_eq!(builder.client_id().len(), 36);
        assert_eq!(builder.cap, 64);
    }

    #[test]
    fn test_from_config_keeps_explicit_client_id() {
        let config = Config {
            client_id: "deckbridge-SN1".into(),
            username: Some("deck".into()),
            password: Some("secret".into()),
            ..Default::default()
        };
        let builder = ClientBuilder::from_config(&config).unwrap();
        assert_eq!(builder.client_id(), "deckbridge-SN1");
    }

    #[test]
    fn test_from_config_invalid() {
        let config = Config {
            host: String::new(),
            ..Default::default()
        };
        assert!(matches!(
            ClientBuilder::from_config(&config),
            Err(TransferError::ConfigError(_))
        ));
    }
}
