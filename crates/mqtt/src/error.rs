//! Error handling for MQTT transfer operations.
//!
//! `TransferError` aggregates configuration, client and connection failures into a
//! single type the bridge can pattern-match on.
//!
//! **Configuration errors** (caught at startup):
//! - `InvalidTopic`: empty topic or wildcard in a publish topic
//! - `ClientSetup`: TLS material or options could not be assembled
//! - `ConfigError`: validation failures in settings
//!
//! **Runtime errors**:
//! - `ClientTransfer`: the request channel rejected a publish/subscribe
//! - `ClientConnection`: network-level connection error
//! - `ConnectionConnectionState`: MQTT state machine violation
//! - `RetriesPolicy`: backoff exhausted
//! - `Io`: file I/O (TLS certificates)

use thiserror::Error;

/// The unified error type for MQTT transfer operations.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Topic is empty or contains characters not allowed for the operation.
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// MQTT client initialization failed.
    ///
    /// Typically a missing or unreadable TLS certificate. The session cannot start.
    #[error("Client setup error: {0}")]
    ClientSetup(String),

    /// Connection kernel could not be started or was already taken.
    #[error("Connection kernel error: {0}")]
    ConnectionKernel(String),

    /// Configuration validation failed.
    #[error("Configuration error: {0}")]
    ConfigError(#[from] validator::ValidationErrors),

    /// The local client could not queue the request (channel full or closed).
    #[error("Client transfer error: {0}")]
    ClientTransfer(#[from] rumqttc::ClientError),

    /// Connection to the broker failed or was lost.
    ///
    /// Boxed to keep the enum small.
    #[error("Client connection error: {0}")]
    ClientConnection(#[from] Box<rumqttc::ConnectionError>),

    /// MQTT state machine encountered an invalid transition.
    #[error("Client connection state error: {0}")]
    ConnectionConnectionState(#[from] rumqttc::StateError),

    /// Retry policy exhausted (max reconnection attempts exceeded).
    #[error("Retry policy error: {0}")]
    RetriesPolicy(#[from] super::backoff::BackoffError),

    /// File I/O failed, usually while loading TLS certificates.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rumqttc::ConnectionError> for TransferError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        TransferError::ClientConnection(Box::new(err))
    }
}
