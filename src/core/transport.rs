//! Transport seam between a bridge session and the message bus.
//!
//! Topics passed through `Transport` are relative to the configured base topic.

use async_trait::async_trait;
use deckbridge_mqtt::{MqttInstance, QoS, TransferError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Mqtt(#[from] TransferError),

    #[error("transport is shut down")]
    Closed,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Stops background work and disconnects. Idempotent.
    async fn shutdown(&self) -> Result<(), TransportError>;
}

/// `Transport` over a `deckbridge_mqtt` instance.
pub struct MqttTransport {
    instance: MqttInstance,
    qos: QoS,
}

impl MqttTransport {
    /// `qos` (0-2) applies to every publish.
    pub fn new(instance: MqttInstance, qos: u8) -> Self {
        let qos = match qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        };
        Self { instance, qos }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        Ok(self.instance.subscribe(topic).await?)
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        if self.instance.cancel_token().is_cancelled() {
            return Err(TransportError::Closed);
        }
        Ok(self
            .instance
            .publish(topic, self.qos, false, payload.to_vec())
            .await?)
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        Ok(self.instance.shutdown().await?)
    }
}
