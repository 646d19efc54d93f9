//! Inbound messages forwarded from the connection kernel.

use rumqttc::Publish;

/// A PUBLISH received on one of the session's subscriptions.
///
/// `topic` is the full topic as sent by the broker, base topic included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }

    /// Payload decoded as UTF-8, lossily.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

impl From<Publish> for InboundMessage {
    fn from(publish: Publish) -> Self {
        Self {
            topic: publish.topic,
            payload: publish.payload.to_vec(),
            retain: publish.retain,
        }
    }
}

#[cfg(test)]
mod tests {
    use rumqttc::QoS;

    use super::*;

    #[test]
    fn test_from_publish() {
        let mut publish = Publish::new("streamdeck/brightness", QoS::AtLeastOnce, "42");
        publish.retain = true;

        let msg = InboundMessage::from(publish);
        assert_eq!(msg.topic, "streamdeck/brightness");
        assert_eq!(msg.payload, b"42");
        assert!(msg.retain);
    }

    #[test]
    fn test_payload_str_lossy() {
        let msg = InboundMessage::new("t", vec![b'o', b'k', 0xff]);
        assert_eq!(msg.payload_str(), "ok\u{fffd}");
    }
}
