//! Wires one opened device to its own MQTT connection, icon resolver and state
//! file, then runs the bridge until cancelled.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use deckbridge_mqtt::{MqttManager, TransferError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{
    bridge::{Bridge, BridgeError},
    device::Device,
    icon::{IconError, IconResolver},
    store::ConfigStore,
    topics,
    transport::MqttTransport,
};
use crate::config::Config;

const DEFAULT_CLIENT_ID: &str = "deckbridge";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("MQTT setup failed: {0}")]
    Mqtt(#[from] TransferError),

    #[error("icon resolver setup failed: {0}")]
    Icons(#[from] IconError),

    #[error("session startup failed: {0}")]
    Startup(#[from] BridgeError),

    #[error("inbound channel already taken")]
    InboundTaken,

    #[error("MQTT connection lost permanently")]
    ConnectionLost,
}

/// Client id for a device session: the configured id (or `deckbridge`) with
/// the serial appended, so sessions sharing a broker never collide.
pub fn client_id_for(configured: &str, serial: &str) -> String {
    let prefix = if configured.trim().is_empty() {
        DEFAULT_CLIENT_ID
    } else {
        configured.trim()
    };
    format!("{prefix}-{serial}")
}

/// Runs a device session to completion.
///
/// Returns `Ok` after a requested shutdown. A fatal MQTT error cancels the
/// session and is reported as `ConnectionLost`.
pub async fn run_session(
    config: &Config,
    device: Arc<dyn Device>,
    cancel: CancellationToken,
) -> Result<(), SessionError> {
    let serial = device.serial_number().to_string();
    let icons = Arc::new(IconResolver::new(&config.bridge)?);

    let mut transport_config = config.transport.clone();
    transport_config.client_id = client_id_for(&transport_config.client_id, &serial);
    debug!("Session {} uses MQTT client id '{}'", serial, transport_config.client_id);

    // Independent of `cancel`: the bridge's shutdown must still be able to
    // publish `offline` after the session token fires.
    let instance_token = CancellationToken::new();
    let instance = MqttManager::from_config(transport_config)?
        .with_cancel_token(instance_token.clone())
        .with_status_topic(topics::status_topic(&serial))
        .build_and_start()
        .await?;

    let lost = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        let lost = Arc::clone(&lost);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = instance_token.cancelled() => {
                    lost.store(true, Ordering::Release);
                    cancel.cancel();
                }
            }
        });
    }

    instance.start_monitoring().await?;
    let Some(inbound) = instance.take_inbound() else {
        instance.shutdown().await?;
        return Err(SessionError::InboundTaken);
    };

    let store = ConfigStore::open(
        config.bridge.state_file_for(&serial),
        config.bridge.default_brightness,
    );
    info!("Session {} state file: {}", serial, store.path().display());

    let transport = Arc::new(MqttTransport::new(instance, config.bridge.event_qos));
    let bridge = Arc::new(Bridge::new(
        device,
        transport,
        icons,
        store,
        &config.bridge,
        cancel,
    ));

    if let Err(e) = bridge.initialize().await {
        error!("Session {} failed to start: {}", serial, e);
        bridge.shutdown().await;
        return Err(e.into());
    }

    bridge.run(inbound).await;

    if lost.load(Ordering::Acquire) {
        return Err(SessionError::ConnectionLost);
    }
    info!("Session {} stopped", serial);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_for() {
        assert_eq!(client_id_for("", "SN1"), "deckbridge-SN1");
        assert_eq!(client_id_for("  ", "SN1"), "deckbridge-SN1");
        assert_eq!(client_id_for("office", "SN1"), "office-SN1");
    }
}
