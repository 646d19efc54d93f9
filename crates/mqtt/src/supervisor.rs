//! Connection state monitoring and lifecycle management.
//!
//! The `Supervisor` watches the kernel's state channel and reacts to lifecycle
//! events:
//! - publishing the retained `online` availability message
//! - re-subscribing every tracked topic after a (re)connect
//!
//! It runs in the background once started via `MqttInstance::start_monitoring`.

use rumqttc::{AsyncClient, QoS};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{error::TransferError, manager::SubscriptionManager, state::ConnectionState};

/// Payload published (retained) on the status topic after every CONNACK.
pub const ONLINE_PAYLOAD: &str = "online";

/// Monitors connection state and restores session-level state on connect.
#[derive(Debug, Clone)]
pub struct Supervisor {
    state_rx: watch::Receiver<ConnectionState>,

    /// Full status topic, base topic included. `None` disables availability.
    status_topic: Option<String>,

    subscriptions: SubscriptionManager,

    client: AsyncClient,

    cancel_token: CancellationToken,
}

impl Supervisor {
    pub fn new(
        status_topic: Option<String>,
        state_rx: watch::Receiver<ConnectionState>,
        client: AsyncClient,
        subscriptions: SubscriptionManager,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            state_rx,
            status_topic,
            subscriptions,
            client,
            cancel_token,
        }
    }

    async fn publish_online_status(&self) -> Result<(), TransferError> {
        let Some(topic) = self.status_topic.as_deref() else {
            return Ok(());
        };

        self.client
            .publish(topic, QoS::AtLeastOnce, true, ONLINE_PAYLOAD.as_bytes().to_vec())
            .await?;
        info!("Published online status to {}", topic);
        Ok(())
    }

    /// Publishes availability and restores subscriptions. Both are best effort.
    async fn on_connect(&self) {
        if let Err(e) = self.publish_online_status().await {
            warn!("Failed to publish online status: {}", e);
        }

        if let Err(e) = self.subscriptions.resubscribe_all().await {
            warn!("Failed to restore subscriptions: {}", e);
        }
    }

    /// Starts the background monitoring task and returns immediately.
    ///
    /// If the connection is already up, the connect handler runs before the task
    /// is spawned.
    pub async fn monitor(&self) -> Result<(), TransferError> {
        let state_rx = self.state_rx.clone();
        let cancel = self.cancel_token.clone();

        if state_rx.borrow().is_connected() {
            info!("Already connected when supervisor started");
            self.on_connect().await;
        }

        tokio::spawn({
            let supervisor = self.clone();
            async move {
                supervisor.run_monitor_loop(state_rx, cancel).await;
            }
        });

        Ok(())
    }

    async fn run_monitor_loop(
        &self,
        mut state_rx: watch::Receiver<ConnectionState>,
        cancel: CancellationToken,
    ) {
        debug!("Supervisor monitoring started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Supervisor shutting down due to cancellation");
                    break;
                }

                changed = state_rx.changed() => {
                    if changed.is_err() {
                        debug!("State channel closed, supervisor exiting");
                        break;
                    }

                    let state = state_rx.borrow_and_update().clone();
                    match state {
                        ConnectionState::Connected => self.on_connect().await,
                        ConnectionState::Disconnected(reason) => {
                            warn!("Disconnected from MQTT broker: {}", reason);
                        }
                        ConnectionState::Stopped(reason) => {
                            warn!("MQTT connection stopped: {}", reason);
                            break;
                        }
                        ConnectionState::Connecting | ConnectionState::Reconnecting(_) => {}
                    }
                }
            }
        }

        debug!("Supervisor monitoring stopped");
    }
}

#[cfg(test)]
mod tests {
    use rumqttc::MqttOptions;

    use super::*;

    #[tokio::test]
    async fn test_on_connect_keeps_tracked_topics() {
        let (client, _event_loop) =
            AsyncClient::new(MqttOptions::new("supervisor-test", "localhost", 1883), 10);
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let cancel = CancellationToken::new();

        let subscriptions = SubscriptionManager::new("streamdeck", client.clone());
        subscriptions.subscribe("brightness").await.unwrap();

        let supervisor = Supervisor::new(
            Some("streamdeck/SN1/status".into()),
            state_rx,
            client,
            subscriptions.clone(),
            cancel,
        );
        assert!(supervisor.publish_online_status().await.is_ok());
        supervisor.on_connect().await;

        assert!(subscriptions.topics.read().await.contains("brightness"));
        assert_eq!(supervisor.status_topic.as_deref(), Some("streamdeck/SN1/status"));
    }

    #[tokio::test]
    async fn test_monitor_stops_on_terminal_state() {
        let (client, _event_loop) =
            AsyncClient::new(MqttOptions::new("supervisor-test", "localhost", 1883), 10);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let cancel = CancellationToken::new();
        let subscriptions = SubscriptionManager::new("streamdeck", client.clone());

        let supervisor = Supervisor::new(None, state_rx, client, subscriptions, cancel);
        supervisor.monitor().await.unwrap();
        drop(supervisor);

        state_tx
            .send(ConnectionState::Stopped("bad credentials".into()))
            .unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), state_tx.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_status_topic_is_noop() {
        let (client, _event_loop) =
            AsyncClient::new(MqttOptions::new("supervisor-test", "localhost", 1883), 10);
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let cancel = CancellationToken::new();
        let subscriptions = SubscriptionManager::new("streamdeck", client.clone());

        let supervisor = Supervisor::new(None, state_rx, client, subscriptions, cancel);
        assert!(supervisor.publish_online_status().await.is_ok());
        assert!(supervisor.status_topic.is_none());
    }
}
