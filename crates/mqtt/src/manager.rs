//! High-level MQTT manager that coordinates all components.
//!
//! The `MqttManager` is the entry point for a device session. It:
//! 1. Builds the MQTT client (with an `offline` last will when a status topic is set)
//! 2. Spawns the connection kernel with reconnect/backoff
//! 3. Creates the supervisor and subscription manager
//! 4. Returns an `MqttInstance` for the session to use
//!
//! # Base Topic Support
//!
//! The `base_topic` from configuration is applied to every operation:
//! - Subscriptions: `topic` → `{base_topic}/topic`
//! - Publications: `topic` → `{base_topic}/topic`
//!
//! Inbound messages keep the full topic.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use rumqttc::{AsyncClient, QoS, SubscribeFilter};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    backoff::Backoff,
    client::{ClientBuilder, OFFLINE_PAYLOAD},
    config::Config,
    connection::ConnectionKernel,
    error::TransferError,
    message::InboundMessage,
    supervisor::Supervisor,
};

fn join_topic(base_topic: &str, topic: &str) -> String {
    if base_topic.is_empty() {
        topic.to_string()
    } else {
        format!(
            "{}/{}",
            base_topic.trim_end_matches('/'),
            topic.trim_start_matches('/')
        )
    }
}

/// Builds the MQTT infrastructure for one session.
pub struct MqttManager {
    config: Config,

    /// Status topic relative to the base topic.
    status_topic: Option<String>,

    cancel_token: CancellationToken,
}

impl MqttManager {
    pub fn from_config(config: Config) -> Result<Self, TransferError> {
        Ok(Self {
            config,
            status_topic: None,
            cancel_token: CancellationToken::new(),
        })
    }

    /// Uses `token` as the instance token.
    ///
    /// A fatal connection error cancels it, so owners can watch it to learn that
    /// the connection is gone for good. Cancelling it directly stops the
    /// connection without the final `offline` publish; prefer
    /// `MqttInstance::shutdown`.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    /// Enables availability on `topic` (relative to the base topic): retained
    /// `online` after each CONNACK, retained `offline` as last will and on shutdown.
    pub fn with_status_topic(mut self, topic: impl Into<String>) -> Self {
        self.status_topic = Some(topic.into());
        self
    }

    /// Builds the client, spawns the connection kernel and returns the instance.
    ///
    /// The connection itself is established asynchronously; the supervisor
    /// started by `MqttInstance::start_monitoring` reacts to it.
    pub async fn build_and_start(self) -> Result<MqttInstance, TransferError> {
        info!(
            "Building MQTT infrastructure with base_topic: '{}'",
            self.config.base_topic
        );

        let status_topic = self
            .status_topic
            .as_deref()
            .map(|topic| join_topic(&self.config.base_topic, topic));

        let mut builder = ClientBuilder::from_config(&self.config)?;
        if let Some(topic) = status_topic.as_deref() {
            builder = builder.set_last_will(topic);
        }
        let client_id = builder.client_id();
        let (client, event_loop) = builder.build()?;

        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.inbound_channel_capacity);

        // Stops the kernel; cancelled after the instance token so the final
        // status publish is flushed first.
        let connection_cancel = CancellationToken::new();
        let mut connection_kernel =
            ConnectionKernel::new(client.clone(), event_loop, connection_cancel.clone())
                .with_backoff(Backoff::from_config(&self.config))
                .with_inbound(inbound_tx);
        let state_rx = connection_kernel.subscribe_state();

        let subscription_manager = SubscriptionManager::new(&self.config.base_topic, client.clone());

        let supervisor = Supervisor::new(
            status_topic.clone(),
            state_rx,
            client.clone(),
            subscription_manager.clone(),
            self.cancel_token.clone(),
        );

        info!("MQTT client '{}' built for {}:{}", client_id, self.config.host, self.config.port);

        {
            let session_cancel = self.cancel_token.clone();
            tokio::spawn(async move {
                if let Err(e) = connection_kernel.reconnect().await {
                    error!("MQTT connection kernel exited with error: {}", e);
                    session_cancel.cancel();
                }
            });
        }

        {
            let shutdown_request = self.cancel_token.clone();
            let conn_cancel = connection_cancel.clone();
            tokio::spawn(async move {
                shutdown_request.cancelled().await;
                conn_cancel.cancel();
            });
        }

        Ok(MqttInstance {
            client,
            supervisor,
            subscription_manager,
            cancel_token: self.cancel_token,
            connection_cancel,
            status_topic,
            inbound: Arc::new(Mutex::new(Some(inbound_rx))),
        })
    }
}

/// Tracks subscriptions (relative to the base topic) and restores them on reconnect.
///
/// Operations are best effort: a subscribe that cannot be queued right now is
/// still tracked and retried by `resubscribe_all` after the next CONNACK.
#[derive(Debug, Clone)]
pub struct SubscriptionManager {
    base_topic: String,

    pub(crate) topics: Arc<RwLock<HashSet<String>>>,

    client: Arc<AsyncClient>,
}

impl SubscriptionManager {
    pub fn new(base_topic: &str, client: AsyncClient) -> Self {
        Self {
            base_topic: base_topic.to_string(),
            topics: Arc::new(RwLock::new(HashSet::new())),
            client: Arc::new(client),
        }
    }

    /// `sensor/temp` → `{base_topic}/sensor/temp`.
    pub fn with_base_topic(&self, topic: &str) -> String {
        join_topic(&self.base_topic, topic)
    }

    /// Tracks `topic` and subscribes to it now if possible.
    pub async fn subscribe(&self, topic: &str) -> Result<(), TransferError> {
        if topic.trim_matches('/').is_empty() {
            return Err(TransferError::InvalidTopic("empty subscription".into()));
        }

        {
            let mut topics = self.topics.write().await;
            topics.insert(topic.to_string());
        }

        let full_topic = self.with_base_topic(topic);
        match self.client.try_subscribe(&full_topic, QoS::AtLeastOnce) {
            Ok(()) => debug!("Subscribed to topic: {}", full_topic),
            Err(e) => warn!(
                "Immediate subscription to '{}' failed (will retry on reconnect): {}",
                full_topic, e
            ),
        }
        Ok(())
    }

    /// Re-issues every tracked subscription in one SUBSCRIBE packet.
    pub async fn resubscribe_all(&self) -> Result<(), TransferError> {
        let topics = self.topics.read().await;

        if topics.is_empty() {
            debug!("No topics to resubscribe to");
            return Ok(());
        }

        let filters: Vec<SubscribeFilter> = topics
            .iter()
            .map(|topic| SubscribeFilter::new(self.with_base_topic(topic), QoS::AtLeastOnce))
            .collect();

        info!("Resubscribing to {} topics", filters.len());

        if let Err(e) = self.client.subscribe_many(filters).await {
            error!("Failed to resubscribe to topics: {}", e);
            return Err(e.into());
        }

        Ok(())
    }
}

/// A running MQTT session handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MqttInstance {
    client: AsyncClient,

    supervisor: Supervisor,

    subscription_manager: SubscriptionManager,

    cancel_token: CancellationToken,

    connection_cancel: CancellationToken,

    /// Full status topic, if availability is enabled.
    status_topic: Option<String>,

    inbound: Arc<Mutex<Option<mpsc::Receiver<InboundMessage>>>>,
}

impl MqttInstance {
    fn with_base_topic(&self, topic: &str) -> String {
        self.subscription_manager.with_base_topic(topic)
    }

    pub async fn start_monitoring(&self) -> Result<(), TransferError> {
        self.supervisor.monitor().await
    }

    pub async fn subscribe(&self, topic: &str) -> Result<(), TransferError> {
        self.subscription_manager.subscribe(topic).await
    }

    /// Publishes `payload` on `{base_topic}/topic`.
    ///
    /// # Errors
    /// `InvalidTopic` for empty topics or topics containing wildcards;
    /// `ClientTransfer` when the request channel is closed.
    pub async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), TransferError> {
        if topic.is_empty() || topic.contains(['+', '#']) {
            return Err(TransferError::InvalidTopic(topic.to_string()));
        }

        let full_topic = self.with_base_topic(topic);
        self.client
            .publish(full_topic, qos, retain, payload.into())
            .await?;
        Ok(())
    }

    /// Hands out the inbound message receiver. Returns `None` after the first call.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.inbound.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Publishes the retained `offline` status, then stops the connection.
    ///
    /// The kernel sends a DISCONNECT after draining queued requests. Calling
    /// this more than once is harmless.
    pub async fn shutdown(&self) -> Result<(), TransferError> {
        if self.connection_cancel.is_cancelled() {
            return Ok(());
        }

        if let Some(topic) = self.status_topic.as_deref() {
            if let Err(e) = self.client.try_publish(
                topic,
                QoS::AtLeastOnce,
                true,
                OFFLINE_PAYLOAD.as_bytes().to_vec(),
            ) {
                warn!("Failed to queue offline status: {}", e);
            }
        }

        self.cancel_token.cancel();
        self.connection_cancel.cancel();
        Ok(())
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            client_id: "manager-test".into(),
            max_reconnect_attempts: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_manager_creation() {
        let manager = MqttManager::from_config(test_config()).unwrap();
        assert_eq!(manager.config.host, "localhost");
        assert_eq!(manager.config.base_topic, "streamdeck");
        assert!(manager.status_topic.is_none());
    }

    #[tokio::test]
    async fn test_manager_uses_supplied_token() {
        let parent = CancellationToken::new();
        let manager = MqttManager::from_config(test_config())
            .unwrap()
            .with_cancel_token(parent.child_token());

        parent.cancel();
        assert!(manager.cancel_token.is_cancelled());
    }

    #[tokio::test]
    async fn test_subscription_manager_base_topic() {
        let (client, _) =
            AsyncClient::new(rumqttc::MqttOptions::new("test", "localhost", 1883), 10);

        let manager = SubscriptionManager::new("streamdeck", client.clone());

        assert_eq!(manager.with_base_topic("SN1/brightness"), "streamdeck/SN1/brightness");
        assert_eq!(manager.with_base_topic("/config/+"), "streamdeck/config/+");

        let manager2 = SubscriptionManager::new("", client);
        assert_eq!(manager2.with_base_topic("wake"), "wake");
    }

    #[tokio::test]
    async fn test_subscriptions_are_tracked() {
        let (client, _event_loop) =
            AsyncClient::new(rumqttc::MqttOptions::new("test", "localhost", 1883), 10);
        let manager = SubscriptionManager::new("streamdeck", client);

        manager.subscribe("brightness").await.unwrap();
        manager.subscribe("SN1/config/+").await.unwrap();
        manager.subscribe("brightness").await.unwrap();
        {
            let topics = manager.topics.read().await;
            assert!(topics.contains("SN1/config/+"));
            assert_eq!(topics.len(), 2);
        }

        assert!(manager.subscribe("").await.is_err());
        assert!(manager.subscribe("/").await.is_err());
        assert_eq!(manager.topics.read().await.len(), 2);

        assert!(manager.resubscribe_all().await.is_ok());
    }

    #[tokio::test]
    async fn test_instance_lifecycle() {
        let instance = MqttManager::from_config(test_config())
            .unwrap()
            .with_status_topic("SN1/status")
            .build_and_start()
            .await
            .unwrap();

        assert!(instance.take_inbound().is_some());
        assert!(instance.take_inbound().is_none());

        assert!(matches!(
            instance.publish("3/+", QoS::AtMostOnce, false, Vec::new()).await,
            Err(TransferError::InvalidTopic(_))
        ));
        assert!(instance
            .publish("SN1/3/down", QoS::AtMostOnce, false, Vec::new())
            .await
            .is_ok());

        instance.shutdown().await.unwrap();
        assert!(instance.cancel_token().is_cancelled());
        instance.shutdown().await.unwrap();
    }
}
