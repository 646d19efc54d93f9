//! Event loop driver with reconnection and inbound forwarding.
//!
//! `ConnectionKernel` polls the event loop, classifies errors, applies backoff,
//! broadcasts `ConnectionState` and forwards PUBLISH packets to the session.
//!
//! ```text
//! Bridge session  <── InboundMessage (mpsc) ──┐
//!                                             │
//! ConnectionKernel ── poll() ── rumqttc EventLoop ── TCP/TLS ── broker
//! ```

use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Packet, StateError,
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
    backoff::Backoff, error::TransferError, message::InboundMessage, state::ConnectionState,
};

/// Drives the rumqttc event loop for one session.
///
/// Runs on a single task. Inbound PUBLISH packets are handed to the session via
/// `try_send`: a slow consumer loses messages (logged) rather than stalling
/// keep-alive traffic.
pub struct ConnectionKernel {
    client: AsyncClient,
    event_loop: EventLoop,
    is_connected: bool,
    backoff: Backoff,
    cancel: CancellationToken,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    inbound_tx: Option<mpsc::Sender<InboundMessage>>,
}

impl ConnectionKernel {
    /// Creates a kernel with the default backoff policy and no inbound sink.
    pub fn new(client: AsyncClient, event_loop: EventLoop, cancel: CancellationToken) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        Self {
            client,
            event_loop,
            is_connected: false,
            backoff: Backoff::default(),
            cancel,
            state_tx,
            state_rx,
            inbound_tx: None,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Forwards every received PUBLISH to `tx`.
    pub fn with_inbound(mut self, tx: mpsc::Sender<InboundMessage>) -> Self {
        self.inbound_tx = Some(tx);
        self
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    fn update_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current != state {
                *current = state.clone();
                true
            } else {
                false
            }
        });

        if changed {
            info!("Connection state changed to: {}", state);
        }
    }

    /// Main loop: poll, handle events, back off on transient errors.
    ///
    /// Returns `Ok(())` on cancellation (after a best-effort DISCONNECT) and an
    /// error on fatal connection failures or exhausted backoff. In both error
    /// cases the state ends as `Stopped`.
    pub async fn reconnect(&mut self) -> Result<(), TransferError> {
        if self.is_connected {
            warn!("Connection kernel already running");
            return Err(TransferError::ConnectionKernel(
                "kernel is already connected".into(),
            ));
        }

        self.update_state(ConnectionState::Connecting);
        self.backoff.reset();

        info!("Starting connection event loop...");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Shutdown signal received, disconnecting from broker");
                    self.is_connected = false;
                    self.disconnect().await;
                    self.update_state(ConnectionState::Stopped("shutdown".into()));
                    return Ok(());
                }

                event_result = self.event_loop.poll() => {
                    match event_result {
                        Ok(event) => self.handle_event(event),
                        Err(e) => {
                            self.is_connected = false;

                            if is_fatal_error(&e) {
                                error!("Fatal MQTT connection error: {}", get_error_message(&e));
                                self.update_state(ConnectionState::Stopped(e.to_string()));
                                return Err(TransferError::from(e));
                            }

                            self.update_state(ConnectionState::Disconnected(get_error_message(&e)));

                            match self.backoff.next_sleep() {
                                Ok(delay) => {
                                    warn!(
                                        "Reconnecting in {:.2} seconds due to error: {}",
                                        delay.as_secs_f64(),
                                        get_error_message(&e)
                                    );
                                    self.update_state(ConnectionState::Reconnecting(delay.as_secs_f64()));
                                    tokio::select! {
                                        _ = self.cancel.cancelled() => {}
                                        _ = tokio::time::sleep(delay) => {}
                                    }
                                }
                                Err(backoff_err) => {
                                    error!("Maximum retry attempts exceeded: {}", backoff_err);
                                    self.update_state(ConnectionState::Stopped(backoff_err.to_string()));
                                    return Err(TransferError::RetriesPolicy(backoff_err));
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(conn_ack)) => {
                if conn_ack.code == ConnectReturnCode::Success {
                    info!("Connection established successfully");
                    self.is_connected = true;
                    self.backoff.reset();
                    self.update_state(ConnectionState::Connected);
                }
            }
            Event::Incoming(Packet::Publish(publish)) => {
                trace!("Received publish on topic {}", publish.topic);
                self.forward(InboundMessage::from(publish));
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Disconnected by broker");
                self.is_connected = false;
                self.update_state(ConnectionState::Disconnected(
                    "Disconnected by broker".into(),
                ));
            }
            Event::Incoming(_) => {}
            Event::Outgoing(outgoing) => {
                trace!("Outgoing packet: {:?}", outgoing);
            }
        }
    }

    fn forward(&self, message: InboundMessage) {
        let Some(tx) = self.inbound_tx.as_ref() else {
            return;
        };

        match tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!("Inbound queue full, dropping message on {}", msg.topic);
            }
            Err(mpsc::error::TrySendError::Closed(msg)) => {
                debug!("Inbound receiver gone, dropping message on {}", msg.topic);
            }
        }
    }

    /// Best effort: the socket closes either way.
    async fn disconnect(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            warn!("Error queueing disconnect packet: {:?}", e);
            return;
        }
        // Flush the DISCONNECT through the event loop.
        let _ = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                match self.event_loop.poll().await {
                    Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Fatal,
    Reconnect,
}

fn classify_connection_error(err: &ConnectionError) -> Disposition {
    use Disposition::*;

    match err {
        ConnectionError::Tls(_) => Fatal,
        ConnectionError::NotConnAck(_) => Fatal,
        ConnectionError::RequestsDone => Fatal,

        // A peer closing the socket or a missed PINGRESP surfaces here.
        ConnectionError::MqttState(state) => match state {
            StateError::Io(e) => classify_io_error(e),
            StateError::AwaitPingResp | StateError::CollisionTimeout => Reconnect,
            _ => Fatal,
        },

        ConnectionError::Io(e) => classify_io_error(e),

        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => Reconnect,

        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::RefusedProtocolVersion
            | ConnectReturnCode::BadClientId
            | ConnectReturnCode::BadUserNamePassword
            | ConnectReturnCode::NotAuthorized => Fatal,
            _ => Reconnect,
        },

        #[allow(unreachable_patterns)]
        _ => Reconnect,
    }
}

fn classify_io_error(e: &std::io::Error) -> Disposition {
    match e.kind() {
        std::io::ErrorKind::AddrInUse
        | std::io::ErrorKind::PermissionDenied
        | std::io::ErrorKind::InvalidInput
        | std::io::ErrorKind::InvalidData => Disposition::Fatal,
        _ => Disposition::Reconnect,
    }
}

fn is_fatal_error(err: &ConnectionError) -> bool {
    matches!(classify_connection_error(err), Disposition::Fatal)
}

/// Innermost message of an error chain, without surrounding quotes.
fn get_error_message(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use rumqttc::{Publish, QoS};
    use tracing_test::traced_test;

    use super::*;
    use crate::{client::ClientBuilder, config::Config};

    fn test_config() -> Config {
        Config {
            client_id: "test_client_kernel".to_string(),
            keep_alive: 30,
            max_reconnect_attempts: 3,
            ..Default::default()
        }
    }

    fn kernel() -> ConnectionKernel {
        let (client, event_loop) = ClientBuilder::from_config(&test_config())
            .unwrap()
            .build()
            .unwrap();
        ConnectionKernel::new(client, event_loop, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_initial_state_is_connecting() {
        let kernel = kernel();
        assert_eq!(*kernel.subscribe_state().borrow(), ConnectionState::Connecting);
        assert!(!kernel.is_connected);
    }

    #[tokio::test]
    async fn test_publish_is_forwarded() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut kernel = kernel().with_inbound(tx);

        let publish = Publish::new("streamdeck/wake", QoS::AtMostOnce, "");
        kernel.handle_event(Event::Incoming(Packet::Publish(publish)));

        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.topic, "streamdeck/wake");
        assert!(msg.payload.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_full_inbound_queue_drops_message() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut kernel = kernel().with_inbound(tx);

        for topic in ["streamdeck/sleep", "streamdeck/wake"] {
            let publish = Publish::new(topic, QoS::AtMostOnce, "");
            kernel.handle_event(Event::Incoming(Packet::Publish(publish)));
        }

        assert_eq!(rx.try_recv().unwrap().topic, "streamdeck/sleep");
        assert!(rx.try_recv().is_err());
        assert!(logs_contain("Inbound queue full, dropping message on streamdeck/wake"));
    }

    #[tokio::test]
    async fn test_connack_marks_connected() {
        let mut kernel = kernel();
        let state_rx = kernel.subscribe_state();

        kernel.handle_event(Event::Incoming(Packet::ConnAck(rumqttc::ConnAck::new(
            ConnectReturnCode::Success,
            false,
        ))));

        assert!(kernel.is_connected);
        assert_eq!(*state_rx.borrow(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_cancelled_kernel_stops() {
        let mut kernel = kernel();
        let state_rx = kernel.subscribe_state();
        kernel.cancel.cancel();

        assert!(kernel.reconnect().await.is_ok());
        assert!(matches!(*state_rx.borrow(), ConnectionState::Stopped(_)));
    }

    #[test]
    fn test_error_classification() {
        assert!(is_fatal_error(&ConnectionError::ConnectionRefused(
            ConnectReturnCode::BadUserNamePassword
        )));
        assert!(!is_fatal_error(&ConnectionError::ConnectionRefused(
            ConnectReturnCode::ServiceUnavailable
        )));
        assert!(!is_fatal_error(&ConnectionError::NetworkTimeout));
        assert!(!is_fatal_error(&ConnectionError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused"
        ))));
        assert!(is_fatal_error(&ConnectionError::RequestsDone));
    }

    #[test]
    fn test_broker_close_and_ping_timeout_reconnect() {
        let closed_by_peer = StateError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            "connection closed by peer",
        ));
        assert!(!is_fatal_error(&ConnectionError::MqttState(closed_by_peer)));

        let reset = StateError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(!is_fatal_error(&ConnectionError::MqttState(reset)));
        assert!(!is_fatal_error(&ConnectionError::MqttState(
            StateError::AwaitPingResp
        )));
        assert!(!is_fatal_error(&ConnectionError::MqttState(
            StateError::CollisionTimeout
        )));

        assert!(is_fatal_error(&ConnectionError::MqttState(
            StateError::WrongPacket
        )));
        let bad_frame = StateError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "malformed packet",
        ));
        assert!(is_fatal_error(&ConnectionError::MqttState(bad_frame)));
    }
}
