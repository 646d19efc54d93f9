//! # deckbridge_mqtt: reconnecting MQTT client for device sessions
//!
//! A small async MQTT layer on top of `rumqttc` used by every deckbridge device
//! session. It adds:
//!
//! - **Automatic reconnection** with exponential backoff
//! - **State monitoring** through a `watch` channel
//! - **Subscription persistence**: tracked topics are re-subscribed after reconnect
//! - **Inbound delivery**: PUBLISH packets are forwarded to an mpsc channel
//! - **Availability**: retained `online` status on connect, `offline` last will
//! - **TLS/SSL** with optional client certificate authentication
//!
//! # Quick Start
//!
//! ```ignore
//! use deckbridge_mqtt::{MqttManager, Config};
//!
//! let config = Config {
//!     base_topic: "streamdeck".into(),
//!     host: "broker.local".into(),
//!     ..Default::default()
//! };
//!
//! let instance = MqttManager::from_config(config)?
//!     .with_status_topic("AL12H1A01234/status")
//!     .build_and_start()
//!     .await?;
//!
//! instance.start_monitoring().await?;
//! instance.subscribe("brightness").await?;
//!
//! let mut inbound = instance.take_inbound().expect("inbound taken once");
//! while let Some(msg) = inbound.recv().await {
//!     println!("{} -> {} bytes", msg.topic, msg.payload.len());
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │     Device session (bridge)          │
//! └────────────┬─────────────────────────┘
//!              │ subscribe / publish / inbound
//! ┌────────────▼─────────────────────────┐
//! │ MqttInstance, Supervisor,            │
//! │ SubscriptionManager                  │
//! └────────────┬─────────────────────────┘
//!              │
//! ┌────────────▼─────────────────────────┐
//! │ ClientBuilder, ConnectionKernel      │
//! │ State, Backoff, Error handling       │
//! └────────────┬─────────────────────────┘
//!              │
//! ┌────────────▼─────────────────────────┐
//! │     rumqttc AsyncClient & EventLoop  │
//! └──────────────────────────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! ```text
//! Connecting ──(CONNACK)──> Connected
//!                              │
//!                       (network error)
//!                              ▼
//!                        Reconnecting(secs) ──(delay elapsed)──> Connecting
//! ```
//!
//! Fatal errors (bad credentials, TLS failures, exhausted backoff) end the
//! connection kernel and cancel the instance's token, which the owning session
//! observes to tear itself down.

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod message;
pub mod state;
pub mod supervisor;

pub use client::ClientBuilder;
pub use config::{Config, TlsConfig};
pub use connection::ConnectionKernel;
pub use error::TransferError;
pub use manager::{MqttInstance, MqttManager, SubscriptionManager};
pub use message::InboundMessage;
pub use rumqttc::QoS;
pub use state::ConnectionState;
pub use supervisor::Supervisor;

/// Result type for MQTT operations.
///
/// All fallible operations in this crate return this type.
pub type Result<T> = std::result::Result<T, TransferError>;
