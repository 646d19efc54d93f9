//! Device session coordinator.
//!
//! A `Bridge` owns one device, its state document, and its transport. It
//! subscribes to the command topics, renders key icons, forwards key presses,
//! and tears everything down when its cancellation token fires.
//!
//! ```text
//!  HID reader thread ──KeyEvent──> key task ──publish──> Transport
//!  Transport inbound ──────────> message loop ──> ConfigStore / Device / icons
//! ```

use std::{
    num::IntErrorKind,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use deckbridge_mqtt::InboundMessage;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    device::{Device, DeviceError, KeyEvent},
    icon::{compose_key_image, IconError, IconSource},
    schema::{parse_slot, parse_slots, KeySlot, SchemaError},
    store::{ConfigStore, MAX_BRIGHTNESS},
    topics::{self, Command},
    transport::{Transport, TransportError},
};
use crate::config::bridge::BridgeConfig;

/// Session startup failures.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Why a single key could not be refreshed.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Icon(#[from] IconError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    /// Empty or missing slot; the key keeps its current image.
    Skipped,
    Failed,
}

/// Result of a bulk refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub refreshed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl RefreshSummary {
    fn record(&mut self, outcome: RefreshOutcome) {
        match outcome {
            RefreshOutcome::Refreshed => self.refreshed += 1,
            RefreshOutcome::Skipped => self.skipped += 1,
            RefreshOutcome::Failed => self.failed += 1,
        }
    }
}

/// Parses a brightness payload into `0..=100`.
///
/// Returns the clamped value and whether clamping changed it. Values beyond
/// the integer range saturate before clamping.
pub fn parse_brightness(raw: &str) -> Result<(u8, bool), std::num::ParseIntError> {
    let value = match raw.trim().parse::<i64>() {
        Ok(value) => value,
        Err(e) => match e.kind() {
            IntErrorKind::PosOverflow => i64::MAX,
            IntErrorKind::NegOverflow => i64::MIN,
            _ => return Err(e),
        },
    };

    let clamped = value.clamp(0, i64::from(MAX_BRIGHTNESS));
    Ok((clamped as u8, clamped != value))
}

pub struct Bridge {
    device: Arc<dyn Device>,
    transport: Arc<dyn Transport>,
    icons: Arc<dyn IconSource>,
    store: ConfigStore,
    serial: String,
    key_count: usize,
    key_size: (u32, u32),
    poll_interval: Duration,
    key_event_capacity: usize,
    cancel: CancellationToken,
    stopped: AtomicBool,
}

impl Bridge {
    pub fn new(
        device: Arc<dyn Device>,
        transport: Arc<dyn Transport>,
        icons: Arc<dyn IconSource>,
        store: ConfigStore,
        config: &BridgeConfig,
        cancel: CancellationToken,
    ) -> Self {
        let serial = device.serial_number().to_string();
        let key_count = device.key_count();
        let key_size = device.key_size();

        Self {
            device,
            transport,
            icons,
            store,
            serial,
            key_count,
            key_size,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            key_event_capacity: config.key_event_capacity,
            cancel,
            stopped: AtomicBool::new(false),
        }
    }

    /// Runs a blocking device call off the async workers.
    async fn device_op<R, F>(&self, f: F) -> Result<R, DeviceError>
    where
        F: FnOnce(&dyn Device) -> Result<R, DeviceError> + Send + 'static,
        R: Send + 'static,
    {
        let device = Arc::clone(&self.device);
        tokio::task::spawn_blocking(move || f(device.as_ref())).await?
    }

    /// Resets the device, restores brightness, subscribes, and draws every key.
    ///
    /// Device and subscription failures are fatal for the session; icon
    /// failures are not.
    pub async fn initialize(&self) -> Result<(), BridgeError> {
        info!(
            "Initializing session for {} ({} keys, {}x{})",
            self.serial, self.key_count, self.key_size.0, self.key_size.1
        );

        self.device_op(|device| device.reset()).await?;

        let brightness = self.store.brightness();
        self.device_op(move |device| device.set_brightness(brightness))
            .await?;

        for topic in topics::subscriptions(&self.serial) {
            self.transport.subscribe(&topic).await?;
        }

        self.refresh_all().await;
        Ok(())
    }

    /// Processes inbound messages and key events until cancelled, then shuts
    /// down. A closed inbound channel or a device read failure cancels the
    /// session.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<InboundMessage>) {
        let (key_tx, mut key_rx) = mpsc::channel::<KeyEvent>(self.key_event_capacity);

        let reader = {
            let device = Arc::clone(&self.device);
            let cancel = self.cancel.clone();
            let poll = self.poll_interval;
            tokio::task::spawn_blocking(move || read_keys(device.as_ref(), poll, &cancel, &key_tx))
        };

        let key_task = {
            let bridge = Arc::clone(&self);
            tokio::spawn(async move {
                while let Some(event) = key_rx.recv().await {
                    bridge.on_key_change(event.key, event.pressed).await;
                }
            })
        };

        info!("Session {} running", self.serial);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = inbound.recv() => match message {
                    Some(message) => self.handle_message(&message).await,
                    None => {
                        warn!("Inbound channel closed for {}", self.serial);
                        self.cancel.cancel();
                        break;
                    }
                },
            }
        }

        self.cancel.cancel();
        if let Err(e) = reader.await {
            warn!("Key reader for {} ended abnormally: {}", self.serial, e);
        }
        // The reader owned the only sender; the key task drains and exits.
        if let Err(e) = key_task.await {
            warn!("Key task for {} ended abnormally: {}", self.serial, e);
        }

        self.shutdown().await;
    }

    /// Routes one inbound message. Unknown topics are ignored.
    pub async fn handle_message(&self, message: &InboundMessage) {
        let Some(command) = Command::parse(&message.topic, self.key_count) else {
            debug!("Ignoring message on {}", message.topic);
            return;
        };

        debug!("{:?} on {}", command, message.topic);
        match command {
            Command::Brightness => self.set_brightness(&message.payload_str()).await,
            Command::Sleep => self.sleep().await,
            Command::Wake => self.wake().await,
            Command::ReplaceConfig => self.replace_config(&message.payload).await,
            Command::ReplaceKey(index) => self.replace_key(index, &message.payload).await,
        }
    }

    /// Sets device and persisted brightness from a textual payload.
    pub async fn set_brightness(&self, raw: &str) {
        let (value, clamped) = match parse_brightness(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Rejected brightness {:?}: {}", raw, e);
                return;
            }
        };
        if clamped {
            warn!("Brightness {:?} out of range, clamped to {}", raw.trim(), value);
        }

        if let Err(e) = self.device_op(move |device| device.set_brightness(value)).await {
            error!("Failed to set brightness on {}: {}", self.serial, e);
        }
        if let Err(e) = self.store.mutate(|doc| doc.brightness = value) {
            error!("Failed to persist brightness: {}", e);
        }
        info!("Brightness set to {}", value);
    }

    /// Blanks the display without touching the persisted brightness.
    pub async fn sleep(&self) {
        match self.device_op(|device| device.set_brightness(0)).await {
            Ok(()) => info!("Device {} asleep", self.serial),
            Err(e) => error!("Failed to put {} to sleep: {}", self.serial, e),
        }
    }

    /// Restores the persisted brightness.
    pub async fn wake(&self) {
        let brightness = self.store.brightness();
        match self
            .device_op(move |device| device.set_brightness(brightness))
            .await
        {
            Ok(()) => info!("Device {} awake at brightness {}", self.serial, brightness),
            Err(e) => error!("Failed to wake {}: {}", self.serial, e),
        }
    }

    /// Replaces the whole key array, then redraws every key.
    pub async fn replace_config(&self, payload: &[u8]) {
        let slots = match parse_slots(payload) {
            Ok(slots) => slots,
            Err(e) => {
                warn!("Rejected key configuration: {}", e);
                return;
            }
        };

        let count = slots.len();
        if let Err(e) = self.store.mutate(|doc| doc.keys = slots) {
            error!("Failed to persist key configuration: {}", e);
            return;
        }
        info!("Key configuration replaced ({} slots)", count);

        self.refresh_all().await;
    }

    /// Replaces one slot, padding the array with empty slots if needed, then
    /// redraws that key.
    pub async fn replace_key(&self, index: usize, payload: &[u8]) {
        let slot = match parse_slot(payload) {
            Ok(slot) => slot,
            Err(e) => {
                warn!("Rejected configuration for key {}: {}", index, e);
                return;
            }
        };

        let result = self.store.mutate(|doc| {
            if doc.keys.len() <= index {
                doc.keys.resize(index + 1, KeySlot::empty());
            }
            doc.keys[index] = slot;
        });
        if let Err(e) = result {
            error!("Failed to persist configuration for key {}: {}", index, e);
            return;
        }
        info!("Key {} configuration replaced", index);

        self.refresh(index).await;
    }

    /// Publishes the event topics for a key transition.
    ///
    /// A press publishes only the `down` topics; a release also publishes the
    /// bare click topics.
    pub async fn on_key_change(&self, key: usize, pressed: bool) {
        let topics = if pressed {
            topics::press_topics(&self.serial, key)
        } else {
            topics::release_topics(&self.serial, key)
        };

        for topic in topics {
            if let Err(e) = self.transport.publish(&topic, &[]).await {
                warn!("Failed to publish key {} event on {}: {}", key, topic, e);
            }
        }
    }

    async fn try_refresh(&self, index: usize) -> Result<RefreshOutcome, RefreshError> {
        let Some(slot) = self.store.key(index) else {
            return Ok(RefreshOutcome::Skipped);
        };
        let Some(spec) = slot.spec()? else {
            return Ok(RefreshOutcome::Skipped);
        };

        let (width, height) = self.key_size;
        let icon = self.icons.render(&spec, width, height).await?;
        let image = compose_key_image(&icon);

        self.device_op(move |device| device.set_key_image(index, image))
            .await?;
        Ok(RefreshOutcome::Refreshed)
    }

    /// Redraws one key from its stored slot. Failures are logged and leave
    /// the current image in place.
    pub async fn refresh(&self, index: usize) -> RefreshOutcome {
        match self.try_refresh(index).await {
            Ok(outcome) => {
                debug!("Key {}: {:?}", index, outcome);
                outcome
            }
            Err(e) => {
                warn!("Failed to refresh key {}: {}", index, e);
                RefreshOutcome::Failed
            }
        }
    }

    /// Redraws every configured key; one failing key does not stop the rest.
    pub async fn refresh_all(&self) -> RefreshSummary {
        let slots = self.store.keys().len().min(self.key_count);
        let mut summary = RefreshSummary::default();

        for index in 0..slots {
            summary.record(self.refresh(index).await);
        }

        info!(
            "Refreshed keys on {}: {} drawn, {} empty, {} failed",
            self.serial, summary.refreshed, summary.skipped, summary.failed
        );
        summary
    }

    /// Resets and releases the device, then stops the transport. Only the
    /// first call does anything.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down session {}", self.serial);
        self.cancel.cancel();

        let released = self
            .device_op(|device| {
                device.reset()?;
                device.close()
            })
            .await;
        if let Err(e) = released {
            warn!("Failed to release device {}: {}", self.serial, e);
        }

        if let Err(e) = self.transport.shutdown().await {
            warn!("Failed to stop transport for {}: {}", self.serial, e);
        }
    }
}

/// Polls the device for key transitions until cancelled or the receiver is
/// gone. A read error cancels the session.
fn read_keys(
    device: &dyn Device,
    poll: Duration,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<KeyEvent>,
) {
    while !cancel.is_cancelled() {
        match device.read_key_events(poll) {
            Ok(events) => {
                for event in events {
                    if tx.blocking_send(event).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                error!("Key reader stopped: {}", e);
                cancel.cancel();
                return;
            }
        }
    }
}
