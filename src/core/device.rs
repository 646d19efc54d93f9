//! Device adapter: the `Device` seam and its Elgato Stream Deck implementation.
//!
//! All methods are blocking HID calls. Async callers go through
//! `spawn_blocking`; the key reader runs on its own blocking thread.

use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use elgato_streamdeck::{
    info::{ImageMode, Kind},
    list_devices, new_hidapi, StreamDeck, StreamDeckInput,
};
use hidapi::HidApi;
use image::DynamicImage;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("HID error: {0}")]
    Hid(String),

    #[error("device {0} is closed")]
    Closed(String),

    #[error("key {key} out of range (device has {count} keys)")]
    KeyOutOfRange { key: usize, count: usize },

    #[error("device task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<elgato_streamdeck::StreamDeckError> for DeviceError {
    fn from(e: elgato_streamdeck::StreamDeckError) -> Self {
        DeviceError::Hid(e.to_string())
    }
}

impl From<hidapi::HidError> for DeviceError {
    fn from(e: hidapi::HidError) -> Self {
        DeviceError::Hid(e.to_string())
    }
}

/// A key transition reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: usize,
    pub pressed: bool,
}

/// Operations the bridge needs from a keypad with per-key displays.
pub trait Device: Send + Sync {
    fn serial_number(&self) -> &str;

    fn key_count(&self) -> usize;

    /// Native key image size in pixels, `(width, height)`.
    fn key_size(&self) -> (u32, u32);

    /// `percent` is already clamped to 0..=100.
    fn set_brightness(&self, percent: u8) -> Result<(), DeviceError>;

    fn set_key_image(&self, key: usize, image: DynamicImage) -> Result<(), DeviceError>;

    /// Clears all key images and shows the device's idle screen.
    fn reset(&self) -> Result<(), DeviceError>;

    /// Releases the handle. Later calls fail with `DeviceError::Closed`.
    fn close(&self) -> Result<(), DeviceError>;

    /// Waits up to `timeout` for input and returns the key transitions seen.
    fn read_key_events(&self, timeout: Duration) -> Result<Vec<KeyEvent>, DeviceError>;
}

/// Enumerates and opens Stream Decks through a shared `HidApi` context.
pub struct DeviceManager {
    hid: HidApi,
}

impl DeviceManager {
    pub fn new() -> Result<Self, DeviceError> {
        Ok(Self { hid: new_hidapi()? })
    }

    /// Connected devices that have key displays. Display-less models (pedals)
    /// cannot show icons and are skipped.
    pub fn visual_devices(&self) -> Vec<(Kind, String)> {
        list_devices(&self.hid)
            .into_iter()
            .filter(|(kind, serial)| {
                let visual = !matches!(kind.key_image_format().mode, ImageMode::None);
                if !visual {
                    info!("Skipping {:?} ({}): no key displays", kind, serial);
                }
                visual
            })
            .collect()
    }

    pub fn open(&self, kind: Kind, serial: &str) -> Result<StreamDeckDevice, DeviceError> {
        let deck = StreamDeck::connect(&self.hid, kind, serial)?;
        let serial = deck.serial_number().unwrap_or_else(|_| serial.to_string());
        let (width, height) = kind.key_image_format().size;
        let key_count = kind.key_count() as usize;

        info!(
            "Opened {:?} {} with {} keys of {}x{}",
            kind, serial, key_count, width, height
        );

        Ok(StreamDeckDevice {
            deck: Mutex::new(Some(deck)),
            serial,
            key_count,
            key_size: (width as u32, height as u32),
            key_states: Mutex::new(vec![false; key_count]),
        })
    }
}

pub struct StreamDeckDevice {
    deck: Mutex<Option<StreamDeck>>,
    serial: String,
    key_count: usize,
    key_size: (u32, u32),
    /// Last reported pressed state per key, used to derive transitions.
    key_states: Mutex<Vec<bool>>,
}

impl StreamDeckDevice {
    fn with_deck<R>(
        &self,
        f: impl FnOnce(&StreamDeck) -> Result<R, DeviceError>,
    ) -> Result<R, DeviceError> {
        let guard: MutexGuard<'_, Option<StreamDeck>> =
            self.deck.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(deck) => f(deck),
            None => Err(DeviceError::Closed(self.serial.clone())),
        }
    }

    fn key_index(&self, key: usize) -> Result<u8, DeviceError> {
        if key >= self.key_count {
            return Err(DeviceError::KeyOutOfRange {
                key,
                count: self.key_count,
            });
        }
        u8::try_from(key).map_err(|_| DeviceError::KeyOutOfRange {
            key,
            count: self.key_count,
        })
    }
}

impl Device for StreamDeckDevice {
    fn serial_number(&self) -> &str {
        &self.serial
    }

    fn key_count(&self) -> usize {
        self.key_count
    }

    fn key_size(&self) -> (u32, u32) {
        self.key_size
    }

    fn set_brightness(&self, percent: u8) -> Result<(), DeviceError> {
        self.with_deck(|deck| Ok(deck.set_brightness(percent)?))
    }

    fn set_key_image(&self, key: usize, image: DynamicImage) -> Result<(), DeviceError> {
        let key = self.key_index(key)?;
        self.with_deck(|deck| {
            deck.set_button_image(key, image)?;
            deck.flush()?;
            Ok(())
        })
    }

    fn reset(&self) -> Result<(), DeviceError> {
        self.with_deck(|deck| Ok(deck.reset()?))
    }

    fn close(&self) -> Result<(), DeviceError> {
        let mut guard = self.deck.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.take().is_some() {
            debug!("Closed device {}", self.serial);
        }
        Ok(())
    }

    fn read_key_events(&self, timeout: Duration) -> Result<Vec<KeyEvent>, DeviceError> {
        let input = self.with_deck(|deck| Ok(deck.read_input(Some(timeout))?))?;

        let StreamDeckInput::ButtonStateChange(states) = input else {
            return Ok(Vec::new());
        };

        let mut last = self.key_states.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(diff_key_states(&mut last, &states))
    }
}

/// Transitions between `last` and `current`; `last` is updated in place.
fn diff_key_states(last: &mut Vec<bool>, current: &[bool]) -> Vec<KeyEvent> {
    if last.len() < current.len() {
        last.resize(current.len(), false);
    }

    current
        .iter()
        .enumerate()
        .filter_map(|(key, &pressed)| {
            if last[key] == pressed {
                return None;
            }
            last[key] = pressed;
            Some(KeyEvent { key, pressed })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_reports_transitions_only() {
        let mut last = vec![false; 6];

        let events = diff_key_states(&mut last, &[false, false, false, true, false, false]);
        assert_eq!(events, vec![KeyEvent { key: 3, pressed: true }]);

        let events = diff_key_states(&mut last, &[true, false, false, true, false, false]);
        assert_eq!(events, vec![KeyEvent { key: 0, pressed: true }]);

        let events = diff_key_states(&mut last, &[false, false, false, false, false, false]);
        assert_eq!(
            events,
            vec![
                KeyEvent { key: 0, pressed: false },
                KeyEvent { key: 3, pressed: false },
            ]
        );

        assert!(diff_key_states(&mut last, &[false; 6]).is_empty());
    }

    #[test]
    fn test_diff_grows_state() {
        let mut last = Vec::new();
        let events = diff_key_states(&mut last, &[false, true]);
        assert_eq!(events, vec![KeyEvent { key: 1, pressed: true }]);
        assert_eq!(last.len(), 2);
    }
}
