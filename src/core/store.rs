//! Persisted per-device state: brightness and key slots.
//!
//! The document lives in one JSON file. It is loaded once per session, mutated
//! in memory under a mutex, and rewritten in full after each mutation through a
//! temporary sibling file and a rename, so readers never observe a partial write.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use super::schema::KeySlot;

/// Inclusive upper bound of the brightness percentage.
pub const MAX_BRIGHTNESS: u8 = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state file {0} does not exist")]
    NotFound(PathBuf),

    #[error("I/O error on state file: {0}")]
    Io(#[from] io::Error),

    #[error("state file is not a valid document: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(deserialize_with = "clamped_brightness")]
    pub brightness: u8,

    #[serde(default)]
    pub keys: Vec<KeySlot>,

    /// Top-level fields this version does not know about.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StateDocument {
    pub fn with_brightness(brightness: u8) -> Self {
        Self {
            brightness: brightness.min(MAX_BRIGHTNESS),
            keys: Vec::new(),
            extra: Map::new(),
        }
    }
}

/// Accepts any JSON number and clamps it into `0..=100`, so a hand-edited
/// brightness does not cost the key layout.
fn clamped_brightness<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let number = serde_json::Number::deserialize(deserializer)?;
    let value = if let Some(v) = number.as_i64() {
        v.clamp(0, i64::from(MAX_BRIGHTNESS)) as u8
    } else if number.as_u64().is_some() {
        MAX_BRIGHTNESS
    } else {
        match number.as_f64() {
            Some(v) if v.is_finite() => v.round().clamp(0.0, f64::from(MAX_BRIGHTNESS)) as u8,
            _ => return Err(de::Error::custom(format!("invalid brightness {number}"))),
        }
    };

    if number.as_u64() != Some(u64::from(value)) {
        warn!("Persisted brightness {} is not a percentage, using {}", number, value);
    }
    Ok(value)
}

impl Default for StateDocument {
    fn default() -> Self {
        Self::with_brightness(60)
    }
}

/// The session's state document and the file backing it.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    state: Mutex<StateDocument>,
}

impl ConfigStore {
    /// Loads `path`, falling back to a fresh document with `default_brightness`.
    pub fn open(path: impl Into<PathBuf>, default_brightness: u8) -> Self {
        let path = path.into();
        let state = Self::load(&path, default_brightness);
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    /// Never fails: a missing or unreadable file yields the default document and
    /// a log line naming the cause.
    pub fn load(path: &Path, default_brightness: u8) -> StateDocument {
        match Self::read(path) {
            Ok(doc) => {
                debug!("Loaded state with {} key slots from {}", doc.keys.len(), path.display());
                doc
            }
            Err(StoreError::NotFound(_)) => {
                debug!("No state file at {}, starting empty", path.display());
                StateDocument::with_brightness(default_brightness)
            }
            Err(e) => {
                warn!("Ignoring state file {}: {}", path.display(), e);
                StateDocument::with_brightness(default_brightness)
            }
        }
    }

    fn read(path: &Path) -> Result<StateDocument, StoreError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn guard(&self) -> MutexGuard<'_, StateDocument> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> StateDocument {
        self.guard().clone()
    }

    pub fn brightness(&self) -> u8 {
        self.guard().brightness
    }

    pub fn keys(&self) -> Vec<KeySlot> {
        self.guard().keys.clone()
    }

    /// Slot at `index`; `None` past the end of the stored array.
    pub fn key(&self, index: usize) -> Option<KeySlot> {
        self.guard().keys.get(index).cloned()
    }

    /// Applies `f` and persists the result while holding the lock.
    ///
    /// If the write fails the in-memory document is rolled back, so memory and
    /// disk stay in agreement.
    pub fn mutate<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut StateDocument) -> R,
    {
        let mut state = self.guard();
        let previous = state.clone();
        let result = f(&mut state);

        if let Err(e) = Self::write(&self.path, &state) {
            *state = previous;
            return Err(e);
        }
        Ok(result)
    }

    /// Writes the current document.
    pub fn save(&self) -> Result<(), StoreError> {
        let state = self.guard();
        Self::write(&self.path, &state)
    }

    fn write(path: &Path, doc: &StateDocument) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(doc)?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".to_string());
        let tmp = path.with_file_name(format!(".{file_name}.tmp"));

        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }

        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}
