//! Per-session bridge settings: state persistence, icon resolution, and event
//! publishing.

use std::path::Path;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Material Design Icons SVG repository; `{}` is the asset name.
pub const DEFAULT_ICON_URL: &str =
    "https://raw.githubusercontent.com/Templarian/MaterialDesign-SVG/refs/heads/master/svg/{}.svg";

/// Placeholder in `state_file` replaced with the device serial number.
pub const SERIAL_PLACEHOLDER: &str = "{serial}";

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BridgeConfig {
    /// Path of the persisted key/brightness document. `{serial}` is substituted;
    /// a path without it gets `-<serial>` before the extension.
    #[validate(length(min = 1, message = "State file path cannot be empty"))]
    pub state_file: String,

    /// URL template for `mdi:` icons; must contain `{}`.
    #[validate(custom(function = "validate_url_template"))]
    pub icon_url_template: String,

    /// Fill applied to `mdi:` icons without an explicit `color`.
    #[validate(length(min = 1, message = "Default icon color cannot be empty"))]
    pub default_icon_color: String,

    /// Upper bound on a single icon download, in seconds.
    #[validate(range(
        min = 1,
        max = 120,
        message = "Icon fetch timeout must be between 1 and 120 seconds"
    ))]
    pub icon_fetch_timeout_secs: u64,

    /// Rasterisation scale relative to the key size before downsampling.
    #[validate(range(min = 1, max = 8, message = "Oversample must be between 1 and 8"))]
    pub oversample: u32,

    /// Brightness used when no state file exists yet.
    #[validate(range(max = 100, message = "Default brightness must be between 0 and 100"))]
    pub default_brightness: u8,

    /// QoS for key event publishes (0, 1 or 2).
    #[validate(range(max = 2, message = "Event QoS must be 0, 1 or 2"))]
    pub event_qos: u8,

    /// How long the HID reader blocks per poll, in milliseconds.
    #[validate(range(
        min = 1,
        max = 1000,
        message = "Poll interval must be between 1 and 1000 ms"
    ))]
    pub poll_interval_ms: u64,

    /// Capacity of the key event channel between the HID reader and the session.
    #[validate(range(min = 1, message = "Key event channel capacity must be positive"))]
    pub key_event_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            state_file: "data-{serial}.json".to_string(),
            icon_url_template: DEFAULT_ICON_URL.to_string(),
            default_icon_color: "blue".to_string(),
            icon_fetch_timeout_secs: 10,
            oversample: 2,
            default_brightness: 60,
            event_qos: 0,
            poll_interval_ms: 50,
            key_event_capacity: 64,
        }
    }
}

impl BridgeConfig {
    /// State file path for the device with `serial`. Distinct serials always
    /// resolve to distinct paths, including their temp siblings.
    pub fn state_file_for(&self, serial: &str) -> String {
        if self.state_file.contains(SERIAL_PLACEHOLDER) {
            return self.state_file.replace(SERIAL_PLACEHOLDER, serial);
        }

        let path = Path::new(&self.state_file);
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_name = match path.extension() {
            Some(ext) => format!("{stem}-{serial}.{}", ext.to_string_lossy()),
            None => format!("{stem}-{serial}"),
        };
        path.with_file_name(file_name).to_string_lossy().into_owned()
    }

    /// `icon_url_template` with `{}` replaced by `name`.
    pub fn icon_url(&self, name: &str) -> String {
        self.icon_url_template.replacen("{}", name, 1)
    }
}

fn validate_url_template(template: &str) -> Result<(), ValidationError> {
    if !template.contains("{}") {
        let mut err = ValidationError::new("missing_placeholder");
        err.message = Some("Icon URL template must contain '{}'".into());
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.state_file_for("AL12"), "data-AL12.json");
        assert_eq!(
            config.icon_url("lightbulb"),
            "https://raw.githubusercontent.com/Templarian/MaterialDesign-SVG/refs/heads/master/svg/lightbulb.svg"
        );
    }

    #[test]
    fn test_serial_substitution() {
        let config = BridgeConfig {
            state_file: "/var/lib/deckbridge/{serial}.json".into(),
            ..Default::default()
        };
        assert_eq!(
            config.state_file_for("AL12H1A01234"),
            "/var/lib/deckbridge/AL12H1A01234.json"
        );
    }

    #[test]
    fn test_two_decks_never_share_a_state_file() {
        for state_file in ["data-{serial}.json", "/var/lib/deckbridge/data.json", "state"] {
            let config = BridgeConfig {
                state_file: state_file.into(),
                ..Default::default()
            };
            let first = config.state_file_for("AL12H1A01234");
            let second = config.state_file_for("CL34K2B05678");

            assert_ne!(first, second, "{state_file}");
            assert!(first.contains("AL12H1A01234"));
        }
    }

    #[test]
    fn test_path_without_placeholder_gets_serial_suffix() {
        let config = BridgeConfig {
            state_file: "/var/lib/deckbridge/data.json".into(),
            ..Default::default()
        };
        assert_eq!(
            config.state_file_for("AL12"),
            "/var/lib/deckbridge/data-AL12.json"
        );

        let config = BridgeConfig {
            state_file: "state".into(),
            ..Default::default()
        };
        assert_eq!(config.state_file_for("AL12"), "state-AL12");
    }

    #[test]
    fn test_invalid_values() {
        let config = BridgeConfig {
            default_brightness: 101,
            event_qos: 3,
            oversample: 0,
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("default_brightness"));
        assert!(fields.contains_key("event_qos"));
        assert!(fields.contains_key("oversample"));
    }
}
