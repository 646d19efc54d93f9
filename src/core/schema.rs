//! Key slot model and validation of inbound key configuration payloads.
//!
//! A slot is a JSON object. `{}` means "no key configured"; anything else must
//! carry a `type` and an `icon` string and may carry a `color` string. Unknown
//! fields are kept as-is so they survive a save.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use validator::{Validate, ValidationError};

/// Prefix selecting a remote Material Design icon instead of inline SVG.
pub const MDI_PREFIX: &str = "mdi:";

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("schema violation: expected {expected}, found {found}")]
    WrongShape {
        expected: &'static str,
        found: &'static str,
    },

    #[error("schema violation: {0}")]
    Violation(String),

    #[error("key slot {index}: {source}")]
    Slot {
        index: usize,
        #[source]
        source: Box<SchemaError>,
    },
}

/// Validated view of a configured key slot.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Validate)]
pub struct KeySpec {
    #[serde(rename = "type")]
    #[validate(length(min = 1, message = "'type' must not be empty"))]
    pub kind: String,

    /// Inline SVG markup or `mdi:<asset-name>`.
    #[validate(custom(function = "validate_icon"))]
    pub icon: String,

    pub color: Option<String>,
}

impl KeySpec {
    /// Asset name for `mdi:` icons, `None` for inline markup.
    pub fn mdi_name(&self) -> Option<&str> {
        self.icon.strip_prefix(MDI_PREFIX)
    }
}

fn validate_icon(icon: &str) -> Result<(), ValidationError> {
    if icon.trim().is_empty() {
        let mut err = ValidationError::new("empty_icon");
        err.message = Some("'icon' must not be empty".into());
        return Err(err);
    }
    if icon.strip_prefix(MDI_PREFIX).is_some_and(|name| name.trim().is_empty()) {
        let mut err = ValidationError::new("empty_asset_name");
        err.message = Some("'mdi:' icon needs an asset name".into());
        return Err(err);
    }
    Ok(())
}

/// One entry of the `keys` array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeySlot(Map<String, Value>);

impl KeySlot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_configured(&self) -> bool {
        !self.0.is_empty()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Validated spec, `None` for an empty slot.
    pub fn spec(&self) -> Result<Option<KeySpec>, SchemaError> {
        if !self.is_configured() {
            return Ok(None);
        }

        let spec: KeySpec = serde_json::from_value(Value::Object(self.0.clone()))
            .map_err(|e| SchemaError::Violation(e.to_string()))?;
        spec.validate()
            .map_err(|e| SchemaError::Violation(e.to_string()))?;
        Ok(Some(spec))
    }

    fn from_value(value: Value) -> Result<Self, SchemaError> {
        match value {
            Value::Object(map) => {
                let slot = KeySlot(map);
                slot.spec()?;
                Ok(slot)
            }
            other => Err(SchemaError::WrongShape {
                expected: "object",
                found: type_name(&other),
            }),
        }
    }
}

/// Parses a `/config/<i>` payload: one key slot.
pub fn parse_slot(payload: &[u8]) -> Result<KeySlot, SchemaError> {
    KeySlot::from_value(serde_json::from_slice::<Value>(payload)?)
}

/// Parses a `/config` payload: an array of key slots.
pub fn parse_slots(payload: &[u8]) -> Result<Vec<KeySlot>, SchemaError> {
    match serde_json::from_slice::<Value>(payload)? {
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                KeySlot::from_value(item).map_err(|e| SchemaError::Slot {
                    index,
                    source: Box::new(e),
                })
            })
            .collect(),
        other => Err(SchemaError::WrongShape {
            expected: "array",
            found: type_name(&other),
        }),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_slot_is_unconfigured() {
        let slot = parse_slot(b"{}").unwrap();
        assert!(!slot.is_configured());
        assert!(slot.spec().unwrap().is_none());
    }

    #[test]
    fn test_mdi_slot() {
        let slot = parse_slot(br#"{"type":"button","icon":"mdi:lightbulb","color":"red"}"#).unwrap();
        let spec = slot.spec().unwrap().unwrap();
        assert_eq!(spec.kind, "button");
        assert_eq!(spec.mdi_name(), Some("lightbulb"));
        assert_eq!(spec.color.as_deref(), Some("red"));
    }

    #[test]
    fn test_extra_fields_preserved() {
        let slot = parse_slot(br#"{"type":"button","icon":"<svg/>","label":"Lamp"}"#).unwrap();
        assert_eq!(slot.fields()["label"], "Lamp");
        assert_eq!(
            serde_json::to_string(&slot).unwrap(),
            r#"{"type":"button","icon":"<svg/>","label":"Lamp"}"#
        );
    }

    #[test]
    fn test_missing_icon_is_violation() {
        let err = parse_slot(br#"{"type":"button"}"#).unwrap_err();
        assert!(matches!(err, SchemaError::Violation(_)));
        assert!(err.to_string().contains("icon"));
    }

    #[test]
    fn test_wrong_types_are_violations() {
        assert!(matches!(
            parse_slot(br#"{"type":"button","icon":"mdi:x","color":7}"#),
            Err(SchemaError::Violation(_))
        ));
        assert!(matches!(
            parse_slot(br#"{"type":"","icon":"mdi:x"}"#),
            Err(SchemaError::Violation(_))
        ));
        assert!(matches!(
            parse_slot(br#"{"type":"button","icon":"mdi:"}"#),
            Err(SchemaError::Violation(_))
        ));
        assert!(matches!(
            parse_slot(b"[1,2]"),
            Err(SchemaError::WrongShape { expected: "object", found: "array" })
        ));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(parse_slot(b"{\"type\":"), Err(SchemaError::Malformed(_))));
        assert!(matches!(parse_slots(b"not json"), Err(SchemaError::Malformed(_))));
    }

    #[test]
    fn test_parse_slots_reports_index() {
        let err = parse_slots(br#"[{}, {"type":"button","icon":"mdi:a"}, {"icon":"mdi:b"}]"#)
            .unwrap_err();
        assert!(matches!(err, SchemaError::Slot { index: 2, .. }));

        let slots = parse_slots(br#"[{}, {"type":"button","icon":"mdi:a"}]"#).unwrap();
        assert_eq!(slots.len(), 2);
        assert!(!slots[0].is_configured());
        assert!(slots[1].is_configured());
    }

    #[test]
    fn test_parse_slots_requires_array() {
        assert!(matches!(
            parse_slots(br#"{"type":"button","icon":"mdi:a"}"#),
            Err(SchemaError::WrongShape { expected: "array", .. })
        ));
    }
}
