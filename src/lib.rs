//! deckbridge: Elgato Stream Deck to MQTT bridge
//!
//! Each connected Stream Deck becomes a device session with its own MQTT
//! connection and state file. Key presses are published as empty messages on
//! per-key topics; inbound messages set brightness, put the device to sleep,
//! and replace key icons, which are rendered from inline SVG or fetched from
//! the Material Design icon set.
//!
//! ## Modules
//!
//! * `config` — Configuration structures, loading, validation, and defaults.
//!   TOML file plus `MQTT_*` environment overrides, validated with `validator`.
//!
//! * `core` — Session runtime:
//!   - State document store and key slot schema
//!   - Icon resolution and rasterization
//!   - Device and transport seams
//!   - Bridge coordinator and session wiring
//!
//! * `logger` — Centralized logging initialization using `tracing`.
//!   Supports console output in multiple formats (compact, pretty, JSON)
//!   and optional systemd journald integration.

pub mod config;
pub mod core;
pub mod logger;
