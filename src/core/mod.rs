//! Device session runtime.
//!
//! Leaf modules first: `schema` and `store` hold the per-device state document,
//! `icon` turns key specs into images, `device` and `transport` are the seams to
//! hardware and MQTT. `bridge` coordinates them and `session` wires one opened
//! device to its own connection.

pub mod bridge;
pub mod device;
pub mod icon;
pub mod schema;
pub mod session;
pub mod store;
pub mod topics;
pub mod transport;
