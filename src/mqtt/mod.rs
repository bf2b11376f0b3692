//! # MQTT Bridge
//!
//! Connects the device client to a broker. Status goes out retained under
//! `<topic>/stats/<name>`, commands come in under `<topic>/cmnd/<name>`.
//!
//! ```text
//! mqtt/
//! ├── config.rs           - broker settings
//! ├── message_manager.rs  - topic layout, stat rendering, command parsing
//! └── mqtt_handler.rs     - rumqttc event loop and relay
//! ```
//!
//! A stat is only published when its payload differs from the last one
//! sent. Reconnecting to the broker republishes everything.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;

pub use config::MqttConfig;
pub use mqtt_handler::{BridgeError, MqttHandler};
