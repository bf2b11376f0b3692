//! # Device Client
//!
//! Owns the single connection to the mower controller.
//!
//! ```text
//! device/
//! ├── client.rs  - DeviceHandle, DeviceClient and the serializing actor
//! ├── error.rs   - DeviceError
//! └── link.rs    - DeviceLink statum state machine
//! ```

pub mod client;
pub mod error;
pub mod link;

pub use client::{
    Ack, ClientSettings, DeviceClient, DeviceHandle, LinkStatus, OfflinePolicy, RetryPolicy,
};
pub use error::DeviceError;
