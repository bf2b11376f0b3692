//! # Device Protocol
//!
//! Local-network session layer for the mower controller. Everything that touches
//! raw bytes on the device socket lives here:
//!
//! ```text
//! protocol/
//! ├── cipher.rs      - AES-128-ECB, CRC-32 and HMAC-SHA256 primitives
//! ├── datapoints.rs  - DataPointMap, the wire-level key→value vocabulary
//! ├── error.rs       - FrameError, TransportError, NegotiationError
//! ├── frame.rs       - Wire Codec: 55AA frame layout per protocol revision
//! ├── message.rs     - JSON request bodies and data-point extraction
//! ├── negotiator.rs  - Session Negotiator with 3.4 → 3.3 fallback
//! └── transport.rs   - Connector seam and cancel-safe stream framing
//! ```
//!
//! Two revisions coexist. They are modelled as a [`ProtocolVersion`] tag that
//! selects the codec and handshake strategy; there is no shared base state
//! between them.

pub mod cipher;
pub mod datapoints;
pub mod error;
pub mod frame;
pub mod message;
pub mod negotiator;
pub mod transport;

#[cfg(test)]
pub mod simulator;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

pub use datapoints::{DataPointMap, DpValue};
pub use error::{FrameError, NegotiationError, TransportError};

/// Fixed TCP port the controller listens on.
pub const DEVICE_PORT: u16 = 6668;

/// Length of the AES-128 key and of the handshake nonces.
pub const KEY_LEN: usize = 16;

/// Wire-protocol revision spoken by the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    #[serde(rename = "3.4")]
    V34,
    #[serde(rename = "3.3")]
    V33,
}

impl ProtocolVersion {
    /// Negotiation order, newest first.
    pub const PREFERENCE: [ProtocolVersion; 2] = [ProtocolVersion::V34, ProtocolVersion::V33];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVersion::V34 => "3.4",
            ProtocolVersion::V33 => "3.3",
        }
    }

    /// `"3.x"` followed by twelve zero bytes.
    pub fn version_header(&self) -> [u8; 15] {
        let mut header = [0u8; 15];
        header[..3].copy_from_slice(self.as_str().as_bytes());
        header
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command numbers carried in the frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandType {
    SessKeyNegStart,
    SessKeyNegResp,
    SessKeyNegFinish,
    Control,
    Status,
    HeartBeat,
    DpQuery,
    ControlNew,
    DpQueryNew,
    UpdateDps,
}

impl CommandType {
    pub fn code(self) -> u32 {
        match self {
            CommandType::SessKeyNegStart => 0x03,
            CommandType::SessKeyNegResp => 0x04,
            CommandType::SessKeyNegFinish => 0x05,
            CommandType::Control => 0x07,
            CommandType::Status => 0x08,
            CommandType::HeartBeat => 0x09,
            CommandType::DpQuery => 0x0a,
            CommandType::ControlNew => 0x0d,
            CommandType::DpQueryNew => 0x10,
            CommandType::UpdateDps => 0x12,
        }
    }

    /// Whether frames of this command carry the 15-byte version header.
    pub fn carries_version_header(self) -> bool {
        !matches!(
            self,
            CommandType::DpQuery
                | CommandType::DpQueryNew
                | CommandType::UpdateDps
                | CommandType::HeartBeat
                | CommandType::SessKeyNegStart
                | CommandType::SessKeyNegResp
                | CommandType::SessKeyNegFinish
        )
    }
}

impl TryFrom<u32> for CommandType {
    type Error = FrameError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Ok(match code {
            0x03 => CommandType::SessKeyNegStart,
            0x04 => CommandType::SessKeyNegResp,
            0x05 => CommandType::SessKeyNegFinish,
            0x07 => CommandType::Control,
            0x08 => CommandType::Status,
            0x09 => CommandType::HeartBeat,
            0x0a => CommandType::DpQuery,
            0x0d => CommandType::ControlNew,
            0x10 => CommandType::DpQueryNew,
            0x12 => CommandType::UpdateDps,
            other => return Err(FrameError::UnknownCommand(other)),
        })
    }
}

/// Who the device is and how to reach it. Immutable for the process lifetime.
#[derive(Clone)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub address: IpAddr,
    pub port: u16,
    local_key: [u8; KEY_LEN],
}

impl DeviceIdentity {
    pub fn new(device_id: String, address: IpAddr, port: u16, local_key: [u8; KEY_LEN]) -> Self {
        Self {
            device_id,
            address,
            port,
            local_key,
        }
    }

    pub fn local_key(&self) -> &[u8; KEY_LEN] {
        &self.local_key
    }
}

// Keeps the shared secret out of logs.
impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("address", &self.address)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

/// One negotiated, keyed, sequence-numbered exchange context.
///
/// A session is created by the [`negotiator`] and dropped by the Device Client
/// on any transport failure; it is never repaired in place.
#[derive(Clone)]
pub struct ProtocolSession {
    version: ProtocolVersion,
    key: [u8; KEY_LEN],
    sequence: u32,
}

impl ProtocolSession {
    pub fn new(version: ProtocolVersion, key: [u8; KEY_LEN]) -> Self {
        Self {
            version,
            key,
            sequence: 0,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    /// Last sequence number handed out, 0 before the first request.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Swaps in the negotiated session key. The sequence carries on.
    pub fn rekey(&mut self, key: [u8; KEY_LEN]) {
        self.key = key;
    }

    /// Reserves the next request sequence number. Numbers are never reused
    /// within one session.
    pub fn next_sequence(&mut self) -> u32 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }
}

impl fmt::Debug for ProtocolSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolSession")
            .field("version", &self.version)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_header_is_padded_with_zeros() {
        let header = ProtocolVersion::V33.version_header();
        assert_eq!(&header[..3], b"3.3");
        assert!(header[3..].iter().all(|b| *b == 0));
    }

    #[test]
    fn unknown_command_number_is_a_frame_error() {
        assert!(matches!(
            CommandType::try_from(0x42),
            Err(FrameError::UnknownCommand(0x42))
        ));
        assert_eq!(CommandType::try_from(0x10).ok(), Some(CommandType::DpQueryNew));
    }

    #[test]
    fn sequence_numbers_increase_per_request() {
        let mut session = ProtocolSession::new(ProtocolVersion::V33, [0u8; KEY_LEN]);
        assert_eq!(session.next_sequence(), 1);
        assert_eq!(session.next_sequence(), 2);
        assert_eq!(session.sequence(), 2);
    }

    #[test]
    fn identity_debug_hides_local_key() {
        let identity = DeviceIdentity::new(
            "bf0123".to_string(),
            "192.168.1.20".parse().unwrap(),
            DEVICE_PORT,
            *b"secretsecret1234",
        );
        let rendered = format!("{identity:?}");
        assert!(!rendered.contains("secretsecret1234"));
        assert!(rendered.contains("bf0123"));
    }
}
