//! Error types for the device protocol layer

use super::ProtocolVersion;
use std::time::Duration;
use thiserror::Error;

/// Malformed or corrupt wire data. Recoverable: one message is discarded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    #[error("bad frame prefix")]
    BadPrefix,

    #[error("bad frame suffix")]
    BadSuffix,

    #[error("malformed frame length: declared {declared}, available {available}")]
    MalformedLength { declared: usize, available: usize },

    #[error("unknown command type 0x{0:02x}")]
    UnknownCommand(u32),

    #[error("integrity check failed")]
    ChecksumMismatch,

    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// Socket-level failures. Every variant invalidates the current session.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by device")]
    Closed,

    #[error("no response within {0:?}")]
    Timeout(Duration),
}

/// Failure of one handshake attempt against a single revision.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("device rejected the handshake: {0}")]
    Rejected(String),

    #[error("status probe returned no data points")]
    NoStatus,

    #[error("failed to generate handshake nonce")]
    Nonce,
}

/// Negotiation failed against every supported revision.
#[derive(Debug, Error)]
#[error("negotiation failed for revisions {attempted:?}: {last}")]
pub struct NegotiationError {
    pub attempted: Vec<ProtocolVersion>,
    #[source]
    pub last: HandshakeError,
}
