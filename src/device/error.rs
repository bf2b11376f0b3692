use std::time::Duration;
use thiserror::Error;

use crate::mower::{IntentKind, InvalidIntentError};
use crate::protocol::{FrameError, NegotiationError, TransportError};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Transport(TransportError),

    /// The connection broke before the device answered the request.
    #[error("request not delivered: {0}")]
    Undelivered(TransportError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    InvalidIntent(#[from] InvalidIntentError),

    #[error("no response from device within {0:?}")]
    TransportTimeout(Duration),

    #[error("session discarded after {0} consecutive frame errors")]
    SessionCorrupted(usize),

    #[error("device unavailable")]
    Unavailable,

    #[error("superseded by a newer {0} command")]
    Superseded(IntentKind),

    #[error("device rejected command with return code {0}")]
    CommandRejected(u32),

    #[error("device client is shut down")]
    Shutdown,
}

impl From<TransportError> for DeviceError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(after) => DeviceError::TransportTimeout(after),
            other => DeviceError::Transport(other),
        }
    }
}

impl DeviceError {
    /// Whether the current session must be dropped and renegotiated.
    pub fn invalidates_session(&self) -> bool {
        matches!(
            self,
            DeviceError::Transport(_)
                | DeviceError::Undelivered(_)
                | DeviceError::TransportTimeout(_)
                | DeviceError::SessionCorrupted(_)
                | DeviceError::Negotiation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_map_to_transport_timeout() {
        let err = DeviceError::from(TransportError::Timeout(Duration::from_secs(5)));
        assert!(matches!(err, DeviceError::TransportTimeout(_)));
        assert!(err.invalidates_session());
    }

    #[test]
    fn undelivered_requests_drop_the_session() {
        let err = DeviceError::Undelivered(TransportError::Closed);
        assert!(err.invalidates_session());
        assert_eq!(
            err.to_string(),
            "request not delivered: connection closed by device"
        );
    }

    #[test]
    fn caller_errors_keep_the_session() {
        assert!(!DeviceError::CommandRejected(1).invalidates_session());
        assert!(!DeviceError::Frame(FrameError::ChecksumMismatch).invalidates_session());
        assert!(!DeviceError::from(InvalidIntentError::NotACommand).invalidates_session());
    }
}
