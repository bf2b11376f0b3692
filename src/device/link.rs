//! Device link with statum state machine
//!
//! ```text
//! Disconnected ──► Negotiating ──► Connected
//!                      ▲               │
//!                      │               ▼
//!                      └──────────  Faulted
//! ```
//!
//! A `Connected` link owns exactly one open connection and its session.
//! Faulting drops both; nothing is repaired in place.

use statum::{machine, state};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::DeviceError;
use crate::mower::StatusSnapshot;
use crate::protocol::frame::{decode_frame, encode_frame, Frame, RetcodeMode};
use crate::protocol::message;
use crate::protocol::negotiator::{NegotiatedSession, SessionNegotiator};
use crate::protocol::transport::DeviceTransport;
use crate::protocol::{
    CommandType, DataPointMap, DeviceIdentity, FrameError, NegotiationError, ProtocolSession,
    ProtocolVersion,
};

#[state]
#[derive(Debug, Clone)]
pub enum LinkPhase {
    Disconnected,
    Negotiating,
    Connected,
    Faulted,
}

#[derive(Clone, Debug)]
pub struct LinkSettings {
    pub request_timeout: Duration,
    pub frame_error_threshold: usize,
}

struct ActiveSession {
    transport: DeviceTransport,
    session: ProtocolSession,
}

#[machine]
pub struct DeviceLink<S: LinkPhase> {
    identity: DeviceIdentity,
    negotiator: Arc<SessionNegotiator>,
    settings: LinkSettings,
    active: Option<ActiveSession>,
    snapshot: StatusSnapshot,
    frame_errors: usize,
}

pub enum NegotiationOutcome {
    Connected(DeviceLink<Connected>),
    Failed(DeviceLink<Faulted>, NegotiationError),
}

impl<S: LinkPhase> DeviceLink<S> {
    /// Latest merged snapshot. Survives reconnects.
    pub fn snapshot(&self) -> &StatusSnapshot {
        &self.snapshot
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }
}

impl DeviceLink<Disconnected> {
    pub fn create(
        identity: DeviceIdentity,
        negotiator: Arc<SessionNegotiator>,
        settings: LinkSettings,
    ) -> Self {
        Self::new(
            identity,
            negotiator,
            settings,
            None,                      // active
            StatusSnapshot::default(), // snapshot
            0,                         // frame_errors
        )
    }

    pub fn connect(self) -> DeviceLink<Negotiating> {
        info!("Connecting to device {}", self.identity.device_id);
        self.transition()
    }
}

impl DeviceLink<Negotiating> {
    pub async fn negotiate(mut self) -> NegotiationOutcome {
        match self.negotiator.negotiate(&self.identity).await {
            Ok(NegotiatedSession {
                transport,
                session,
                status,
            }) => {
                info!(
                    "Connected to device {} using protocol {}",
                    self.identity.device_id,
                    session.version()
                );
                self.snapshot = StatusSnapshot::decode(&status, &self.snapshot);
                self.frame_errors = 0;
                self.active = Some(ActiveSession { transport, session });
                NegotiationOutcome::Connected(self.transition())
            }
            Err(e) => NegotiationOutcome::Failed(self.transition(), e),
        }
    }
}

impl DeviceLink<Connected> {
    pub fn version(&self) -> Option<ProtocolVersion> {
        self.active.as_ref().map(|a| a.session.version())
    }

    /// Fetches the full status and merges it into the snapshot.
    pub async fn poll(&mut self) -> Result<StatusSnapshot, DeviceError> {
        let version = self.version().ok_or(DeviceError::Unavailable)?;
        let command = message::query_command(version);
        let payload = message::query_payload(&self.identity);
        self.exchange(command, payload, |frame| frame.command == command)
            .await?;
        Ok(self.snapshot.clone())
    }

    /// Writes a data-point set. A control acknowledgement or the status push
    /// that follows it both count as delivery.
    pub async fn write(&mut self, dps: &DataPointMap) -> Result<(), DeviceError> {
        let version = self.version().ok_or(DeviceError::Unavailable)?;
        let (command, payload) = message::control_request(version, &self.identity, dps);
        let reply = self
            .exchange(command, payload, |frame| {
                frame.command == command || frame.command == CommandType::Status
            })
            .await?;

        match reply.retcode {
            Some(code) if code != 0 && reply.command == command => {
                Err(DeviceError::CommandRejected(code))
            }
            _ => Ok(()),
        }
    }

    pub async fn heartbeat(&mut self) -> Result<(), DeviceError> {
        let payload = message::heartbeat_payload(&self.identity);
        self.exchange(CommandType::HeartBeat, payload, |frame| {
            frame.command == CommandType::HeartBeat
        })
        .await?;
        debug!("Heartbeat acknowledged");
        Ok(())
    }

    /// Waits for the next unsolicited frame. Returns the updated snapshot when
    /// it carried data points. Cancel safe.
    pub async fn next_push(&mut self) -> Result<Option<StatusSnapshot>, DeviceError> {
        let updated = match self.read_frame(None).await? {
            Some((_, updated)) => updated,
            None => false,
        };
        Ok(updated.then(|| self.snapshot.clone()))
    }

    pub fn fault(mut self, cause: impl fmt::Display) -> DeviceLink<Faulted> {
        warn!("Discarding session with {}: {}", self.identity.device_id, cause);
        self.active = None;
        self.transition()
    }

    pub fn disconnect(mut self) -> DeviceLink<Disconnected> {
        info!("Disconnecting from device {}", self.identity.device_id);
        self.active = None;
        self.transition()
    }

    async fn exchange(
        &mut self,
        command: CommandType,
        payload: Vec<u8>,
        is_reply: impl Fn(&Frame) -> bool,
    ) -> Result<Frame, DeviceError> {
        let active = self.active.as_mut().ok_or(DeviceError::Unavailable)?;
        let seqno = active.session.next_sequence();
        let request = Frame::request(seqno, command, payload);
        debug!(seqno, "Sending {:?}", command);
        active
            .transport
            .send(encode_frame(&active.session, &request))
            .await
            .map_err(|e| match DeviceError::from(e) {
                DeviceError::Transport(e) => DeviceError::Undelivered(e),
                other => other,
            })?;

        let deadline = Instant::now() + self.settings.request_timeout;
        loop {
            // A connection lost before the reply means the request was not
            // answered. Timeouts stay ambiguous.
            let read = match self.read_frame(Some(deadline)).await {
                Err(DeviceError::Transport(e)) => Err(DeviceError::Undelivered(e)),
                other => other,
            };
            if let Some((frame, _)) = read? {
                if is_reply(&frame) {
                    return Ok(frame);
                }
                debug!(seqno = frame.seqno, "Unsolicited {:?} while waiting", frame.command);
            }
        }
    }

    /// Reads one frame. `Ok(None)` means a frame was discarded as corrupt.
    async fn read_frame(
        &mut self,
        deadline: Option<Instant>,
    ) -> Result<Option<(Frame, bool)>, DeviceError> {
        let timeout = self.settings.request_timeout;
        let active = self.active.as_mut().ok_or(DeviceError::Unavailable)?;
        let item = match deadline {
            Some(deadline) => active.transport.next_before(deadline, timeout).await?,
            None => active.transport.next().await?,
        };

        let decoded = item
            .and_then(|raw| decode_frame(&active.session, &raw, RetcodeMode::Auto))
            .and_then(|frame| message::data_points(&frame).map(|dps| (frame, dps)));

        match decoded {
            Ok((frame, dps)) => {
                self.frame_errors = 0;
                let updated = match dps {
                    Some(dps) => {
                        debug!("Received {} data points", dps.len());
                        self.snapshot = StatusSnapshot::decode(&dps, &self.snapshot);
                        true
                    }
                    None => false,
                };
                Ok(Some((frame, updated)))
            }
            Err(e) => {
                self.record_frame_error(e)?;
                Ok(None)
            }
        }
    }

    fn record_frame_error(&mut self, err: FrameError) -> Result<(), DeviceError> {
        self.frame_errors += 1;
        warn!(
            "Discarding corrupt frame ({}/{}): {}",
            self.frame_errors, self.settings.frame_error_threshold, err
        );
        if self.frame_errors >= self.settings.frame_error_threshold {
            return Err(DeviceError::SessionCorrupted(self.frame_errors));
        }
        Ok(())
    }
}

impl DeviceLink<Faulted> {
    pub fn retry(self) -> DeviceLink<Negotiating> {
        debug!("Retrying negotiation with {}", self.identity.device_id);
        self.transition()
    }

    pub fn disconnect(self) -> DeviceLink<Disconnected> {
        self.transition()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mower::MowerState;
    use crate::protocol::simulator::SimulatedDevice;

    fn link(device: &SimulatedDevice, threshold: usize) -> DeviceLink<Negotiating> {
        let negotiator = SessionNegotiator::new(Arc::new(device.clone()), Duration::from_secs(1));
        DeviceLink::create(
            device.identity(),
            Arc::new(negotiator),
            LinkSettings {
                request_timeout: Duration::from_millis(500),
                frame_error_threshold: threshold,
            },
        )
        .connect()
    }

    async fn connected(device: &SimulatedDevice, threshold: usize) -> DeviceLink<Connected> {
        match link(device, threshold).negotiate().await {
            NegotiationOutcome::Connected(link) => link,
            NegotiationOutcome::Failed(_, e) => panic!("negotiation failed: {e}"),
        }
    }

    #[tokio::test]
    async fn negotiation_seeds_snapshot() {
        let device = SimulatedDevice::new(&[ProtocolVersion::V33]);
        device.set_dp(101, 1i64);
        let link = connected(&device, 3).await;
        assert_eq!(link.snapshot().state, Some(MowerState::Charging));
        assert_eq!(link.version(), Some(ProtocolVersion::V33));
    }

    #[tokio::test]
    async fn rejected_control_is_reported() {
        let device = SimulatedDevice::new(&[ProtocolVersion::V34]);
        device.reject_controls(1);
        let mut link = connected(&device, 3).await;

        let mut dps = DataPointMap::new();
        dps.insert(115, "PauseWork");
        assert!(matches!(
            link.write(&dps).await,
            Err(DeviceError::CommandRejected(1))
        ));
    }

    #[tokio::test]
    async fn corrupt_frames_below_threshold_are_discarded() {
        let device = SimulatedDevice::new(&[ProtocolVersion::V34]);
        let mut link = connected(&device, 3).await;

        device.corrupt_next_reply(2);
        // The corrupt burst replaces the reply, so this poll times out.
        assert!(matches!(
            link.poll().await,
            Err(DeviceError::TransportTimeout(_))
        ));
        assert_eq!(link.frame_errors, 2);
    }

    #[tokio::test]
    async fn corrupt_burst_at_threshold_corrupts_session() {
        let device = SimulatedDevice::new(&[ProtocolVersion::V33]);
        let mut link = connected(&device, 3).await;

        device.corrupt_next_reply(3);
        let err = link.poll().await.unwrap_err();
        assert!(matches!(err, DeviceError::SessionCorrupted(3)));
        assert!(err.invalidates_session());
    }

    #[tokio::test]
    async fn heartbeat_is_acknowledged() {
        let device = SimulatedDevice::new(&[ProtocolVersion::V34]);
        let mut link = connected(&device, 3).await;
        link.heartbeat().await.unwrap();
        assert_eq!(device.heartbeats(), 1);
    }
}
