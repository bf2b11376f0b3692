//! Session Negotiator
//!
//! Opens a fresh connection per attempt and walks [`ProtocolVersion::PREFERENCE`].
//! A revision counts as working once its status probe answers with data
//! points; those seed the first snapshot.

use ring::rand::{SecureRandom, SystemRandom};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::cipher::{self, EcbCipher, HMAC_LEN};
use super::datapoints::DataPointMap;
use super::error::{HandshakeError, NegotiationError};
use super::frame::{decode_frame, encode_frame, Frame, RetcodeMode};
use super::message;
use super::transport::{Connector, DeviceTransport};
use super::{CommandType, DeviceIdentity, ProtocolSession, ProtocolVersion, KEY_LEN};

/// Result of a successful negotiation: the open connection, its session and
/// the data points returned by the status probe.
pub struct NegotiatedSession {
    pub transport: DeviceTransport,
    pub session: ProtocolSession,
    pub status: DataPointMap,
}

pub struct SessionNegotiator {
    connector: Arc<dyn Connector>,
    response_timeout: Duration,
}

impl SessionNegotiator {
    pub fn new(connector: Arc<dyn Connector>, response_timeout: Duration) -> Self {
        Self {
            connector,
            response_timeout,
        }
    }

    pub async fn negotiate(
        &self,
        identity: &DeviceIdentity,
    ) -> Result<NegotiatedSession, NegotiationError> {
        let mut attempted = Vec::with_capacity(ProtocolVersion::PREFERENCE.len());
        let mut last = HandshakeError::NoStatus;

        for version in ProtocolVersion::PREFERENCE {
            attempted.push(version);
            debug!("Trying protocol revision {version}");

            match self.attempt(identity, version).await {
                Ok(negotiated) => {
                    info!("Negotiated protocol revision {version}");
                    return Ok(negotiated);
                }
                Err(e) => {
                    warn!("Protocol revision {version} failed: {e}");
                    last = e;
                }
            }
        }

        Err(NegotiationError { attempted, last })
    }

    async fn attempt(
        &self,
        identity: &DeviceIdentity,
        version: ProtocolVersion,
    ) -> Result<NegotiatedSession, HandshakeError> {
        let stream = self.connector.connect(identity).await?;
        let mut transport = DeviceTransport::new(stream);
        let mut session = ProtocolSession::new(version, *identity.local_key());

        if version == ProtocolVersion::V34 {
            self.exchange_keys(&mut transport, &mut session).await?;
        }

        let status = self.probe(&mut transport, &mut session, identity).await?;
        Ok(NegotiatedSession {
            transport,
            session,
            status,
        })
    }

    async fn exchange_keys(
        &self,
        transport: &mut DeviceTransport,
        session: &mut ProtocolSession,
    ) -> Result<(), HandshakeError> {
        let local_key = *session.key();
        let local_nonce = generate_nonce()?;

        let start = Frame::request(
            session.next_sequence(),
            CommandType::SessKeyNegStart,
            local_nonce.to_vec(),
        );
        transport.send(encode_frame(session, &start)).await?;

        let deadline = Instant::now() + self.response_timeout;
        let reply = self.receive(transport, session, deadline).await?;
        if reply.command != CommandType::SessKeyNegResp {
            return Err(HandshakeError::Rejected(format!(
                "expected key negotiation response, got {:?}",
                reply.command
            )));
        }
        if reply.payload.len() < KEY_LEN + HMAC_LEN {
            return Err(HandshakeError::Rejected(format!(
                "key negotiation response too short: {} bytes",
                reply.payload.len()
            )));
        }

        let mut remote_nonce = [0u8; KEY_LEN];
        remote_nonce.copy_from_slice(&reply.payload[..KEY_LEN]);
        let signature = &reply.payload[KEY_LEN..KEY_LEN + HMAC_LEN];
        if !cipher::hmac_sha256_verify(&local_key, &local_nonce, signature) {
            return Err(HandshakeError::Rejected(
                "device signed a different nonce".to_string(),
            ));
        }

        let finish = Frame::request(
            session.next_sequence(),
            CommandType::SessKeyNegFinish,
            cipher::hmac_sha256(&local_key, &remote_nonce).to_vec(),
        );
        transport.send(encode_frame(session, &finish)).await?;

        session.rekey(derive_session_key(&local_key, &local_nonce, &remote_nonce));
        debug!("Session key established");
        Ok(())
    }

    async fn probe(
        &self,
        transport: &mut DeviceTransport,
        session: &mut ProtocolSession,
        identity: &DeviceIdentity,
    ) -> Result<DataPointMap, HandshakeError> {
        let query = Frame::request(
            session.next_sequence(),
            message::query_command(session.version()),
            message::query_payload(identity),
        );
        transport.send(encode_frame(session, &query)).await?;

        let deadline = Instant::now() + self.response_timeout;
        loop {
            let reply = self.receive(transport, session, deadline).await?;
            if let Some(dps) = message::data_points(&reply)? {
                return Ok(dps);
            }
            debug!("Skipping {:?} frame without data points", reply.command);
        }
    }

    async fn receive(
        &self,
        transport: &mut DeviceTransport,
        session: &ProtocolSession,
        deadline: Instant,
    ) -> Result<Frame, HandshakeError> {
        let raw = transport
            .next_before(deadline, self.response_timeout)
            .await??;
        Ok(decode_frame(session, &raw, RetcodeMode::Auto)?)
    }
}

/// Sixteen ASCII hex characters.
fn generate_nonce() -> Result<[u8; KEY_LEN], HandshakeError> {
    let mut random = [0u8; KEY_LEN / 2];
    SystemRandom::new()
        .fill(&mut random)
        .map_err(|_| HandshakeError::Nonce)?;
    let mut nonce = [0u8; KEY_LEN];
    nonce.copy_from_slice(hex::encode(random).as_bytes());
    Ok(nonce)
}

pub fn derive_session_key(
    local_key: &[u8; KEY_LEN],
    local_nonce: &[u8; KEY_LEN],
    remote_nonce: &[u8; KEY_LEN],
) -> [u8; KEY_LEN] {
    let mut mixed = [0u8; KEY_LEN];
    for (out, (a, b)) in mixed.iter_mut().zip(local_nonce.iter().zip(remote_nonce)) {
        *out = a ^ b;
    }
    EcbCipher::new(local_key).encrypt_unpadded(&mixed)
}
