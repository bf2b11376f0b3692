//! In-memory mower controller for tests.
//!
//! Speaks both revisions over `tokio::io::duplex` and plugs in through the
//! [`Connector`] seam. The revision is chosen by the client's first frame:
//! a key negotiation start means 3.4, anything else 3.3.

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use super::cipher;
use super::datapoints::{DataPointMap, DpValue};
use super::error::TransportError;
use super::frame::{decode_frame, encode_frame, Frame, FrameSplitter, RetcodeMode};
use super::message;
use super::negotiator::derive_session_key;
use super::transport::{Connector, DeviceStream};
use super::{CommandType, DeviceIdentity, ProtocolSession, ProtocolVersion, DEVICE_PORT, KEY_LEN};

pub const LOCAL_KEY: [u8; KEY_LEN] = *b"0123456789abcdef";
const REMOTE_NONCE: [u8; KEY_LEN] = *b"fedcba9876543210";

enum SimEvent {
    Push(DataPointMap),
    Drop,
}

struct SimState {
    versions: Vec<ProtocolVersion>,
    reachable: bool,
    muted: bool,
    dps: DataPointMap,
    corrupt_burst: usize,
    reject_controls: Option<u32>,
    attempts: Vec<ProtocolVersion>,
    controls: Vec<DataPointMap>,
    queries: usize,
    heartbeats: usize,
    events: Option<mpsc::UnboundedSender<SimEvent>>,
}

#[derive(Clone)]
pub struct SimulatedDevice {
    identity: DeviceIdentity,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedDevice {
    pub fn new(versions: &[ProtocolVersion]) -> Self {
        let identity = DeviceIdentity::new(
            "bf0simulated".to_string(),
            "127.0.0.1".parse().unwrap(),
            DEVICE_PORT,
            LOCAL_KEY,
        );
        Self {
            identity,
            state: Arc::new(Mutex::new(SimState {
                versions: versions.to_vec(),
                reachable: true,
                muted: false,
                dps: DataPointMap::new(),
                corrupt_burst: 0,
                reject_controls: None,
                attempts: Vec::new(),
                controls: Vec::new(),
                queries: 0,
                heartbeats: 0,
                events: None,
            })),
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity.clone()
    }

    pub fn set_dp(&self, id: u32, value: impl Into<DpValue>) {
        self.state.lock().unwrap().dps.insert(id, value);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unwrap().reachable = reachable;
    }

    /// Stop answering requests while keeping the connection open.
    pub fn set_muted(&self, muted: bool) {
        self.state.lock().unwrap().muted = muted;
    }

    /// Replace the next reply with `count` frames that fail their checksum.
    pub fn corrupt_next_reply(&self, count: usize) {
        self.state.lock().unwrap().corrupt_burst = count;
    }

    pub fn reject_controls(&self, retcode: u32) {
        self.state.lock().unwrap().reject_controls = Some(retcode);
    }

    pub fn connection_attempts(&self) -> Vec<ProtocolVersion> {
        self.state.lock().unwrap().attempts.clone()
    }

    pub fn controls(&self) -> Vec<DataPointMap> {
        self.state.lock().unwrap().controls.clone()
    }

    pub fn queries(&self) -> usize {
        self.state.lock().unwrap().queries
    }

    pub fn heartbeats(&self) -> usize {
        self.state.lock().unwrap().heartbeats
    }

    /// Sends an unsolicited status push on the live connection.
    pub fn push(&self, dps: DataPointMap) -> bool {
        let mut state = self.state.lock().unwrap();
        state.dps.merge(&dps);
        match &state.events {
            Some(tx) => tx.send(SimEvent::Push(dps)).is_ok(),
            None => false,
        }
    }

    pub fn drop_connection(&self) {
        if let Some(tx) = self.state.lock().unwrap().events.take() {
            let _ = tx.send(SimEvent::Drop);
        }
    }
}

impl Connector for SimulatedDevice {
    fn connect<'a>(
        &'a self,
        _identity: &'a DeviceIdentity,
    ) -> BoxFuture<'a, Result<DeviceStream, TransportError>> {
        Box::pin(async move {
            let events = {
                let mut state = self.state.lock().unwrap();
                if !state.reachable {
                    return Err(TransportError::Io(std::io::Error::from(
                        std::io::ErrorKind::ConnectionRefused,
                    )));
                }
                let (tx, rx) = mpsc::unbounded_channel();
                state.events = Some(tx);
                rx
            };

            let (client, device) = tokio::io::duplex(64 * 1024);
            tokio::spawn(serve(
                self.state.clone(),
                self.identity.clone(),
                device,
                events,
            ));
            Ok(Box::new(client) as DeviceStream)
        })
    }
}

type DeviceSide = Framed<DuplexStream, FrameSplitter>;

async fn next_frame(framed: &mut DeviceSide) -> Option<Vec<u8>> {
    loop {
        match framed.next().await? {
            Ok(Ok(raw)) => return Some(raw.to_vec()),
            Ok(Err(_)) => continue,
            Err(_) => return None,
        }
    }
}

async fn serve(
    state: Arc<Mutex<SimState>>,
    identity: DeviceIdentity,
    stream: DuplexStream,
    mut events: mpsc::UnboundedReceiver<SimEvent>,
) {
    let mut framed = Framed::new(stream, FrameSplitter);
    let Some(first) = next_frame(&mut framed).await else {
        return;
    };

    let command = u32::from_be_bytes([first[8], first[9], first[10], first[11]]);
    let version = if command == CommandType::SessKeyNegStart.code() {
        ProtocolVersion::V34
    } else {
        ProtocolVersion::V33
    };
    {
        let mut guard = state.lock().unwrap();
        guard.attempts.push(version);
        if !guard.versions.contains(&version) {
            return;
        }
    }

    let local_key = *identity.local_key();
    let mut session = ProtocolSession::new(version, local_key);
    let mut pending = Some(first);

    if version == ProtocolVersion::V34 {
        let Some(key) = handshake(&mut framed, &session, pending.take()).await else {
            return;
        };
        session.rekey(key);
    }

    let mut push_seqno = 0u32;
    loop {
        let raw = match pending.take() {
            Some(raw) => raw,
            None => tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(SimEvent::Push(dps)) => {
                        push_seqno += 1;
                        let push = status_push(&session, &identity, push_seqno, &dps);
                        if send(&state, &mut framed, &session, push).await.is_err() {
                            return;
                        }
                        continue;
                    }
                    Some(SimEvent::Drop) | None => return,
                },
                raw = next_frame(&mut framed) => match raw {
                    Some(raw) => raw,
                    None => return,
                },
            },
        };

        let Ok(request) = decode_frame(&session, &raw, RetcodeMode::Absent) else {
            return;
        };
        if state.lock().unwrap().muted {
            continue;
        }

        for reply in respond(&state, &session, &identity, request, &mut push_seqno) {
            if send(&state, &mut framed, &session, reply).await.is_err() {
                return;
            }
        }
    }
}

async fn handshake(
    framed: &mut DeviceSide,
    session: &ProtocolSession,
    first: Option<Vec<u8>>,
) -> Option<[u8; KEY_LEN]> {
    let local_key = *session.key();
    let start = decode_frame(session, &first?, RetcodeMode::Absent).ok()?;
    let client_nonce: [u8; KEY_LEN] = start.payload.as_slice().try_into().ok()?;

    let mut payload = REMOTE_NONCE.to_vec();
    payload.extend_from_slice(&cipher::hmac_sha256(&local_key, &client_nonce));
    let reply = Frame {
        seqno: start.seqno,
        command: CommandType::SessKeyNegResp,
        retcode: Some(0),
        payload,
    };
    framed.send(encode_frame(session, &reply)).await.ok()?;

    let finish = decode_frame(session, &next_frame(framed).await?, RetcodeMode::Absent).ok()?;
    if finish.command != CommandType::SessKeyNegFinish
        || !cipher::hmac_sha256_verify(&local_key, &REMOTE_NONCE, &finish.payload)
    {
        return None;
    }
    Some(derive_session_key(&local_key, &client_nonce, &REMOTE_NONCE))
}

fn respond(
    state: &Arc<Mutex<SimState>>,
    session: &ProtocolSession,
    identity: &DeviceIdentity,
    request: Frame,
    push_seqno: &mut u32,
) -> Vec<Frame> {
    let mut guard = state.lock().unwrap();
    let ack = |retcode: u32, payload: Vec<u8>| Frame {
        seqno: request.seqno,
        command: request.command,
        retcode: Some(retcode),
        payload,
    };

    match request.command {
        CommandType::DpQuery | CommandType::DpQueryNew => {
            guard.queries += 1;
            let body = json!({ "devId": identity.device_id, "dps": guard.dps });
            vec![ack(0, body.to_string().into_bytes())]
        }
        CommandType::Control | CommandType::ControlNew => {
            let dps = message::data_points(&request)
                .ok()
                .flatten()
                .unwrap_or_default();
            guard.controls.push(dps.clone());
            if let Some(retcode) = guard.reject_controls {
                return vec![ack(retcode, Vec::new())];
            }
            guard.dps.merge(&dps);
            *push_seqno += 1;
            vec![
                ack(0, Vec::new()),
                status_push(session, identity, *push_seqno, &dps),
            ]
        }
        CommandType::HeartBeat => {
            guard.heartbeats += 1;
            vec![ack(0, Vec::new())]
        }
        _ => Vec::new(),
    }
}

fn status_push(
    session: &ProtocolSession,
    identity: &DeviceIdentity,
    seqno: u32,
    dps: &DataPointMap,
) -> Frame {
    let body = match session.version() {
        ProtocolVersion::V33 => json!({ "devId": identity.device_id, "dps": dps, "t": 1 }),
        ProtocolVersion::V34 => json!({ "protocol": 4, "t": 1, "data": { "dps": dps } }),
    };
    Frame {
        seqno,
        command: CommandType::Status,
        retcode: Some(0),
        payload: body.to_string().into_bytes(),
    }
}

async fn send(
    state: &Arc<Mutex<SimState>>,
    framed: &mut DeviceSide,
    session: &ProtocolSession,
    frame: Frame,
) -> std::io::Result<()> {
    let burst = std::mem::take(&mut state.lock().unwrap().corrupt_burst);
    let mut raw = encode_frame(session, &frame);
    if burst == 0 {
        return framed.send(raw).await;
    }

    // Flip one integrity byte so the frame still splits cleanly.
    let idx = raw.len() - 5;
    raw[idx] ^= 0xff;
    for _ in 0..burst {
        framed.send(raw.clone()).await?;
    }
    Ok(())
}
