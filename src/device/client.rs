//! Device Client
//!
//! One actor task owns the [`DeviceLink`] and serializes every device
//! operation. Callers talk to it through a cloneable [`DeviceClient`];
//! snapshots and link status are broadcast on `watch` channels.
//!
//! ```text
//! DeviceClient ──mpsc──► DeviceWorker ──► DeviceLink ──► device socket
//!      ▲                     │
//!      └──── watch ◄─────────┘  (snapshot, link status)
//! ```

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::DeviceError;
use super::link::{
    Connected, DeviceLink, Disconnected, Faulted, LinkSettings, Negotiating, NegotiationOutcome,
};
use crate::mower::{CommandIntent, IntentKind, StatusSnapshot};
use crate::protocol::negotiator::SessionNegotiator;
use crate::protocol::{DataPointMap, DeviceIdentity, ProtocolVersion};

const REQUEST_CHANNEL_CAPACITY: usize = 32;

/// Bounded exponential backoff between negotiation attempts. Retries never
/// stop while the process runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(attempt);
        let delay = self.initial_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// What happens to requests while the device is unreachable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflinePolicy {
    /// Hold requests until reconnected, keeping the newest per intent kind.
    #[default]
    Queue,
    /// Answer immediately with [`DeviceError::Unavailable`].
    FailFast,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub frame_error_threshold: usize,
    pub offline_policy: OfflinePolicy,
    /// Queued requests kept per intent kind while offline.
    pub queue_depth: usize,
    pub retry: RetryPolicy,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            request_timeout_ms: 5_000,
            heartbeat_interval_ms: 10_000,
            frame_error_threshold: 3,
            offline_policy: OfflinePolicy::Queue,
            queue_depth: 1,
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Connectivity as seen by subscribers. `online` is true only for
/// [`LinkStatus::Connected`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Negotiating,
    Connected(ProtocolVersion),
    Faulted { reason: String },
}

impl LinkStatus {
    pub fn is_online(&self) -> bool {
        matches!(self, LinkStatus::Connected(_))
    }
}

/// Successful delivery of a command intent.
#[derive(Clone, Debug, PartialEq)]
pub struct Ack {
    pub kind: IntentKind,
    pub snapshot: StatusSnapshot,
}

enum DeviceRequest {
    Poll {
        reply: oneshot::Sender<Result<StatusSnapshot, DeviceError>>,
    },
    Send {
        kind: IntentKind,
        dps: DataPointMap,
        reply: oneshot::Sender<Result<Ack, DeviceError>>,
    },
}

impl DeviceRequest {
    fn kind(&self) -> IntentKind {
        match self {
            DeviceRequest::Poll { .. } => IntentKind::Poll,
            DeviceRequest::Send { kind, .. } => *kind,
        }
    }

    /// Answers the caller, who may have given up already.
    fn complete(self, result: Result<StatusSnapshot, DeviceError>) {
        match self {
            DeviceRequest::Poll { reply } => {
                let _ = reply.send(result);
            }
            DeviceRequest::Send { kind, reply, .. } => {
                let _ = reply.send(result.map(|snapshot| Ack { kind, snapshot }));
            }
        }
    }

    fn reject(self, err: DeviceError) {
        self.complete(Err(err));
    }
}

/// Cloneable front end of the device actor.
#[derive(Clone)]
pub struct DeviceClient {
    requests: mpsc::Sender<DeviceRequest>,
    snapshot: watch::Receiver<StatusSnapshot>,
    link: watch::Receiver<LinkStatus>,
}

impl DeviceClient {
    pub async fn poll(&self) -> Result<StatusSnapshot, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(DeviceRequest::Poll { reply })
            .await
            .map_err(|_| DeviceError::Shutdown)?;
        rx.await.map_err(|_| DeviceError::Shutdown)?
    }

    /// Encodes `intent` and delivers it. Invalid intents fail here without
    /// any device I/O.
    pub async fn send(&self, intent: CommandIntent) -> Result<Ack, DeviceError> {
        if intent == CommandIntent::Poll {
            let snapshot = self.poll().await?;
            return Ok(Ack {
                kind: IntentKind::Poll,
                snapshot,
            });
        }

        let dps = intent.encode()?;
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(DeviceRequest::Send {
                kind: intent.kind(),
                dps,
                reply,
            })
            .await
            .map_err(|_| DeviceError::Shutdown)?;
        rx.await.map_err(|_| DeviceError::Shutdown)?
    }

    /// Every decoded snapshot, pushed or polled.
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.snapshot.clone()
    }

    pub fn link_status(&self) -> watch::Receiver<LinkStatus> {
        self.link.clone()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Waits for the outcome of the next negotiation.
    pub async fn wait_connected(&self) -> Result<ProtocolVersion, DeviceError> {
        let mut link = self.link.clone();
        loop {
            let outcome = match &*link.borrow_and_update() {
                LinkStatus::Connected(version) => Some(Ok(*version)),
                LinkStatus::Faulted { reason } => {
                    debug!("Link faulted: {reason}");
                    Some(Err(DeviceError::Unavailable))
                }
                LinkStatus::Disconnected | LinkStatus::Negotiating => None,
            };
            if let Some(outcome) = outcome {
                return outcome;
            }
            link.changed().await.map_err(|_| DeviceError::Shutdown)?;
        }
    }
}

/// Owns the device actor task.
pub struct DeviceHandle {
    client: DeviceClient,
    cancel: CancellationToken,
    task_handle: Option<JoinHandle<()>>,
}

impl DeviceHandle {
    pub fn spawn(
        identity: DeviceIdentity,
        negotiator: SessionNegotiator,
        settings: ClientSettings,
        cancel: CancellationToken,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(StatusSnapshot::default());
        let (link_tx, link_rx) = watch::channel(LinkStatus::Disconnected);

        let link = DeviceLink::create(
            identity,
            Arc::new(negotiator),
            LinkSettings {
                request_timeout: settings.request_timeout(),
                frame_error_threshold: settings.frame_error_threshold.max(1),
            },
        );

        let worker = DeviceWorker {
            requests: request_rx,
            snapshot_tx,
            link_tx,
            queue: PendingQueue::new(settings.queue_depth),
            settings,
            cancel: cancel.clone(),
        };

        let task_handle = tokio::spawn(async move {
            info!("Device client started");
            worker.run(link).await;
            info!("Device client stopped");
        });

        Self {
            client: DeviceClient {
                requests: request_tx,
                snapshot: snapshot_rx,
                link: link_rx,
            },
            cancel,
            task_handle: Some(task_handle),
        }
    }

    pub fn client(&self) -> DeviceClient {
        self.client.clone()
    }

    /// Cancels the actor and waits for it to release the connection.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.task_handle.take() {
            if let Err(e) = handle.await {
                error!("Device client task panicked: {e}");
            }
        }
    }
}

/// Requests held while the device is offline. At most `depth` per intent
/// kind; the oldest of a kind is superseded first.
struct PendingQueue {
    depth: usize,
    entries: VecDeque<DeviceRequest>,
}

impl PendingQueue {
    fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            entries: VecDeque::new(),
        }
    }

    fn push(&mut self, request: DeviceRequest) {
        let kind = request.kind();
        if self.entries.iter().filter(|r| r.kind() == kind).count() >= self.depth {
            if let Some(pos) = self.entries.iter().position(|r| r.kind() == kind) {
                if let Some(stale) = self.entries.remove(pos) {
                    debug!("Superseding queued {kind} request");
                    stale.reject(DeviceError::Superseded(kind));
                }
            }
        }
        self.entries.push_back(request);
    }

    fn drain(&mut self) -> Vec<DeviceRequest> {
        self.entries.drain(..).collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// How a request left the connected session.
enum Step {
    Continue,
    Fault(String),
    Shutdown,
}

struct DeviceWorker {
    requests: mpsc::Receiver<DeviceRequest>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    link_tx: watch::Sender<LinkStatus>,
    queue: PendingQueue,
    settings: ClientSettings,
    cancel: CancellationToken,
}

impl DeviceWorker {
    async fn run(mut self, link: DeviceLink<Disconnected>) {
        let mut negotiating = link.connect();
        let mut delay = Duration::ZERO;
        let mut attempt: u32 = 0;

        loop {
            let Some(outcome) = self.negotiate(negotiating, delay).await else {
                break;
            };

            match outcome {
                NegotiationOutcome::Connected(link) => {
                    attempt = 0;
                    self.publish_snapshot(link.snapshot());
                    self.link_tx.send_replace(LinkStatus::Connected(
                        link.version().unwrap_or(ProtocolVersion::V33),
                    ));

                    let Some(faulted) = self.serve(link).await else {
                        break;
                    };
                    negotiating = faulted.retry();
                    delay = self.settings.retry.delay(0);
                }
                NegotiationOutcome::Failed(faulted, e) => {
                    error!("Negotiation failed: {e}");
                    self.link_tx.send_replace(LinkStatus::Faulted {
                        reason: e.to_string(),
                    });
                    delay = self.settings.retry.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    info!("Retrying negotiation in {delay:?}");
                    negotiating = faulted.retry();
                }
            }
        }

        for request in self.queue.drain() {
            request.reject(DeviceError::Shutdown);
        }
        self.link_tx.send_replace(LinkStatus::Disconnected);
    }

    /// Waits `delay`, then negotiates, while answering requests per the
    /// offline policy. `None` on shutdown.
    async fn negotiate(
        &mut self,
        link: DeviceLink<Negotiating>,
        delay: Duration,
    ) -> Option<NegotiationOutcome> {
        let status = self.link_tx.clone();
        let negotiation = async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            status.send_replace(LinkStatus::Negotiating);
            link.negotiate().await
        };
        tokio::pin!(negotiation);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                outcome = &mut negotiation => return Some(outcome),
                Some(request) = self.requests.recv() => self.hold(request),
            }
        }
    }

    fn hold(&mut self, request: DeviceRequest) {
        match self.settings.offline_policy {
            OfflinePolicy::FailFast => request.reject(DeviceError::Unavailable),
            OfflinePolicy::Queue => {
                self.queue.push(request);
                debug!("Queued request, {} pending", self.queue.len());
            }
        }
    }

    /// Runs the connected session until it faults. `None` on shutdown.
    async fn serve(&mut self, mut link: DeviceLink<Connected>) -> Option<DeviceLink<Faulted>> {
        let mut backlog = self.queue.drain().into_iter();
        while let Some(request) = backlog.next() {
            let step = self.execute_until_cancelled(&mut link, request).await;
            if !matches!(step, Step::Continue) {
                for request in backlog.by_ref() {
                    self.queue.push(request);
                }
            }
            match step {
                Step::Continue => {}
                Step::Fault(cause) => return Some(link.fault(cause)),
                Step::Shutdown => {
                    link.disconnect();
                    return None;
                }
            }
        }

        let period = self.settings.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    link.disconnect();
                    return None;
                }
                request = self.requests.recv() => {
                    let Some(request) = request else {
                        link.disconnect();
                        return None;
                    };
                    match self.execute_until_cancelled(&mut link, request).await {
                        Step::Continue => {}
                        Step::Fault(cause) => return Some(link.fault(cause)),
                        Step::Shutdown => {
                            link.disconnect();
                            return None;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    let cancel = self.cancel.clone();
                    let beat = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            link.disconnect();
                            return None;
                        }
                        beat = link.heartbeat() => beat,
                    };
                    if let Err(e) = beat {
                        if e.invalidates_session() {
                            return Some(link.fault(e));
                        }
                        warn!("Heartbeat failed: {e}");
                    }
                    self.publish_snapshot(link.snapshot());
                }
                pushed = link.next_push() => match pushed {
                    Ok(Some(snapshot)) => self.publish_snapshot(&snapshot),
                    Ok(None) => {}
                    Err(e) if e.invalidates_session() => return Some(link.fault(e)),
                    Err(e) => warn!("Discarded device message: {e}"),
                },
            }
        }
    }

    /// Runs one request unless shutdown comes first. A request cut short
    /// is dropped unanswered, which its caller sees as `Shutdown`.
    async fn execute_until_cancelled(
        &mut self,
        link: &mut DeviceLink<Connected>,
        request: DeviceRequest,
    ) -> Step {
        let cancel = self.cancel.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Step::Shutdown,
            broken = self.execute(link, request) => match broken {
                Some(cause) => Step::Fault(cause),
                None => Step::Continue,
            },
        }
    }

    /// Runs one request and answers the caller. Returns the failure message
    /// when it broke the session.
    ///
    /// With the queue policy a request the device never received is held for
    /// the next session instead of being answered.
    async fn execute(
        &mut self,
        link: &mut DeviceLink<Connected>,
        request: DeviceRequest,
    ) -> Option<String> {
        let result = match &request {
            DeviceRequest::Poll { .. } => link.poll().await,
            DeviceRequest::Send { kind, dps, .. } => {
                debug!("Delivering {kind} command");
                link.write(dps).await.map(|()| link.snapshot().clone())
            }
        };
        self.publish_snapshot(link.snapshot());
        let broken = session_breaker(&result);

        match result {
            Err(DeviceError::Undelivered(e))
                if self.settings.offline_policy == OfflinePolicy::Queue =>
            {
                warn!("{} request not delivered, holding it: {e}", request.kind());
                self.queue.push(request);
            }
            result => {
                if let (Err(e), DeviceRequest::Send { kind, .. }) = (&result, &request) {
                    warn!("Command {kind} failed: {e}");
                }
                request.complete(result);
            }
        }
        broken
    }

    fn publish_snapshot(&self, snapshot: &StatusSnapshot) {
        self.snapshot_tx.send_if_modified(|current| {
            if current == snapshot {
                return false;
            }
            *current = snapshot.clone();
            true
        });
    }
}

fn session_breaker<T>(result: &Result<T, DeviceError>) -> Option<String> {
    match result {
        Err(e) if e.invalidates_session() => Some(e.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mower::{MowerState, StartMode};
    use crate::protocol::simulator::SimulatedDevice;
    use crate::protocol::DpValue;
    use pretty_assertions::assert_eq;

    fn fast_settings() -> ClientSettings {
        ClientSettings {
            request_timeout_ms: 300,
            retry: RetryPolicy {
                initial_delay_ms: 10,
                max_delay_ms: 50,
                multiplier: 2,
            },
            ..Default::default()
        }
    }

    fn spawn(device: &SimulatedDevice, settings: ClientSettings) -> DeviceHandle {
        let negotiator = SessionNegotiator::new(
            Arc::new(device.clone()),
            Duration::from_millis(settings.request_timeout_ms),
        );
        DeviceHandle::spawn(
            device.identity(),
            negotiator,
            settings,
            CancellationToken::new(),
        )
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(10), Duration::from_secs(60));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn poll_returns_decoded_snapshot() {
        let device = SimulatedDevice::new(&[ProtocolVersion::V34, ProtocolVersion::V33]);
        device.set_dp(101, 2i64);
        device.set_dp(6, 87i64);
        let mut handle = spawn(&device, fast_settings());
        let client = handle.client();

        let snapshot = client.poll().await.unwrap();
        assert_eq!(snapshot.state, Some(MowerState::Mowing));
        assert_eq!(snapshot.battery_percent, Some(87));
        assert!(client.link_status().borrow().is_online());
        // One query while negotiating, one for the poll.
        assert_eq!(device.queries(), 2);

        handle.shutdown().await;
        assert_eq!(*client.link_status().borrow(), LinkStatus::Disconnected);
    }

    #[tokio::test]
    async fn send_writes_control_data_points() {
        let device = SimulatedDevice::new(&[ProtocolVersion::V33]);
        let mut handle = spawn(&device, fast_settings());
        let client = handle.client();

        let ack = client.send(CommandIntent::Dock).await.unwrap();
        assert_eq!(ack.kind, IntentKind::Dock);
        assert_eq!(
            device.controls()[0].get(115),
            Some(&DpValue::Str("StartReturnStation".to_string()))
        );
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_intent_never_reaches_device() {
        let device = SimulatedDevice::new(&[ProtocolVersion::V34]);
        let mut handle = spawn(&device, fast_settings());
        let client = handle.client();
        client.wait_connected().await.unwrap();

        for hours in [-1, 1000] {
            let err = client
                .send(CommandIntent::SetDuration { hours })
                .await
                .unwrap_err();
            assert!(matches!(err, DeviceError::InvalidIntent(_)));
        }
        assert!(device.controls().is_empty());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn repeated_frame_errors_trigger_renegotiation() {
        let device = SimulatedDevice::new(&[ProtocolVersion::V34]);
        let mut handle = spawn(&device, fast_settings());
        let client = handle.client();
        client.wait_connected().await.unwrap();

        device.corrupt_next_reply(3);
        assert!(matches!(
            client.poll().await,
            Err(DeviceError::SessionCorrupted(3))
        ));

        // Queued until the new session is up.
        client.poll().await.unwrap();
        assert_eq!(
            device.connection_attempts(),
            vec![ProtocolVersion::V34, ProtocolVersion::V34]
        );
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn silent_device_times_out_and_reconnects() {
        let device = SimulatedDevice::new(&[ProtocolVersion::V33]);
        let mut handle = spawn(&device, fast_settings());
        let client = handle.client();
        client.wait_connected().await.unwrap();

        device.set_muted(true);
        assert!(matches!(
            client.poll().await,
            Err(DeviceError::TransportTimeout(_))
        ));

        device.set_muted(false);
        client.poll().await.unwrap();
        assert!(device.connection_attempts().len() >= 2);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn fail_fast_policy_reports_unavailable() {
        let device = SimulatedDevice::new(&[ProtocolVersion::V34]);
        device.set_reachable(false);
        let settings = ClientSettings {
            offline_policy: OfflinePolicy::FailFast,
            ..fast_settings()
        };
        let mut handle = spawn(&device, settings);
        let client = handle.client();

        assert!(matches!(client.wait_connected().await, Err(DeviceError::Unavailable)));
        assert!(matches!(
            client.send(CommandIntent::Pause).await,
            Err(DeviceError::Unavailable)
        ));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn offline_queue_keeps_newest_command_per_kind() {
        let device = SimulatedDevice::new(&[ProtocolVersion::V34]);
        device.set_reachable(false);
        let mut handle = spawn(&device, fast_settings());
        let client = handle.client();
        assert!(client.wait_connected().await.is_err());

        let first = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send(CommandIntent::Start {
                        mode: StartMode::Normal,
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send(CommandIntent::Start {
                        mode: StartMode::Spiral,
                    })
                    .await
            })
        };

        assert!(matches!(
            first.await.unwrap(),
            Err(DeviceError::Superseded(IntentKind::Start))
        ));

        device.set_reachable(true);
        assert_eq!(second.await.unwrap().unwrap().kind, IntentKind::Start);
        let controls = device.controls();
        assert_eq!(controls.len(), 1);
        assert_eq!(
            controls[0].get(115),
            Some(&DpValue::Str("StartFixedMowing".to_string()))
        );
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn pushes_reach_subscribers() {
        let device = SimulatedDevice::new(&[ProtocolVersion::V34]);
        let mut handle = spawn(&device, fast_settings());
        let client = handle.client();
        client.wait_connected().await.unwrap();

        let mut updates = client.subscribe();
        updates.borrow_and_update();

        let mut dps = DataPointMap::new();
        dps.insert(6, 50i64);
        assert!(device.push(dps));

        updates.changed().await.unwrap();
        assert_eq!(updates.borrow().battery_percent, Some(50));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn command_across_dropped_connection_is_delivered() {
        let device = SimulatedDevice::new(&[ProtocolVersion::V34]);
        let mut handle = spawn(&device, fast_settings());
        let client = handle.client();
        client.wait_connected().await.unwrap();

        // Whether the worker sees the drop before or after writing, the
        // command must reach the renegotiated session exactly once.
        device.drop_connection();
        let ack = tokio::time::timeout(Duration::from_secs(2), client.send(CommandIntent::Dock))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack.kind, IntentKind::Dock);
        assert_eq!(
            device.connection_attempts(),
            vec![ProtocolVersion::V34, ProtocolVersion::V34]
        );
        let controls = device.controls();
        assert_eq!(controls.len(), 1);
        assert_eq!(
            controls[0].get(115),
            Some(&DpValue::Str("StartReturnStation".to_string()))
        );
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn fail_fast_reports_undelivered_command() {
        let device = SimulatedDevice::new(&[ProtocolVersion::V34]);
        let settings = ClientSettings {
            offline_policy: OfflinePolicy::FailFast,
            ..fast_settings()
        };
        let mut handle = spawn(&device, settings);
        let client = handle.client();
        client.wait_connected().await.unwrap();
        device.set_muted(true);

        // A muted device never answers, so the drop lands before any reply.
        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.send(CommandIntent::Pause).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        device.drop_connection();

        assert!(matches!(
            pending.await.unwrap(),
            Err(DeviceError::Undelivered(_))
        ));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_interrupts_pending_request() {
        let device = SimulatedDevice::new(&[ProtocolVersion::V33]);
        let settings = ClientSettings {
            request_timeout_ms: 5_000,
            ..fast_settings()
        };
        let mut handle = spawn(&device, settings);
        let client = handle.client();
        client.wait_connected().await.unwrap();
        device.set_muted(true);

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.poll().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .unwrap();
        assert!(matches!(pending.await.unwrap(), Err(DeviceError::Shutdown)));
        assert_eq!(*client.link_status().borrow(), LinkStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_keep_session_alive() {
        let device = SimulatedDevice::new(&[ProtocolVersion::V34]);
        let settings = ClientSettings {
            heartbeat_interval_ms: 10_000,
            ..ClientSettings::default()
        };
        let mut handle = spawn(&device, settings);
        handle.client().wait_connected().await.unwrap();

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(device.heartbeats(), 2);
        handle.shutdown().await;
    }
}
