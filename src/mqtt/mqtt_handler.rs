use std::time::Duration;

use chrono::Local;
use rumqttc::{
    AsyncClient, ClientError, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::MqttConfig;
use super::message_manager::{
    parse_inbound, password_payload, render_stats, InboundCommand, MQTTMessage, StatsTracker, TopicLayout,
    STAT_DEVICE_PASSWORD, STAT_MACHINE_ERRORS, STAT_ONLINE,
};
use crate::device::{DeviceClient, LinkStatus};
use crate::mower::{InvalidIntentError, StatusSnapshot};

const REQUEST_CAPACITY: usize = 64;
const RECONNECT_PAUSE: Duration = Duration::from_secs(2);
const SHUTDOWN_FLUSH: Duration = Duration::from_secs(2);
const MAX_KEPT_ERRORS: usize = 20;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("mqtt client request failed: {0}")]
    Client(#[from] ClientError),

    #[error("not a command topic: {0}")]
    UnexpectedTopic(String),

    #[error(transparent)]
    InvalidCommand(#[from] InvalidIntentError),

    #[error("device client stopped")]
    DeviceStopped,
}

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
    Failed,
    Reconnecting,
}

#[derive(Clone, Debug, Default)]
pub struct MQTTStatus {
    pub connection_state: ConnectionState,
    pub error_messages: Vec<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<chrono::DateTime<chrono::Local>>,
}

impl MQTTStatus {
    fn record_error(&mut self, message: String) {
        if self.error_messages.len() == MAX_KEPT_ERRORS {
            self.error_messages.remove(0);
        }
        self.error_messages.push(message);
    }
}

/// Relays snapshots to `stats/` topics and `cmnd/` messages to the device.
pub struct MqttHandler {
    status: MQTTStatus,
    client: AsyncClient,
    eventloop: EventLoop,
    topics: TopicLayout,
    tracker: StatsTracker,
    device: DeviceClient,
    snapshot: watch::Receiver<StatusSnapshot>,
    link: watch::Receiver<LinkStatus>,
    poll_interval: Duration,
}

impl MqttHandler {
    pub fn new(config: &MqttConfig, device: DeviceClient, poll_interval: Duration) -> Self {
        let topics = TopicLayout::new(&config.topic);

        let mut mqtt_options = MqttOptions::new(&config.client_id, &config.host, config.port);
        mqtt_options
            .set_keep_alive(config.keep_alive())
            .set_last_will(LastWill::new(
                topics.stat(STAT_ONLINE),
                "false",
                QoS::AtLeastOnce,
                true,
            ));
        if let Some((user, pw)) = config.credentials() {
            mqtt_options.set_credentials(user, pw);
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);

        MqttHandler {
            status: MQTTStatus::default(),
            client,
            eventloop,
            topics,
            tracker: StatsTracker::default(),
            snapshot: device.subscribe(),
            link: device.link_status(),
            device,
            poll_interval,
        }
    }

    /// Runs the bridge until `cancel` fires. Device faults never end this
    /// loop; they show up as `online=false`.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<MQTTStatus, BridgeError> {
        let poller = self.spawn_poller(cancel.clone());

        let result = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break Ok(()),

                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => self.on_connected(),
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        self.status.messages_received += 1;
                        self.status.last_activity = Some(Local::now());
                        let message = MQTTMessage::from_publish(&p.topic, &p.payload);
                        if let Err(e) = self.handle_message(message) {
                            warn!("Ignoring inbound message: {e}");
                            self.status.record_error(e.to_string());
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("MQTT broker closed the connection");
                        self.status.connection_state = ConnectionState::Reconnecting;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT connection error: {e}");
                        self.status.connection_state = ConnectionState::Failed;
                        self.status.record_error(e.to_string());
                        tokio::select! {
                            _ = cancel.cancelled() => break Ok(()),
                            _ = tokio::time::sleep(RECONNECT_PAUSE) => {}
                        }
                    }
                },

                changed = self.snapshot.changed() => match changed {
                    Ok(()) => self.publish_stats(),
                    Err(_) => break Err(BridgeError::DeviceStopped),
                },

                changed = self.link.changed() => match changed {
                    Ok(()) => {
                        let status = self.link.borrow_and_update().clone();
                        debug!("Device link is now {status:?}");
                        self.publish_stats();
                    }
                    Err(_) => break Err(BridgeError::DeviceStopped),
                },
            }
        };

        poller.abort();
        self.go_offline().await;
        result.map(|()| self.status)
    }

    /// Polls on a fixed interval in its own task, so a slow or offline
    /// device never holds up the broker connection. Results arrive through
    /// the snapshot channel.
    fn spawn_poller(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let device = self.device.clone();
        let period = self.poll_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = device.poll().await {
                            debug!("Scheduled poll failed: {e}");
                        }
                    }
                }
            }
        })
    }

    fn on_connected(&mut self) {
        info!("Connected to MQTT broker");
        self.status.connection_state = ConnectionState::Connected;

        let filter = self.topics.command_filter();
        match self.client.try_subscribe(&filter, QoS::AtLeastOnce) {
            Ok(()) => info!("Subscribed to {filter}"),
            Err(e) => {
                error!("Subscribe to {filter} failed: {e}");
                self.status.record_error(e.to_string());
            }
        }

        // The broker may have lost our retained stats.
        self.tracker.reset();
        self.publish_stats();
    }

    fn handle_message(&mut self, message: MQTTMessage) -> Result<(), BridgeError> {
        debug!("Received {}", message.render());
        let command = self
            .topics
            .command_name(&message.topic)
            .ok_or_else(|| BridgeError::UnexpectedTopic(message.topic.clone()))?;

        match parse_inbound(command, &message.content)? {
            InboundCommand::RepublishErrors => {
                self.tracker.forget(STAT_MACHINE_ERRORS);
                self.publish_stats();
            }
            InboundCommand::RepublishPassword => {
                // Answered even before the PIN is known.
                let payload = password_payload(&self.snapshot.borrow());
                self.tracker.forget(STAT_DEVICE_PASSWORD);
                self.publish_changed(vec![(STAT_DEVICE_PASSWORD.to_string(), payload)]);
            }
            InboundCommand::Device(intent) => {
                // Invalid intents fail here, before anything is queued.
                intent.encode()?;
                info!("Forwarding {} command", intent.kind());
                let device = self.device.clone();
                tokio::spawn(async move {
                    let kind = intent.kind();
                    match device.send(intent).await {
                        Ok(ack) => info!("Device accepted {} command", ack.kind),
                        Err(e) => warn!("Device did not accept {kind} command: {e}"),
                    }
                });
            }
        }
        Ok(())
    }

    /// Publishes every stat whose payload changed since the last publish.
    fn publish_stats(&mut self) {
        let online = self.link.borrow().is_online();
        let snapshot = self.snapshot.borrow_and_update().clone();
        self.publish_changed(render_stats(&snapshot, online));
    }

    fn publish_changed(&mut self, stats: Vec<(String, String)>) {
        for (name, payload) in self.tracker.changed(stats) {
            if let Err(e) = self.publish(&name, payload) {
                warn!("Publishing {name} failed: {e}");
                self.tracker.forget(&name);
            }
        }
    }

    fn publish(&mut self, name: &str, payload: String) -> Result<(), BridgeError> {
        let topic = self.topics.stat(name);
        debug!("Publishing {topic} = {payload}");
        self.client
            .try_publish(topic, QoS::AtLeastOnce, true, payload)?;
        self.status.messages_sent += 1;
        self.status.last_activity = Some(Local::now());
        Ok(())
    }

    /// Marks the bridge offline and gives the event loop a moment to flush
    /// that before disconnecting.
    async fn go_offline(&mut self) {
        info!("Marking bridge offline");
        if let Err(e) = self.publish(STAT_ONLINE, false.to_string()) {
            warn!("Could not publish offline state: {e}");
        }
        if let Err(e) = self.client.try_disconnect() {
            warn!("Could not disconnect from broker: {e}");
        }

        let flush = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_FLUSH, flush).await.is_err() {
            debug!("Broker did not confirm disconnect in time");
        }
        self.status.connection_state = ConnectionState::Disconnected;
    }
}
