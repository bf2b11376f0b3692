//! Topic layout, stat rendering and inbound command parsing.
//!
//! Nothing in here touches the broker; `mqtt_handler` feeds it packets and
//! publishes what it returns.

use chrono::{DateTime, Local};
use std::collections::HashMap;

use crate::mower::{CommandIntent, InvalidIntentError, StatusSnapshot, ZONE_COUNT};

pub const STAT_STATE: &str = "state";
pub const STAT_BATTERY: &str = "battery";
pub const STAT_MACHINE_ERRORS: &str = "machine_errors";
pub const STAT_DEVICE_PASSWORD: &str = "device_password";
pub const STAT_MOW_TIME: &str = "mow_time";
pub const STAT_MOW_IN_RAIN: &str = "mow_in_rain";
pub const STAT_WORK_MODE: &str = "work_mode";
pub const STAT_ONLINE: &str = "online";
pub const STAT_EMERGENCY_STATE: &str = "emergency_state";

/// Published while the PIN has not been reported yet.
const UNKNOWN: &str = "Unknown";

/// A message as it crosses the broker boundary.
#[derive(Clone, PartialEq, Eq)]
pub struct MQTTMessage {
    pub topic: String,
    pub content: String,
    pub timestamp: DateTime<Local>,
}

impl MQTTMessage {
    pub fn from_topic(topic: String, content: String) -> Self {
        MQTTMessage {
            topic,
            content,
            timestamp: Local::now(),
        }
    }

    /// Decodes a raw publish. Non UTF-8 bytes are replaced.
    pub fn from_publish(topic: &str, payload: &[u8]) -> Self {
        Self::from_topic(
            topic.to_string(),
            String::from_utf8_lossy(payload).into_owned(),
        )
    }

    pub fn render(&self) -> String {
        format!("{}: {}\n{}", self.timestamp, self.topic, self.content)
    }
}

/// Topic names below the configured base topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicLayout {
    base: String,
}

impl TopicLayout {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn command_filter(&self) -> String {
        format!("{}/cmnd/#", self.base)
    }

    pub fn stat(&self, name: &str) -> String {
        format!("{}/stats/{}", self.base, name)
    }

    /// Command name for a topic under `cmnd/`, if it is one.
    pub fn command_name<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(self.base.as_str())?
            .strip_prefix("/cmnd/")
            .filter(|name| !name.is_empty() && !name.contains('/'))
    }
}

/// What an inbound `cmnd/` message asks the bridge to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundCommand {
    Device(CommandIntent),
    RepublishErrors,
    RepublishPassword,
}

pub fn parse_inbound(command: &str, payload: &str) -> Result<InboundCommand, InvalidIntentError> {
    match command {
        "get_errors" => Ok(InboundCommand::RepublishErrors),
        "get_password" => Ok(InboundCommand::RepublishPassword),
        _ => CommandIntent::from_topic(command, payload).map(InboundCommand::Device),
    }
}

fn zone_distance(zone: usize) -> String {
    format!("zone{}_distance", zone + 1)
}

fn zone_ratio(zone: usize) -> String {
    format!("zone{}_ratio", zone + 1)
}

/// `device_password` payload. Only an explicit `get_password` publishes
/// the `Unknown` placeholder.
pub fn password_payload(snapshot: &StatusSnapshot) -> String {
    snapshot
        .pin_letters()
        .unwrap_or_else(|| UNKNOWN.to_string())
}

/// Every stat the snapshot currently carries, as `(name, payload)`.
///
/// Fields the controller never reported are left out, except for
/// `machine_errors`, `emergency_state` and `online` which always have a
/// value. `emergency_state` is empty unless the mower is in `EMERGENCY`.
pub fn render_stats(snapshot: &StatusSnapshot, online: bool) -> Vec<(String, String)> {
    let mut stats = Vec::new();
    let mut push = |name: &str, value: String| stats.push((name.to_string(), value));

    if let Some(state) = &snapshot.state {
        push(STAT_STATE, state.to_string());
    }
    if let Some(battery) = snapshot.battery_percent {
        push(STAT_BATTERY, battery.to_string());
    }
    push(STAT_MACHINE_ERRORS, snapshot.machine_errors());
    if let Some(pin) = snapshot.pin_letters() {
        push(STAT_DEVICE_PASSWORD, pin);
    }
    push(
        STAT_EMERGENCY_STATE,
        snapshot.active_emergency().unwrap_or_default().to_string(),
    );
    if let Some(hours) = snapshot.mow_duration_hours {
        push(STAT_MOW_TIME, hours.to_string());
    }
    if let Some(enabled) = snapshot.rain_mode_enabled {
        push(STAT_MOW_IN_RAIN, enabled.to_string());
    }
    if let Some(mode) = &snapshot.work_mode {
        push(STAT_WORK_MODE, mode.clone());
    }
    push(STAT_ONLINE, online.to_string());

    for (index, zone) in snapshot.zones.iter().enumerate().take(ZONE_COUNT) {
        if let Some(zone) = zone {
            push(&zone_distance(index), zone.distance.to_string());
            push(&zone_ratio(index), zone.ratio.to_string());
        }
    }
    stats
}

/// Remembers the last payload published per stat so unchanged values are
/// not sent again.
#[derive(Debug, Default)]
pub struct StatsTracker {
    published: HashMap<String, String>,
}

impl StatsTracker {
    /// Keeps only the stats whose payload differs from the last publish and
    /// records them as published.
    pub fn changed(&mut self, stats: Vec<(String, String)>) -> Vec<(String, String)> {
        stats
            .into_iter()
            .filter(|(name, payload)| {
                if self.published.get(name) == Some(payload) {
                    return false;
                }
                self.published.insert(name.clone(), payload.clone());
                true
            })
            .collect()
    }

    /// Forces the next `changed` call to include `name`.
    pub fn forget(&mut self, name: &str) {
        self.published.remove(name);
    }

    /// Forces a full republish, used after a broker reconnect.
    pub fn reset(&mut self) {
        self.published.clear();
    }
}
