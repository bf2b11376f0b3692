//! Status Decoder
//!
//! Decoding always merges over the previous snapshot: the controller pushes
//! only the data points that changed, so a missing key never resets a field.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, warn};

use super::{dp, ZONE_COUNT};
use crate::protocol::{DataPointMap, DpValue};

/// Topic content for an empty error set.
pub const NO_ERRORS: &str = "None";

const ERROR_NAMES: [&str; 30] = [
    "FAULT_LEAN",
    "FAULT_TOO_STEEP",
    "NO_SIGNAL",
    "L_MOTOR_ERROR",
    "R_MOTOR_ERROR",
    "BATTERY_VOL_HIGH",
    "CHARGE_OVERCURRENT",
    "CHARGE_OVERVOLTAGE",
    "CHARGE_OVERTEMP",
    "BATTERY_DAMAGE",
    "BATTERY_LOW",
    "DISCHARGE_CURRENT",
    "DISCHARGE_TEMP",
    "UNEXPECTED_LOW",
    "EXPECTED_ERROR",
    "IMU_INVALID",
    "EMS_INVALID",
    "RAIN_INVALID",
    "HALL_INVALID",
    "STEEP_OVER_3S",
    "OUTSIDE_AREA",
    "LIFTED",
    "TRAPPED",
    "B_MOTOR_ERROR",
    "OVERTURN",
    "MOTOR_OVERCURRENT",
    "MOTOR_HALL",
    "MOTOR_DISCONNECT",
    "EMS_DISCONNECT",
    "MOTOR_ERROR",
];

/// Human-readable message for one error bit.
pub fn error_message(code: u32) -> String {
    match ERROR_NAMES.get(code as usize) {
        Some(name) => name.to_string(),
        None => format!("error {code}"),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MowerState {
    Standby,
    Charging,
    Mowing,
    Paused,
    Park,
    Emergency,
    Locked,
    FixedMowing,
    ChargingWithTaskSuspend,
    Error,
    UnknownCode(i64),
    UnknownName(String),
}

impl MowerState {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => MowerState::Standby,
            1 => MowerState::Charging,
            2 => MowerState::Mowing,
            3 => MowerState::Paused,
            4 => MowerState::Park,
            5 => MowerState::Emergency,
            6 => MowerState::Locked,
            7 => MowerState::FixedMowing,
            8 => MowerState::ChargingWithTaskSuspend,
            9 => MowerState::Error,
            other => MowerState::UnknownCode(other),
        }
    }

    /// Firmware names, case-insensitive. Numeric strings are treated as codes.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_uppercase().as_str() {
            "STANDBY" => MowerState::Standby,
            "CHARGING" => MowerState::Charging,
            "MOWING" => MowerState::Mowing,
            "PAUSED" => MowerState::Paused,
            "PARK" => MowerState::Park,
            "EMERGENCY" => MowerState::Emergency,
            "LOCKED" => MowerState::Locked,
            "FIXED_MOWING" => MowerState::FixedMowing,
            "CHARGING_WITH_TASK_SUSPEND" => MowerState::ChargingWithTaskSuspend,
            "ERROR" => MowerState::Error,
            _ => match name.trim().parse() {
                Ok(code) => MowerState::from_code(code),
                Err(_) => MowerState::UnknownName(name.to_string()),
            },
        }
    }

    fn from_value(value: &DpValue) -> Option<Self> {
        match value {
            DpValue::Int(code) => Some(Self::from_code(*code)),
            DpValue::Str(name) => Some(Self::from_name(name)),
            _ => None,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, MowerState::UnknownCode(_) | MowerState::UnknownName(_))
    }
}

impl fmt::Display for MowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MowerState::Standby => "STANDBY",
            MowerState::Charging => "CHARGING",
            MowerState::Mowing => "MOWING",
            MowerState::Paused => "PAUSED",
            MowerState::Park => "PARK",
            MowerState::Emergency => "EMERGENCY",
            MowerState::Locked => "LOCKED",
            MowerState::FixedMowing => "FIXED_MOWING",
            MowerState::ChargingWithTaskSuspend => "CHARGING_WITH_TASK_SUSPEND",
            MowerState::Error => "ERROR",
            MowerState::UnknownCode(code) => return write!(f, "unknown state {code}"),
            MowerState::UnknownName(name) => return f.write_str(name),
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Zone {
    pub distance: u16,
    pub ratio: u8,
}

/// Decoded device status at one point in time.
///
/// Fields stay `None` until the controller reports them at least once.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatusSnapshot {
    pub state: Option<MowerState>,
    pub battery_percent: Option<u8>,
    pub active_error_codes: BTreeSet<u32>,
    /// Raw digits as reported by the controller.
    pub device_pin: Option<String>,
    pub mow_duration_hours: Option<u32>,
    pub rain_mode_enabled: Option<bool>,
    /// Why the mower stopped, e.g. `LIFTED`. Only meaningful in `EMERGENCY`.
    pub emergency_state: Option<String>,
    pub work_mode: Option<String>,
    pub zones: [Option<Zone>; ZONE_COUNT],
    pub unrecognized: DataPointMap,
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl StatusSnapshot {
    pub fn decode(raw: &DataPointMap, previous: &StatusSnapshot) -> Self {
        Self::decode_at(raw, previous, Utc::now())
    }

    pub fn decode_at(raw: &DataPointMap, previous: &StatusSnapshot, at: DateTime<Utc>) -> Self {
        let mut next = previous.clone();

        for (id, value) in raw.iter() {
            match id {
                dp::BATTERY => match value.as_i64().and_then(|v| u8::try_from(v).ok()) {
                    Some(percent) if percent <= 100 => next.battery_percent = Some(percent),
                    _ => warn!("Ignoring battery value out of range: {value}"),
                },
                dp::STATE => match MowerState::from_value(value) {
                    Some(state) => {
                        if !state.is_known() {
                            warn!("Controller reported unrecognized state: {state}");
                        }
                        next.state = Some(state);
                    }
                    None => warn!("Ignoring malformed state value: {value}"),
                },
                dp::MACHINE_ERROR => match value.as_i64() {
                    Some(bits) => next.active_error_codes = error_bits(bits),
                    None => warn!("Ignoring malformed error bitmap: {value}"),
                },
                dp::EMERGENCY_STATE => next.emergency_state = Some(value.to_string()),
                dp::MOW_IN_RAIN => match value.as_bool() {
                    Some(enabled) => next.rain_mode_enabled = Some(enabled),
                    None => warn!("Ignoring malformed rain mode value: {value}"),
                },
                dp::MOW_TIME => match value.as_i64().and_then(|v| u32::try_from(v).ok()) {
                    Some(hours) => next.mow_duration_hours = Some(hours),
                    None => warn!("Ignoring malformed mow time: {value}"),
                },
                dp::PASSWORD => match value {
                    DpValue::Int(_) | DpValue::Str(_) => next.device_pin = Some(value.to_string()),
                    _ => warn!("Ignoring malformed PIN value"),
                },
                dp::ZONES => decode_zones(value, &mut next.zones),
                dp::WORK_MODE => next.work_mode = Some(value.to_string()),
                dp::COMMAND => debug!("Controller echoed command {value}"),
                other => {
                    debug!("Unrecognized data point {other}: {value}");
                    next.unrecognized.insert(other, value.clone());
                }
            }
        }

        next.last_updated_at = Some(at);
        next
    }

    pub fn error_messages(&self) -> Vec<String> {
        self.active_error_codes
            .iter()
            .map(|code| error_message(*code))
            .collect()
    }

    /// Comma-joined error messages, or [`NO_ERRORS`].
    pub fn machine_errors(&self) -> String {
        if self.active_error_codes.is_empty() {
            NO_ERRORS.to_string()
        } else {
            self.error_messages().join(",")
        }
    }

    /// The emergency reason, but only while the mower is in `EMERGENCY`.
    /// The controller keeps reporting the last reason after it recovers.
    pub fn active_emergency(&self) -> Option<&str> {
        match (&self.state, self.emergency_state.as_deref()) {
            (Some(MowerState::Emergency), Some(reason)) if !reason.is_empty() => Some(reason),
            _ => None,
        }
    }

    /// PIN as keypad letters: digits 1-4 become A-D.
    pub fn pin_letters(&self) -> Option<String> {
        self.device_pin.as_deref().map(|pin| {
            pin.chars()
                .map(|c| match c {
                    '1' => 'A',
                    '2' => 'B',
                    '3' => 'C',
                    '4' => 'D',
                    other => other,
                })
                .collect()
        })
    }
}

fn error_bits(bits: i64) -> BTreeSet<u32> {
    let bits = bits as u64;
    (0..u64::BITS).filter(|bit| bits & (1 << bit) != 0).collect()
}

fn decode_zones(value: &DpValue, zones: &mut [Option<Zone>; ZONE_COUNT]) {
    let Some(encoded) = value.as_str() else {
        warn!("Ignoring non-string zone data: {value}");
        return;
    };
    let bytes = match STANDARD.decode(encoded.trim()) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Ignoring undecodable zone data: {e}");
            return;
        }
    };

    // A short blob only updates the zones it covers.
    for (slot, chunk) in zones.iter_mut().zip(bytes.chunks_exact(3)) {
        *slot = Some(Zone {
            distance: u16::from_be_bytes([chunk[0], chunk[1]]),
            ratio: chunk[2],
        });
    }
}
