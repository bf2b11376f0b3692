//! Command Encoder
//!
//! Pure mapping between [`CommandIntent`] and the data points the controller
//! accepts. Validation happens here so out-of-range intents never reach the
//! device.

use std::fmt;
use std::ops::RangeInclusive;
use thiserror::Error;

use super::dp;
use crate::protocol::{DataPointMap, DpValue};

/// Mow time the controller accepts, in hours.
pub const MOW_TIME_RANGE: RangeInclusive<i64> = 1..=99;

const START_MOWING: &str = "StartMowing";
const START_FIXED_MOWING: &str = "StartFixedMowing";
const PAUSE_WORK: &str = "PauseWork";
const RETURN_STATION: &str = "StartReturnStation";
const CANCEL_WORK: &str = "CancelWork";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidIntentError {
    #[error("mow time must be between 1 and 99 hours, got {0}")]
    DurationOutOfRange(i64),

    #[error("invalid payload {payload:?} for command {command}")]
    BadPayload { command: String, payload: String },

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("data points do not describe a command")]
    NotACommand,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StartMode {
    Normal,
    Spiral,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandIntent {
    Start { mode: StartMode },
    Pause,
    Dock,
    Cancel,
    SetRainMode { enabled: bool },
    SetDuration { hours: i64 },
    Poll,
}

/// Intent discriminant, used to key the offline command queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IntentKind {
    Start,
    Pause,
    Dock,
    Cancel,
    SetRainMode,
    SetDuration,
    Poll,
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IntentKind::Start => "start",
            IntentKind::Pause => "pause",
            IntentKind::Dock => "dock",
            IntentKind::Cancel => "cancel",
            IntentKind::SetRainMode => "mow_in_rain",
            IntentKind::SetDuration => "mow_time",
            IntentKind::Poll => "poll",
        };
        f.write_str(name)
    }
}

impl CommandIntent {
    pub fn kind(&self) -> IntentKind {
        match self {
            CommandIntent::Start { .. } => IntentKind::Start,
            CommandIntent::Pause => IntentKind::Pause,
            CommandIntent::Dock => IntentKind::Dock,
            CommandIntent::Cancel => IntentKind::Cancel,
            CommandIntent::SetRainMode { .. } => IntentKind::SetRainMode,
            CommandIntent::SetDuration { .. } => IntentKind::SetDuration,
            CommandIntent::Poll => IntentKind::Poll,
        }
    }

    /// Data-point write set for this intent. `Poll` writes nothing.
    pub fn encode(&self) -> Result<DataPointMap, InvalidIntentError> {
        let mut dps = DataPointMap::new();
        match self {
            CommandIntent::Start { mode } => {
                let command = match mode {
                    StartMode::Normal => START_MOWING,
                    StartMode::Spiral => START_FIXED_MOWING,
                };
                dps.insert(dp::COMMAND, command);
            }
            CommandIntent::Pause => dps.insert(dp::COMMAND, PAUSE_WORK),
            CommandIntent::Dock => dps.insert(dp::COMMAND, RETURN_STATION),
            CommandIntent::Cancel => dps.insert(dp::COMMAND, CANCEL_WORK),
            CommandIntent::SetRainMode { enabled } => dps.insert(dp::MOW_IN_RAIN, *enabled),
            CommandIntent::SetDuration { hours } => {
                if !MOW_TIME_RANGE.contains(hours) {
                    return Err(InvalidIntentError::DurationOutOfRange(*hours));
                }
                dps.insert(dp::MOW_TIME, *hours);
            }
            CommandIntent::Poll => {}
        }
        Ok(dps)
    }

    /// Inverse of [`CommandIntent::encode`].
    pub fn decode(dps: &DataPointMap) -> Result<Self, InvalidIntentError> {
        if dps.is_empty() {
            return Ok(CommandIntent::Poll);
        }
        if let Some(command) = dps.get(dp::COMMAND).and_then(DpValue::as_str) {
            return match command {
                START_MOWING => Ok(CommandIntent::Start {
                    mode: StartMode::Normal,
                }),
                START_FIXED_MOWING => Ok(CommandIntent::Start {
                    mode: StartMode::Spiral,
                }),
                PAUSE_WORK => Ok(CommandIntent::Pause),
                RETURN_STATION => Ok(CommandIntent::Dock),
                CANCEL_WORK => Ok(CommandIntent::Cancel),
                other => Err(InvalidIntentError::UnknownCommand(other.to_string())),
            };
        }
        if let Some(enabled) = dps.get(dp::MOW_IN_RAIN).and_then(DpValue::as_bool) {
            return Ok(CommandIntent::SetRainMode { enabled });
        }
        if let Some(hours) = dps.get(dp::MOW_TIME).and_then(DpValue::as_i64) {
            return Ok(CommandIntent::SetDuration { hours });
        }
        Err(InvalidIntentError::NotACommand)
    }

    /// Builds an intent from a `cmnd/<command>` topic suffix and its payload.
    pub fn from_topic(command: &str, payload: &str) -> Result<Self, InvalidIntentError> {
        let token = payload.trim().to_ascii_lowercase();
        let bad_payload = || InvalidIntentError::BadPayload {
            command: command.to_string(),
            payload: payload.to_string(),
        };

        match command {
            "start" => Ok(CommandIntent::Start {
                mode: if token == "spiral" {
                    StartMode::Spiral
                } else {
                    StartMode::Normal
                },
            }),
            "pause" => Ok(CommandIntent::Pause),
            "dock" => Ok(CommandIntent::Dock),
            "cancel" => Ok(CommandIntent::Cancel),
            "poll" => Ok(CommandIntent::Poll),
            "mow_in_rain" => match token.as_str() {
                "true" | "on" | "1" | "yes" => Ok(CommandIntent::SetRainMode { enabled: true }),
                "false" | "off" | "0" | "no" => Ok(CommandIntent::SetRainMode { enabled: false }),
                _ => Err(bad_payload()),
            },
            "mow_time" => token
                .parse()
                .map(|hours| CommandIntent::SetDuration { hours })
                .map_err(|_| bad_payload()),
            other => Err(InvalidIntentError::UnknownCommand(other.to_string())),
        }
    }
}
