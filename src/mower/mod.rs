//! # Mower Vocabulary
//!
//! The only place that knows what the controller's data points mean.
//! [`status`] turns raw data points into a [`StatusSnapshot`], [`command`]
//! turns a [`CommandIntent`] into the data points the controller expects.

pub mod command;
pub mod status;

pub use command::{CommandIntent, IntentKind, InvalidIntentError, StartMode};
pub use status::{MowerState, StatusSnapshot, Zone};

/// Data-point identifiers used by the mower firmware.
pub mod dp {
    pub const BATTERY: u32 = 6;
    pub const STATE: u32 = 101;
    pub const MACHINE_ERROR: u32 = 102;
    pub const EMERGENCY_STATE: u32 = 103;
    pub const MOW_IN_RAIN: u32 = 104;
    pub const MOW_TIME: u32 = 105;
    pub const PASSWORD: u32 = 106;
    pub const ZONES: u32 = 113;
    pub const WORK_MODE: u32 = 114;
    pub const COMMAND: u32 = 115;
}

pub const ZONE_COUNT: usize = 5;
