//! JSON request bodies and data-point extraction.

use chrono::Utc;
use serde_json::{json, Value};

use super::datapoints::DataPointMap;
use super::error::FrameError;
use super::frame::Frame;
use super::{CommandType, DeviceIdentity, ProtocolVersion};

/// 3.3 bodies carry the epoch seconds as a string, 3.4 bodies as a number.
fn timestamp() -> String {
    epoch_seconds().to_string()
}

fn epoch_seconds() -> i64 {
    Utc::now().timestamp()
}

/// Status probe body, shared by `DP_QUERY` and `DP_QUERY_NEW`.
pub fn query_payload(identity: &DeviceIdentity) -> Vec<u8> {
    json!({
        "gwId": identity.device_id,
        "devId": identity.device_id,
        "uid": identity.device_id,
        "t": timestamp(),
    })
    .to_string()
    .into_bytes()
}

pub fn query_command(version: ProtocolVersion) -> CommandType {
    match version {
        ProtocolVersion::V33 => CommandType::DpQuery,
        ProtocolVersion::V34 => CommandType::DpQueryNew,
    }
}

/// Control request for a data-point write set.
pub fn control_request(
    version: ProtocolVersion,
    identity: &DeviceIdentity,
    dps: &DataPointMap,
) -> (CommandType, Vec<u8>) {
    let body = match version {
        ProtocolVersion::V33 => json!({
            "devId": identity.device_id,
            "uid": identity.device_id,
            "t": timestamp(),
            "dps": dps,
        }),
        ProtocolVersion::V34 => json!({
            "protocol": 5,
            "t": epoch_seconds(),
            "data": { "dps": dps },
        }),
    };
    let command = match version {
        ProtocolVersion::V33 => CommandType::Control,
        ProtocolVersion::V34 => CommandType::ControlNew,
    };
    (command, body.to_string().into_bytes())
}

pub fn heartbeat_payload(identity: &DeviceIdentity) -> Vec<u8> {
    json!({
        "gwId": identity.device_id,
        "devId": identity.device_id,
    })
    .to_string()
    .into_bytes()
}

/// Data points carried by a frame, under `dps` or `data.dps`.
///
/// Empty payloads and bodies without data points yield `Ok(None)`.
pub fn data_points(frame: &Frame) -> Result<Option<DataPointMap>, FrameError> {
    if frame.payload.is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_slice(&frame.payload)
        .map_err(|e| FrameError::MalformedPayload(e.to_string()))?;

    let dps = value
        .get("dps")
        .or_else(|| value.get("data").and_then(|data| data.get("dps")));

    match dps {
        Some(dps) => serde_json::from_value(dps.clone())
            .map(Some)
            .map_err(|e| FrameError::MalformedPayload(e.to_string())),
        None => Ok(None),
    }
}
