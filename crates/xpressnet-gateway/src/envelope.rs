//! Message shapes on the client edge: inbound action requests and the
//! outbound `{status_code, message, action?, data, debug?}` envelopes.
//!
//! Status codes bucket the decoder-classified conditions: 200 ready/OK,
//! 400 bad request / transmission error / unsupported, 500 emergency and
//! power off, 503 busy / service mode / powering up, 520 unknown.

use serde::Deserialize;
use serde_json::{Map, Value, json};
use xpressnet::{
    loco::{Direction, LocoAddress, LowFunctions},
    reply::StationStatus,
};

use crate::state::LocoSnapshot;

/// Uppercase hex rendering used for the `debug` field and the logs.
pub(crate) fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02X}");
        out
    })
}

/// One inbound client action. Fields beyond `action` are optional at the
/// parse level; each handler checks for the ones it needs.
#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    pub action: String,
    pub train_number: Option<u16>,
    pub speed: Option<u16>,
    pub direction: Option<DirectionArg>,
    pub function_id: Option<u8>,
    pub switch: Option<SwitchArg>,
    pub accessory_number: Option<u16>,
    pub accessory_id: Option<Value>,
    pub state: Option<Value>,
}

/// Clients historically sent directions both as 0/1 and as
/// `"FORWARD"`/`"REVERSE"`; accept either.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum DirectionArg {
    Number(u8),
    Text(String),
}

impl DirectionArg {
    pub fn resolve(&self) -> Option<Direction> {
        match self {
            Self::Number(0) => Some(Direction::Reverse),
            Self::Number(1) => Some(Direction::Forward),
            Self::Number(_) => None,
            Self::Text(s) => Direction::parse(s),
        }
    }
}

/// Function switches arrive as booleans or as 0/1.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum SwitchArg {
    Flag(bool),
    Number(u8),
}

impl SwitchArg {
    pub fn resolve(&self) -> Option<bool> {
        match self {
            Self::Flag(b) => Some(*b),
            Self::Number(0) => Some(false),
            Self::Number(1) => Some(true),
            Self::Number(_) => None,
        }
    }
}

fn envelope(
    status_code: u16,
    message: &str,
    action: Option<&str>,
    data: Value,
    debug: Option<&str>,
) -> Value {
    let mut obj = Map::new();
    obj.insert("status_code".into(), status_code.into());
    obj.insert("message".into(), message.into());
    if let Some(action) = action {
        obj.insert("action".into(), action.into());
    }
    obj.insert("data".into(), data);
    if let Some(debug) = debug {
        obj.insert("debug".into(), debug.into());
    }
    Value::Object(obj)
}

fn low_functions_map(low: LowFunctions) -> Value {
    let mut map = Map::new();
    for n in 0..=12u8 {
        map.insert(n.to_string(), low.get(n).into());
    }
    Value::Object(map)
}

pub fn throttle_update(
    addr: LocoAddress,
    speed: u8,
    direction: Direction,
    debug: Option<&str>,
) -> Value {
    envelope(
        200,
        "Loco Speed/Direction Status",
        Some("throttle"),
        json!({
            "train_number": addr.value(),
            "speed": speed,
            "direction": direction.to_string(),
        }),
        debug,
    )
}

pub fn function_update(addr: LocoAddress, low: LowFunctions, debug: Option<&str>) -> Value {
    envelope(
        200,
        "Loco Function Status",
        Some("function"),
        json!({
            "train_number": addr.value(),
            "functions": low_functions_map(low),
        }),
        debug,
    )
}

/// The single message emitted once a state-reply pair has completed.
pub fn loco_state(snapshot: &LocoSnapshot, debug: Option<&str>) -> Value {
    let mut functions = Map::new();
    for n in 0..=28u8 {
        functions.insert(n.to_string(), snapshot.function(n).into());
    }
    envelope(
        200,
        "Loco State",
        Some("getState"),
        json!({
            "train_number": snapshot.addr.value(),
            "speed": snapshot.speed,
            "direction": snapshot.direction.to_string(),
            "functions": functions,
        }),
        debug,
    )
}

pub fn station_status(status: StationStatus, debug: Option<&str>) -> Value {
    let status_code = if status.intersects(
        StationStatus::EMERGENCY_OFF
            | StationStatus::EMERGENCY_STOP
            | StationStatus::RAM_CHECK_ERROR,
    ) {
        500
    } else if status.intersects(StationStatus::SERVICE_MODE | StationStatus::POWERING_UP) {
        503
    } else {
        200
    };
    envelope(
        status_code,
        "Status",
        None,
        json!({
            "Ready": status.is_ready(),
            "Emergency_Off": status.contains(StationStatus::EMERGENCY_OFF),
            "Emergency_Stop": status.contains(StationStatus::EMERGENCY_STOP),
            "Auto_Start": status.contains(StationStatus::AUTO_START),
            "Service_Mode": status.contains(StationStatus::SERVICE_MODE),
            "Powering_Up": status.contains(StationStatus::POWERING_UP),
            "RAM_Check_Error": status.contains(StationStatus::RAM_CHECK_ERROR),
        }),
        debug,
    )
}

pub fn identification(version: u8, debug: Option<&str>) -> Value {
    envelope(
        200,
        "controller",
        None,
        json!({
            "Make": "Hornby",
            "Model": "Elite",
            "Version": format!("{:.2}", f64::from(version) / 100.0),
        }),
        debug,
    )
}

/// Envelope for the fixed broadcast frames (power off, emergency, acks,
/// station-side errors).
pub fn simple(status_code: u16, message: &str, debug: Option<&str>) -> Value {
    envelope(status_code, message, None, json!({}), debug)
}

pub fn unknown_data(raw: &[u8]) -> Value {
    let hex = to_hex(raw);
    envelope(520, &format!("Unknown data: {hex}"), None, json!({}), Some(&hex))
}

pub fn socket_status(clients: usize, controller_connected: bool) -> Value {
    envelope(
        200,
        "SocketStatus",
        None,
        json!({
            "Ready": true,
            "Clients": clients,
            "Controller_Connected": controller_connected,
        }),
        None,
    )
}

/// Accessory state echo; fields ride at the top level, matching what the
/// clients already parse.
pub fn accessory_state(id: &Value, state: &Value) -> Value {
    json!({
        "message": "accessoryState",
        "status_code": 200,
        "accessory_id": id,
        "state": state,
    })
}

pub fn accessory_states(states: &Map<String, Value>) -> Value {
    json!({
        "message": "accessoryStates",
        "status_code": 200,
        "accessories": states,
    })
}

pub fn controller_status(online: bool) -> Value {
    json!({
        "type": "controller_status",
        "status": if online { "online" } else { "offline" },
    })
}

/// Rejection for a malformed or out-of-range request; sent to the
/// originating subscriber only.
pub fn bad_request(message: &str) -> Value {
    envelope(400, message, None, json!({}), None)
}

/// Notice that a state request expired before the reply pair completed.
pub fn state_timeout(addr: LocoAddress) -> Value {
    envelope(
        504,
        "Loco state request timed out",
        Some("getState"),
        json!({ "train_number": addr.value() }),
        None,
    )
}
