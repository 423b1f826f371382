//! Versioned lookup tables for symbolic protocol names.
//!
//! Ground-station users address commands and parameters by their MAVLink
//! names (`"MAV_CMD_COMPONENT_ARM_DISARM"`, `"MAV_FRAME_GLOBAL"`). Rather
//! than resolving names against a protocol library's runtime symbol table,
//! the bridge owns the subset it supports here. Bump
//! [`SYMBOL_TABLE_VERSION`] whenever an entry changes.

use crate::BridgeError;
use crate::wire::{CommandId, CommandParam};

/// Version tag of the tables below.
pub const SYMBOL_TABLE_VERSION: &str = "mavlink-common/2";

/// `MAV_CMD` names and their numeric ids.
pub const COMMANDS: &[(&str, u16)] = &[
    ("MAV_CMD_NAV_WAYPOINT", 16),
    ("MAV_CMD_NAV_LOITER_UNLIM", 17),
    ("MAV_CMD_NAV_LOITER_TURNS", 18),
    ("MAV_CMD_NAV_LOITER_TIME", 19),
    ("MAV_CMD_NAV_RETURN_TO_LAUNCH", 20),
    ("MAV_CMD_NAV_LAND", 21),
    ("MAV_CMD_NAV_TAKEOFF", 22),
    ("MAV_CMD_CONDITION_DELAY", 112),
    ("MAV_CMD_CONDITION_YAW", 115),
    ("MAV_CMD_DO_SET_MODE", 176),
    ("MAV_CMD_DO_JUMP", 177),
    ("MAV_CMD_DO_CHANGE_SPEED", 178),
    ("MAV_CMD_DO_SET_HOME", 179),
    ("MAV_CMD_DO_SET_SERVO", 183),
    ("MAV_CMD_DO_REPEAT_SERVO", 184),
    ("MAV_CMD_DO_FLIGHTTERMINATION", 185),
    ("MAV_CMD_DO_CHANGE_ALTITUDE", 186),
    ("MAV_CMD_DO_LAND_START", 189),
    ("MAV_CMD_DO_REPOSITION", 192),
    ("MAV_CMD_DO_PAUSE_CONTINUE", 193),
    ("MAV_CMD_DO_SET_ROI_LOCATION", 195),
    ("MAV_CMD_DO_PARACHUTE", 208),
    ("MAV_CMD_DO_MOTOR_TEST", 209),
    ("MAV_CMD_PREFLIGHT_CALIBRATION", 241),
    ("MAV_CMD_PREFLIGHT_REBOOT_SHUTDOWN", 246),
    ("MAV_CMD_MISSION_START", 300),
    ("MAV_CMD_COMPONENT_ARM_DISARM", 400),
    ("MAV_CMD_GET_HOME_POSITION", 410),
    ("MAV_CMD_SET_MESSAGE_INTERVAL", 511),
    ("MAV_CMD_REQUEST_MESSAGE", 512),
    ("MAV_CMD_REQUEST_AUTOPILOT_CAPABILITIES", 520),
];

/// `MAV_RESULT` codes, indexed by value.
pub const RESULTS: &[&str] = &[
    "MAV_RESULT_ACCEPTED",
    "MAV_RESULT_TEMPORARILY_REJECTED",
    "MAV_RESULT_DENIED",
    "MAV_RESULT_UNSUPPORTED",
    "MAV_RESULT_FAILED",
    "MAV_RESULT_IN_PROGRESS",
    "MAV_RESULT_CANCELLED",
];

/// Other named constants accepted as command parameters.
pub const CONSTANTS: &[(&str, f32)] = &[
    ("MAV_FRAME_GLOBAL", 0.0),
    ("MAV_FRAME_LOCAL_NED", 1.0),
    ("MAV_FRAME_MISSION", 2.0),
    ("MAV_FRAME_GLOBAL_RELATIVE_ALT", 3.0),
    ("MAV_FRAME_LOCAL_ENU", 4.0),
    ("MAV_FRAME_GLOBAL_TERRAIN_ALT", 10.0),
    ("MAV_MODE_FLAG_CUSTOM_MODE_ENABLED", 1.0),
    ("MAV_MODE_FLAG_TEST_ENABLED", 2.0),
    ("MAV_MODE_FLAG_AUTO_ENABLED", 4.0),
    ("MAV_MODE_FLAG_GUIDED_ENABLED", 8.0),
    ("MAV_MODE_FLAG_STABILIZE_ENABLED", 16.0),
    ("MAV_MODE_FLAG_HIL_ENABLED", 32.0),
    ("MAV_MODE_FLAG_MANUAL_INPUT_ENABLED", 64.0),
    ("MAV_MODE_FLAG_SAFETY_ARMED", 128.0),
    ("MAV_DATA_STREAM_ALL", 0.0),
    ("MAV_DATA_STREAM_RAW_SENSORS", 1.0),
    ("MAV_DATA_STREAM_EXTENDED_STATUS", 2.0),
    ("MAV_DATA_STREAM_RC_CHANNELS", 3.0),
    ("MAV_DATA_STREAM_RAW_CONTROLLER", 4.0),
    ("MAV_DATA_STREAM_POSITION", 6.0),
    ("MAV_DATA_STREAM_EXTRA1", 10.0),
    ("MAV_DATA_STREAM_EXTRA2", 11.0),
    ("MAV_DATA_STREAM_EXTRA3", 12.0),
];

/// Numeric id of a `MAV_CMD_*` name.
pub fn command_id(name: &str) -> Option<u16> {
    COMMANDS.iter().find(|(n, _)| *n == name).map(|(_, id)| *id)
}

/// `MAV_CMD_*` name of a numeric id, if the table knows it.
pub fn command_name(id: u16) -> Option<&'static str> {
    COMMANDS.iter().find(|(_, i)| *i == id).map(|(n, _)| *n)
}

/// Symbolic name of a `MAV_RESULT` code, or its decimal form when unknown.
pub fn result_name(code: u8) -> String {
    RESULTS
        .get(usize::from(code))
        .map(|s| s.to_string())
        .unwrap_or_else(|| code.to_string())
}

/// Numeric value of any symbolic constant usable as a parameter.
pub fn constant(name: &str) -> Option<f32> {
    CONSTANTS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, v)| *v)
        .or_else(|| command_id(name).map(f32::from))
}

/// Resolve a command id given either numerically or by name.
pub fn resolve_command(command: &CommandId) -> Result<u16, BridgeError> {
    match command {
        CommandId::Numeric(id) => Ok(*id),
        CommandId::Symbolic(name) => command_id(name)
            .or_else(|| name.trim().parse::<u16>().ok())
            .ok_or_else(|| BridgeError::UnknownCommand(name.clone())),
    }
}

/// Resolve one command parameter: numbers pass through, names are looked
/// up, and numeric strings are parsed.
pub fn resolve_param(param: &CommandParam) -> Result<f32, BridgeError> {
    match param {
        CommandParam::Number(v) => Ok(*v as f32),
        CommandParam::Symbol(name) => constant(name)
            .or_else(|| name.trim().parse::<f32>().ok())
            .ok_or_else(|| BridgeError::InvalidParameter(name.clone())),
    }
}

/// Resolve and zero-pad `params` to exactly seven values.
///
/// Extra parameters beyond the seventh are ignored.
pub fn resolve_params(params: &[CommandParam]) -> Result<[f32; 7], BridgeError> {
    let mut out = [0.0_f32; 7];
    for (slot, param) in out.iter_mut().zip(params) {
        *slot = resolve_param(param)?;
    }
    Ok(out)
}
