//! Decoded autopilot frames and the outbound frames the link emits.
//!
//! These types are protocol-library agnostic: the MAVLink transport
//! translates to and from them, and the link logic only ever sees these.

use skybridge_types::TelemetryFrame;

/// Frame categories the link folds into the state table.
///
/// Anything else that decodes is reported as unhandled.
pub const TELEMETRY_CATEGORIES: &[&str] = &[
    "AHRS",
    "ATTITUDE",
    "GLOBAL_POSITION_INT",
    "VFR_HUD",
    "SYS_STATUS",
    "POWER_STATUS",
    "MEMINFO",
    "MISSION_CURRENT",
    "SERVO_OUTPUT_RAW",
    "RC_CHANNELS",
    "RAW_IMU",
    "SCALED_IMU2",
    "SCALED_IMU3",
    "SCALED_PRESSURE",
    "SCALED_PRESSURE2",
    "GPS_RAW_INT",
    "SYSTEM_TIME",
    "WIND",
    "TERRAIN_REPORT",
    "EKF_STATUS_REPORT",
    "VIBRATION",
    "BATTERY_STATUS",
    "AOA_SSA",
    "MCU_STATUS",
    "UNKNOWN_295",
    "POSITION_TARGET_GLOBAL_INT",
    "NAV_CONTROLLER_OUTPUT",
    "EXTENDED_SYS_STATE",
];

/// Fields that change on every frame and never produce change events.
pub const NOISE_FIELDS: &[&str] = &["mavpackettype", "time_boot_ms", "time_usec"];

/// `param_index` value the autopilot uses for dynamically generated
/// parameters that are not part of the enumerated set.
pub const DYNAMIC_PARAM_INDEX: u16 = 0xFFFF;

/// Whether frames of `category` feed the state table.
pub fn is_telemetry_category(category: &str) -> bool {
    TELEMETRY_CATEGORIES.contains(&category)
}

/// A frame received from the autopilot.
#[derive(Debug, Clone, PartialEq)]
pub enum AutopilotFrame {
    Heartbeat {
        system_id: u8,
        component_id: u8,
    },
    CommandAck {
        command: u16,
        result: u8,
    },
    ParamValue {
        name: String,
        index: u16,
        count: u16,
        value: f32,
    },
    StatusText {
        severity: u8,
        text: String,
    },
    TimeSync {
        tc1: i64,
        ts1: i64,
    },
    /// Any other decodable frame, flattened to its fields.
    Telemetry(TelemetryFrame),
}

impl AutopilotFrame {
    /// Message name of the frame, as the autopilot protocol spells it.
    pub fn category(&self) -> &str {
        match self {
            AutopilotFrame::Heartbeat { .. } => "HEARTBEAT",
            AutopilotFrame::CommandAck { .. } => "COMMAND_ACK",
            AutopilotFrame::ParamValue { .. } => "PARAM_VALUE",
            AutopilotFrame::StatusText { .. } => "STATUSTEXT",
            AutopilotFrame::TimeSync { .. } => "TIMESYNC",
            AutopilotFrame::Telemetry(frame) => &frame.category,
        }
    }
}

/// Periodic data-stream groups the autopilot can be asked to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataStream {
    RawSensors,
    ExtendedStatus,
    RcChannels,
    RawController,
    Position,
    Extra1,
    Extra2,
    Extra3,
}

impl DataStream {
    /// Every stream the link keeps alive.
    pub const ALL: [DataStream; 8] = [
        DataStream::RawSensors,
        DataStream::ExtendedStatus,
        DataStream::RcChannels,
        DataStream::RawController,
        DataStream::Position,
        DataStream::Extra1,
        DataStream::Extra2,
        DataStream::Extra3,
    ];

    /// `MAV_DATA_STREAM` id.
    pub fn id(self) -> u8 {
        match self {
            DataStream::RawSensors => 1,
            DataStream::ExtendedStatus => 2,
            DataStream::RcChannels => 3,
            DataStream::RawController => 4,
            DataStream::Position => 6,
            DataStream::Extra1 => 10,
            DataStream::Extra2 => 11,
            DataStream::Extra3 => 12,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DataStream::RawSensors => "MAV_DATA_STREAM_RAW_SENSORS",
            DataStream::ExtendedStatus => "MAV_DATA_STREAM_EXTENDED_STATUS",
            DataStream::RcChannels => "MAV_DATA_STREAM_RC_CHANNELS",
            DataStream::RawController => "MAV_DATA_STREAM_RAW_CONTROLLER",
            DataStream::Position => "MAV_DATA_STREAM_POSITION",
            DataStream::Extra1 => "MAV_DATA_STREAM_EXTRA1",
            DataStream::Extra2 => "MAV_DATA_STREAM_EXTRA2",
            DataStream::Extra3 => "MAV_DATA_STREAM_EXTRA3",
        }
    }
}

/// A frame the link asks the transport to send.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// The bridge's own liveness beacon.
    Heartbeat,
    CommandLong { command: u16, params: [f32; 7] },
    ParamRequestList,
    RequestDataStream { stream: DataStream, rate_hz: u16 },
}
