//! MAVLink implementation of [`AutopilotDevice`] on top of the `mavlink`
//! crate.
//!
//! # Addressing
//!
//! | Configured device          | Opened as                          |
//! |----------------------------|------------------------------------|
//! | `/dev/ttyACM0`             | `serial:/dev/ttyACM0:<baud>`       |
//! | `serial:/dev/ttyUSB0:57600`| as given                           |
//! | `udpin:0.0.0.0:14550`      | as given (SITL, telemetry radios)  |
//! | `tcpout:127.0.0.1:5760`    | as given                           |
//!
//! Presence is probed on the filesystem for serial paths; network
//! addresses always report present.
//!
//! # Threading
//!
//! `mavlink` connections block on read, so each session spawns one named
//! OS thread that decodes frames and pushes them into an unbounded tokio
//! channel. Writes go straight to the shared connection from the caller.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use mavlink::ardupilotmega::{
    COMMAND_LONG_DATA, HEARTBEAT_DATA, MavAutopilot, MavCmd, MavMessage, MavModeFlag, MavState,
    MavType, PARAM_REQUEST_LIST_DATA, REQUEST_DATA_STREAM_DATA,
};
use mavlink::error::MessageReadError;
use mavlink::{MavConnection, MavHeader, Message};
use num_traits::FromPrimitive;
use skybridge_types::{BridgeError, FieldValue, TelemetryFrame};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::frame::{AutopilotFrame, OutboundFrame};
use crate::transport::{AutopilotDevice, AutopilotSession, AutopilotTransport};

/// `MAV_COMP_ID_ONBOARD_COMPUTER`.
const ONBOARD_COMPUTER_COMPONENT: u8 = 191;

const ADDRESS_SCHEMES: &[&str] = &[
    "serial:", "tcpin:", "tcpout:", "udpin:", "udpout:", "udpbcast:", "file:",
];

type Connection = Arc<dyn MavConnection<MavMessage> + Send + Sync>;

// ────────────────────────────────────────────────────────────────────────────
// MavlinkDevice
// ────────────────────────────────────────────────────────────────────────────

/// An autopilot reachable through a serial port or a MAVLink network
/// endpoint.
#[derive(Debug, Clone)]
pub struct MavlinkDevice {
    device: String,
    baud: u32,
    source_system: u8,
}

impl MavlinkDevice {
    pub fn new(device: impl Into<String>, baud: u32) -> Self {
        Self {
            device: device.into(),
            baud,
            source_system: 255,
        }
    }

    /// System id stamped on every frame the bridge sends.
    pub fn with_source_system(mut self, source_system: u8) -> Self {
        self.source_system = source_system;
        self
    }

    /// Address in `mavlink::connect` syntax.
    pub fn connection_address(&self) -> String {
        if self.has_scheme() {
            self.device.clone()
        } else {
            format!("serial:{}:{}", self.device, self.baud)
        }
    }

    /// Filesystem path of the serial port, if this is a serial device.
    fn serial_path(&self) -> Option<&str> {
        if let Some(rest) = self.device.strip_prefix("serial:") {
            return Some(rest.rsplit_once(':').map_or(rest, |(path, _)| path));
        }
        (!self.has_scheme()).then_some(self.device.as_str())
    }

    fn has_scheme(&self) -> bool {
        ADDRESS_SCHEMES.iter().any(|s| self.device.starts_with(s))
    }
}

impl AutopilotDevice for MavlinkDevice {
    fn describe(&self) -> String {
        self.connection_address()
    }

    fn is_present(&self) -> bool {
        self.serial_path().is_none_or(|path| Path::new(path).exists())
    }

    fn open(&self) -> Result<AutopilotSession, BridgeError> {
        let address = self.connection_address();
        let connection: Connection = Arc::from(
            mavlink::connect::<MavMessage>(&address)
                .map_err(|e| BridgeError::Device(format!("{address}: {e}")))?,
        );

        let link = Arc::new(SharedLink {
            connection,
            closed: AtomicBool::new(false),
            sequence: AtomicU8::new(0),
            target_system: AtomicU8::new(0),
            target_component: AtomicU8::new(0),
            source_system: self.source_system,
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let reader = Arc::clone(&link);
        std::thread::Builder::new()
            .name("mavlink-reader".to_string())
            .spawn(move || reader.read_loop(tx))
            .map_err(|e| BridgeError::Device(format!("spawning reader: {e}")))?;

        info!(address = %address, "MAVLink session opened");
        Ok(AutopilotSession {
            transport: Arc::new(MavlinkTransport { link }),
            frames: rx,
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Session internals
// ────────────────────────────────────────────────────────────────────────────

struct SharedLink {
    connection: Connection,
    closed: AtomicBool,
    sequence: AtomicU8,
    target_system: AtomicU8,
    target_component: AtomicU8,
    source_system: u8,
}

impl SharedLink {
    fn read_loop(&self, tx: mpsc::UnboundedSender<AutopilotFrame>) {
        while !self.closed.load(Ordering::Relaxed) {
            match self.connection.recv() {
                Ok((header, message)) => {
                    if let MavMessage::HEARTBEAT(hb) = &message {
                        if hb.mavtype == MavType::MAV_TYPE_GCS {
                            continue;
                        }
                        self.learn_target(header.system_id, header.component_id);
                    }
                    let Some(frame) = decode(&header, &message) else {
                        continue;
                    };
                    if tx.send(frame).is_err() {
                        break;
                    }
                }
                Err(MessageReadError::Io(e))
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::Interrupted
                    ) => {}
                Err(MessageReadError::Io(e)) => {
                    warn!(error = %e, "MAVLink read failed; reader stopping");
                    break;
                }
                Err(e) => debug!(error = %e, "Dropping undecodable MAVLink frame"),
            }
        }
        debug!("MAVLink reader exited");
    }

    fn learn_target(&self, system_id: u8, component_id: u8) {
        if self.target_system.load(Ordering::Relaxed) == 0 {
            self.target_system.store(system_id, Ordering::Relaxed);
            self.target_component.store(component_id, Ordering::Relaxed);
        }
    }

    fn header(&self) -> MavHeader {
        MavHeader {
            system_id: self.source_system,
            component_id: ONBOARD_COMPUTER_COMPONENT,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        }
    }
}

struct MavlinkTransport {
    link: Arc<SharedLink>,
}

impl AutopilotTransport for MavlinkTransport {
    fn send(&self, frame: &OutboundFrame) -> Result<(), BridgeError> {
        if self.link.closed.load(Ordering::Relaxed) {
            return Err(BridgeError::LinkClosed);
        }
        let target = (
            self.link.target_system.load(Ordering::Relaxed),
            self.link.target_component.load(Ordering::Relaxed),
        );
        let message = encode(frame, target)?;
        self.link
            .connection
            .send(&self.link.header(), &message)
            .map(|_| ())
            .map_err(|e| BridgeError::Transport(e.to_string()))
    }

    fn close(&self) -> Result<(), BridgeError> {
        // The reader owns the last handle; the port is released once it
        // observes the flag after its current read returns.
        self.link.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Codec
// ────────────────────────────────────────────────────────────────────────────

/// Translate a decoded MAVLink message into an [`AutopilotFrame`].
pub(crate) fn decode(header: &MavHeader, message: &MavMessage) -> Option<AutopilotFrame> {
    let frame = match message {
        MavMessage::HEARTBEAT(_) => AutopilotFrame::Heartbeat {
            system_id: header.system_id,
            component_id: header.component_id,
        },
        MavMessage::COMMAND_ACK(ack) => AutopilotFrame::CommandAck {
            command: ack.command as u16,
            result: ack.result as u8,
        },
        MavMessage::PARAM_VALUE(p) => AutopilotFrame::ParamValue {
            name: fixed_str(&p.param_id),
            index: p.param_index,
            count: p.param_count,
            value: p.param_value,
        },
        MavMessage::STATUSTEXT(s) => AutopilotFrame::StatusText {
            severity: s.severity as u8,
            text: fixed_str(&s.text),
        },
        MavMessage::TIMESYNC(t) => AutopilotFrame::TimeSync {
            tc1: t.tc1,
            ts1: t.ts1,
        },
        other => AutopilotFrame::Telemetry(telemetry_frame(other)?),
    };
    Some(frame)
}

/// `(message, field)` pairs whose `u8` arrays are opaque payload, not
/// numbers. These are relayed as [`FieldValue::Bytes`].
const BINARY_FIELDS: &[(&str, &str)] = &[
    ("AUTOPILOT_VERSION", "flight_custom_version"),
    ("AUTOPILOT_VERSION", "middleware_custom_version"),
    ("AUTOPILOT_VERSION", "os_custom_version"),
    ("AUTOPILOT_VERSION", "uid2"),
    ("ENCAPSULATED_DATA", "data"),
    ("FILE_TRANSFER_PROTOCOL", "payload"),
    ("GPS_INJECT_DATA", "data"),
    ("GPS_RTCM_DATA", "data"),
    ("LOGGING_DATA", "data"),
    ("LOG_DATA", "data"),
    ("SERIAL_CONTROL", "data"),
    ("V2_EXTENSION", "payload"),
];

/// Flatten any message into a category plus its named fields.
fn telemetry_frame(message: &MavMessage) -> Option<TelemetryFrame> {
    let serde_json::Value::Object(mut object) = serde_json::to_value(message).ok()? else {
        return None;
    };
    object.remove("type");
    let category = message.message_name();
    let fields: BTreeMap<String, FieldValue> = object
        .into_iter()
        .map(|(k, v)| {
            let value = FieldValue::from(v);
            let value = if BINARY_FIELDS.contains(&(category, k.as_str())) {
                byte_list(&value).map_or(value, FieldValue::Bytes)
            } else {
                value
            };
            (k, value)
        })
        .collect();
    Some(TelemetryFrame {
        category: category.to_string(),
        fields,
    })
}

/// A list of integers that all fit in a byte.
fn byte_list(value: &FieldValue) -> Option<Vec<u8>> {
    let FieldValue::List(items) = value else {
        return None;
    };
    items
        .iter()
        .map(|item| match item {
            FieldValue::Int(i) => u8::try_from(*i).ok(),
            _ => None,
        })
        .collect()
}

/// Build the MAVLink message for an outbound frame.
pub(crate) fn encode(frame: &OutboundFrame, target: (u8, u8)) -> Result<MavMessage, BridgeError> {
    let (target_system, target_component) = target;
    let message = match frame {
        OutboundFrame::Heartbeat => MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_ONBOARD_CONTROLLER,
            autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
            base_mode: MavModeFlag::empty(),
            system_status: MavState::MAV_STATE_UNINIT,
            mavlink_version: 3,
        }),
        OutboundFrame::CommandLong { command, params } => {
            let command = MavCmd::from_u16(*command)
                .ok_or_else(|| BridgeError::UnknownCommand(command.to_string()))?;
            MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
                param1: params[0],
                param2: params[1],
                param3: params[2],
                param4: params[3],
                param5: params[4],
                param6: params[5],
                param7: params[6],
                command,
                target_system,
                target_component,
                confirmation: 0,
            })
        }
        OutboundFrame::ParamRequestList => {
            MavMessage::PARAM_REQUEST_LIST(PARAM_REQUEST_LIST_DATA {
                target_system,
                target_component,
            })
        }
        OutboundFrame::RequestDataStream { stream, rate_hz } => {
            MavMessage::REQUEST_DATA_STREAM(REQUEST_DATA_STREAM_DATA {
                req_message_rate: *rate_hz,
                target_system,
                target_component,
                req_stream_id: stream.id(),
                start_stop: 1,
            })
        }
    };
    Ok(message)
}

/// NUL-terminated fixed-width field to `String`.
fn fixed_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
