//! Wire envelopes exchanged with the ground station.
//!
//! Every message is a JSON object `{"type": <string>, "msg": <object>}`,
//! except the reserved `Log` variant which carries its fields at the top
//! level:
//!
//! ```json
//! {"type": "Log", "log_id": "PX0002", "timestamp": 1700000000000000000, "variables": {"SysID": "1"}}
//! ```
//!
//! Inbound traffic is validated at the boundary into the closed
//! [`InboundMessage`] set; anything else becomes an [`InboundError`] that the
//! caller logs and drops. Outbound traffic is built as an
//! [`OutboundMessage`] and serialised through its `Serialize` impl, which
//! hex-encodes binary fields on the way out.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::BridgeError;
use crate::changelog::ChangeEvent;
use crate::logs::LogVariables;
use crate::value::FieldValue;

// ─────────────────────────────────────────────────────────────────────────────
// Payload types
// ─────────────────────────────────────────────────────────────────────────────

/// Command identifier as supplied by the ground station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandId {
    Numeric(u16),
    /// A `MAV_CMD_*` name (or a numeric string).
    Symbolic(String),
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandId::Numeric(id) => write!(f, "{id}"),
            CommandId::Symbolic(name) => f.write_str(name),
        }
    }
}

/// One command parameter: a number or a symbolic constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandParam {
    Number(f64),
    Symbol(String),
}

/// Body of an inbound `command` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: CommandId,
    #[serde(default)]
    pub params: Vec<CommandParam>,
    /// Acknowledgment timeout in seconds; the link's default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

impl CommandRequest {
    pub fn new(command: CommandId, params: Vec<CommandParam>) -> Self {
        Self {
            command,
            params,
            timeout: None,
        }
    }
}

/// Body of an inbound `rate_request` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateRequest {
    pub category: String,
    pub field: String,
    /// Requested frequency in Hz; `<= 0` disables the subscription.
    #[serde(deserialize_with = "number_or_numeric_string")]
    pub rate: f64,
}

/// A protocol-level log event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub log_id: String,
    /// Unix time in nanoseconds.
    pub timestamp: i64,
    #[serde(default, deserialize_with = "lenient_variables")]
    pub variables: LogVariables,
}

impl LogRecord {
    /// Stamp a new record with the current wall-clock time.
    pub fn new(log_id: impl Into<String>, variables: LogVariables) -> Self {
        Self {
            log_id: log_id.into(),
            timestamp: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            variables,
        }
    }
}

/// One decoded autopilot frame relayed verbatim.
///
/// Serialises as the frame's fields plus `"mavpackettype": <category>`.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryFrame {
    pub category: String,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Serialize for TelemetryFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len() + 1))?;
        map.serialize_entry("mavpackettype", &self.category)?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Outcome of a forwarded command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────────────────

/// Closed set of messages the relay accepts from the ground station.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Liveness probe; the body is echoed back in a `pong`.
    Ping(Value),
    RateRequest(RateRequest),
    /// Request for a diagnostic state dump. The body is ignored.
    TelemetryUpdate,
    Command(CommandRequest),
    Log(LogRecord),
}

/// Why an inbound frame was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InboundError {
    #[error("malformed message: {reason}")]
    Malformed { reason: String },

    #[error("unrecognised message type {kind:?}")]
    UnknownType { kind: String, body: Value },
}

fn malformed(reason: impl std::fmt::Display) -> InboundError {
    InboundError::Malformed {
        reason: reason.to_string(),
    }
}

impl InboundMessage {
    /// Validate one text frame from the ground station.
    pub fn parse(text: &str) -> Result<Self, InboundError> {
        let value: Value = serde_json::from_str(text).map_err(malformed)?;
        let Value::Object(mut object) = value else {
            return Err(malformed("expected a JSON object"));
        };
        let kind = match object.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ => return Err(malformed("missing string field \"type\"")),
        };

        if kind == "Log" {
            let record = serde_json::from_value(Value::Object(object)).map_err(malformed)?;
            return Ok(InboundMessage::Log(record));
        }

        let body = object
            .remove("msg")
            .ok_or_else(|| malformed("missing field \"msg\""))?;

        match kind.as_str() {
            "ping" => Ok(InboundMessage::Ping(body)),
            "rate_request" => serde_json::from_value(body)
                .map(InboundMessage::RateRequest)
                .map_err(malformed),
            "telemetry_update" => Ok(InboundMessage::TelemetryUpdate),
            "command" => serde_json::from_value(body)
                .map(InboundMessage::Command)
                .map_err(malformed),
            _ => Err(InboundError::UnknownType { kind, body }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────────────────

/// Closed set of messages the relay sends to the ground station.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Pong(Value),
    /// Rate-limited samples keyed `"category.field"`.
    RequestedTelemetry(BTreeMap<String, FieldValue>),
    ChangelogBatch(Vec<ChangeEvent>),
    Log(LogRecord),
    /// Raw decoded frame relay.
    Telemetry(TelemetryFrame),
    /// Full parameter set after a bulk fetch.
    Params(BTreeMap<String, f32>),
    CommandResponse(CommandResponse),
}

impl OutboundMessage {
    /// Value of the envelope's `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Pong(_) => "pong",
            OutboundMessage::RequestedTelemetry(_) => "requested_telemetry",
            OutboundMessage::ChangelogBatch(_) => "changelog_batch",
            OutboundMessage::Log(_) => "Log",
            OutboundMessage::Telemetry(_) => "telemetry",
            OutboundMessage::Params(_) => "params",
            OutboundMessage::CommandResponse(_) => "command_response",
        }
    }

    /// Serialise to the JSON text sent over the wire.
    pub fn to_json(&self) -> Result<String, BridgeError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl Serialize for OutboundMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", self.kind())?;
        match self {
            OutboundMessage::Log(record) => {
                map.serialize_entry("log_id", &record.log_id)?;
                map.serialize_entry("timestamp", &record.timestamp)?;
                map.serialize_entry("variables", &record.variables)?;
            }
            OutboundMessage::Pong(body) => map.serialize_entry("msg", body)?,
            OutboundMessage::RequestedTelemetry(batch) => map.serialize_entry("msg", batch)?,
            OutboundMessage::ChangelogBatch(events) => map.serialize_entry("msg", events)?,
            OutboundMessage::Telemetry(frame) => map.serialize_entry("msg", frame)?,
            OutboundMessage::Params(params) => map.serialize_entry("msg", params)?,
            OutboundMessage::CommandResponse(resp) => map.serialize_entry("msg", resp)?,
        }
        map.end()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lenient field decoders
// ─────────────────────────────────────────────────────────────────────────────

fn number_or_numeric_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("rate out of range")),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| serde::de::Error::custom(format!("invalid rate {s:?}: {e}"))),
        other => Err(serde::de::Error::custom(format!("invalid rate {other}"))),
    }
}

fn lenient_variables<'de, D: Deserializer<'de>>(deserializer: D) -> Result<LogVariables, D::Error> {
    let raw = Option::<BTreeMap<String, Value>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| match v {
            Value::String(s) => (k, s),
            other => (k, other.to_string()),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_ping() {
        let msg = InboundMessage::parse(r#"{"type":"ping","msg":{"seq":3}}"#).unwrap();
        assert_eq!(msg, InboundMessage::Ping(json!({"seq": 3})));
    }

    #[test]
    fn parses_rate_request_with_string_rate() {
        let msg = InboundMessage::parse(
            r#"{"type":"rate_request","msg":{"category":"GLOBAL_POSITION_INT","field":"lat","rate":"2"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            InboundMessage::RateRequest(RateRequest {
                category: "GLOBAL_POSITION_INT".to_string(),
                field: "lat".to_string(),
                rate: 2.0,
            })
        );
    }

    #[test]
    fn parses_command_with_mixed_params() {
        let msg = InboundMessage::parse(
            r#"{"type":"command","msg":{"command":"MAV_CMD_COMPONENT_ARM_DISARM","params":[1, "MAV_FRAME_GLOBAL"]}}"#,
        )
        .unwrap();
        let InboundMessage::Command(req) = msg else {
            panic!("expected a command");
        };
        assert_eq!(
            req.command,
            CommandId::Symbolic("MAV_CMD_COMPONENT_ARM_DISARM".to_string())
        );
        assert_eq!(
            req.params,
            vec![
                CommandParam::Number(1.0),
                CommandParam::Symbol("MAV_FRAME_GLOBAL".to_string())
            ]
        );
        assert_eq!(req.timeout, None);
    }

    #[test]
    fn parses_numeric_command_id() {
        let msg = InboundMessage::parse(r#"{"type":"command","msg":{"command":400}}"#).unwrap();
        let InboundMessage::Command(req) = msg else {
            panic!("expected a command");
        };
        assert_eq!(req.command, CommandId::Numeric(400));
        assert!(req.params.is_empty());
    }

    #[test]
    fn parses_top_level_log_with_non_string_variables() {
        let msg = InboundMessage::parse(
            r#"{"type":"Log","log_id":"GS0001","timestamp":12,"variables":{"n":3,"s":"x"}}"#,
        )
        .unwrap();
        let InboundMessage::Log(record) = msg else {
            panic!("expected a log");
        };
        assert_eq!(record.log_id, "GS0001");
        assert_eq!(record.variables["n"], "3");
        assert_eq!(record.variables["s"], "x");
    }

    #[test]
    fn telemetry_update_ignores_body() {
        let msg = InboundMessage::parse(r#"{"type":"telemetry_update","msg":{}}"#).unwrap();
        assert_eq!(msg, InboundMessage::TelemetryUpdate);
    }

    #[test]
    fn unknown_type_keeps_kind_and_body() {
        let err = InboundMessage::parse(r#"{"type":"warp_drive","msg":{"x":1}}"#).unwrap_err();
        assert_eq!(
            err,
            InboundError::UnknownType {
                kind: "warp_drive".to_string(),
                body: json!({"x": 1})
            }
        );
    }

    #[test]
    fn malformed_frames_are_rejected() {
        for text in [
            "not json",
            "[1,2,3]",
            r#"{"msg":{}}"#,
            r#"{"type":"ping"}"#,
            r#"{"type":"rate_request","msg":{"category":"A"}}"#,
            r#"{"type":"rate_request","msg":{"category":"A","field":"b","rate":"fast"}}"#,
        ] {
            assert!(
                matches!(InboundMessage::parse(text), Err(InboundError::Malformed { .. })),
                "expected malformed for {text}"
            );
        }
    }

    #[test]
    fn outbound_envelope_shapes() {
        let batch = OutboundMessage::RequestedTelemetry(BTreeMap::from([(
            "GLOBAL_POSITION_INT.lat".to_string(),
            FieldValue::Int(123),
        )]));
        assert_eq!(
            serde_json::to_value(&batch).unwrap(),
            json!({"type": "requested_telemetry", "msg": {"GLOBAL_POSITION_INT.lat": 123}})
        );

        let pong = OutboundMessage::Pong(json!({"seq": 1}));
        assert_eq!(
            serde_json::to_value(&pong).unwrap(),
            json!({"type": "pong", "msg": {"seq": 1}})
        );
    }

    #[test]
    fn log_is_flattened_at_top_level() {
        let record = LogRecord {
            log_id: "PX0002".to_string(),
            timestamp: 42,
            variables: BTreeMap::from([("SysID".to_string(), "1".to_string())]),
        };
        let json = serde_json::to_value(OutboundMessage::Log(record)).unwrap();
        assert_eq!(
            json,
            json!({"type": "Log", "log_id": "PX0002", "timestamp": 42, "variables": {"SysID": "1"}})
        );
    }

    #[test]
    fn raw_telemetry_carries_packet_type_and_hex_bytes() {
        let frame = TelemetryFrame {
            category: "MEMINFO".to_string(),
            fields: BTreeMap::from([
                ("freemem".to_string(), FieldValue::Int(2048)),
                ("blob".to_string(), FieldValue::Bytes(vec![0xff, 0x01])),
            ]),
        };
        let json = serde_json::to_value(OutboundMessage::Telemetry(frame)).unwrap();
        assert_eq!(
            json,
            json!({"type": "telemetry", "msg": {"mavpackettype": "MEMINFO", "freemem": 2048, "blob": "ff01"}})
        );
    }

    #[test]
    fn command_response_omits_absent_fields() {
        let resp = OutboundMessage::CommandResponse(CommandResponse {
            command: "MAV_CMD_COMPONENT_ARM_DISARM".to_string(),
            result: Some("MAV_RESULT_ACCEPTED".to_string()),
            error: None,
        });
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["msg"]["result"], "MAV_RESULT_ACCEPTED");
        assert!(json["msg"].get("error").is_none());
    }

    #[test]
    fn log_record_new_stamps_current_time() {
        let record = LogRecord::new("PX0004", LogVariables::new());
        assert!(record.timestamp > 0);
    }
}
