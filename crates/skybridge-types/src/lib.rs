//! `skybridge-types` – shared data model of the telemetry/command relay.
//!
//! Both halves of the bridge – the flight-controller link (producer) and
//! the relay transport client (consumer) – speak in terms of the types
//! defined here, so neither crate needs to depend on the other.
//!
//! # Modules
//!
//! - [`value`] – [`FieldValue`], the scalar/nested value stored per field.
//! - [`state`] – the shared [`StateTable`] (single writer) and its
//!   read-only [`StateView`].
//! - [`changelog`] – [`ChangeEvent`] and the unbounded change-log queue.
//! - [`wire`] – the `{type, msg}` envelopes exchanged with the ground
//!   station.
//! - [`symbols`] – versioned lookup tables for symbolic command names,
//!   result codes and parameter constants.
//! - [`logs`] – log identifiers and helpers for the `log` callback.

pub mod changelog;
pub mod logs;
pub mod state;
pub mod symbols;
pub mod value;
pub mod wire;

use async_trait::async_trait;
use thiserror::Error;

pub use changelog::{ChangeEvent, ChangeLogReader, ChangeLogWriter, change_log};
pub use logs::LogVariables;
pub use state::{FieldChange, StateTable, StateView};
pub use value::FieldValue;
pub use wire::{
    CommandId, CommandParam, CommandRequest, CommandResponse, InboundError, InboundMessage,
    LogRecord, OutboundMessage, RateRequest, TelemetryFrame,
};

/// Error type shared by every skybridge crate.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error("COMMAND_ACK timeout for command {command}")]
    CommandTimeout { command: u16 },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Autopilot device error: {0}")]
    Device(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Autopilot link is closed")]
    LinkClosed,
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Serialization(e.to_string())
    }
}

/// Side-effecting callbacks the flight-controller link reports through.
///
/// The composition root supplies one implementation (normally the relay
/// client's handle). Neither method returns anything the caller consumes,
/// and neither may block.
pub trait RelaySink: Send + Sync {
    /// Report a protocol-level log event.
    fn log(&self, log_id: &str, variables: LogVariables);

    /// Hand a message to the uplink for delivery to the ground station.
    fn deliver(&self, message: OutboundMessage);
}

/// Anything that can execute an autopilot command and report its
/// acknowledgment status.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    /// Dispatch `request` and wait for its acknowledgment.
    ///
    /// Returns the symbolic result name (e.g. `"MAV_RESULT_ACCEPTED"`).
    async fn send_command(&self, request: CommandRequest) -> Result<String, BridgeError>;
}
