//! Device and transport seams between the link logic and the wire.
//!
//! ```text
//! FlightControllerLink ──open()──▶ AutopilotDevice
//!          │                            │
//!          │ send()/close()             │ spawns an I/O worker
//!          ▼                            ▼
//!   AutopilotTransport        mpsc::UnboundedReceiver<AutopilotFrame>
//! ```
//!
//! The production implementation is [`crate::mavlink_device::MavlinkDevice`].
//! Tests drive the link through a scripted device instead.

use std::sync::Arc;

use skybridge_types::BridgeError;
use tokio::sync::mpsc;

use crate::frame::{AutopilotFrame, OutboundFrame};

/// Write half of an open autopilot session.
pub trait AutopilotTransport: Send + Sync {
    /// Encode and write one frame.
    fn send(&self, frame: &OutboundFrame) -> Result<(), BridgeError>;

    /// Release the underlying device. Idempotent.
    fn close(&self) -> Result<(), BridgeError>;
}

/// An open session: the write half plus the decoded inbound frame stream.
///
/// The stream ends when the device's I/O worker stops.
pub struct AutopilotSession {
    pub transport: Arc<dyn AutopilotTransport>,
    pub frames: mpsc::UnboundedReceiver<AutopilotFrame>,
}

/// Something that can be probed for presence and opened.
pub trait AutopilotDevice: Send + Sync {
    /// Human-readable device address for diagnostics.
    fn describe(&self) -> String;

    /// Cheap presence probe; must not block.
    fn is_present(&self) -> bool;

    /// Open the device. May block; callers run it on a blocking worker.
    fn open(&self) -> Result<AutopilotSession, BridgeError>;
}
