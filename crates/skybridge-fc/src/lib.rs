//! `skybridge-fc` – the flight-controller side of the relay bridge.
//!
//! [`FlightControllerLink`] owns the MAVLink session with the onboard
//! autopilot: it waits for the device, supervises liveness, dispatches
//! commands and matches their acknowledgements, downloads parameters, and
//! folds decoded telemetry into the shared [`StateTable`] while feeding the
//! change-log queue.
//!
//! # Modules
//!
//! - [`link`] – [`FlightControllerLink`], [`LinkConfig`], [`LinkStatus`].
//! - [`transport`] – the [`AutopilotDevice`]/[`AutopilotTransport`] seams.
//! - [`mavlink_device`] – [`MavlinkDevice`], the production device.
//! - [`frame`] – decoded inbound frames and outbound frame requests.
//! - [`liveness`] – [`BeaconMonitor`] and the [`LinkHealth`] state machine.
//! - [`pending`] – acknowledgement waiters keyed by command id.
//! - [`params`] – parameter download session and permanent store.
//!
//! [`StateTable`]: skybridge_types::StateTable

pub mod frame;
pub mod link;
pub mod liveness;
pub mod mavlink_device;
pub mod params;
pub mod pending;
pub mod transport;

pub use frame::{AutopilotFrame, DataStream, OutboundFrame};
pub use link::{FlightControllerLink, LinkConfig, LinkStatus};
pub use liveness::{BeaconMonitor, LinkHealth};
pub use mavlink_device::MavlinkDevice;
pub use transport::{AutopilotDevice, AutopilotSession, AutopilotTransport};
