//! `skybridge-relay` – the ground-station side of the relay bridge.
//!
//! [`RelayTransportClient`] keeps a WebSocket session open to the ground
//! station, replays whatever queued up while it was away, answers inbound
//! requests, forwards commands to a [`CommandDispatcher`], and ships
//! rate-limited samples and change-log batches.
//!
//! # Modules
//!
//! - [`client`] – [`RelayTransportClient`], [`RelayHandle`], [`RelayConfig`].
//! - [`sampler`] – [`RateSampler`], per-field rate-limited sampling.
//! - [`changelog`] – drain pacing and the overflow diagnostic.
//!
//! [`CommandDispatcher`]: skybridge_types::CommandDispatcher

pub mod changelog;
pub mod client;
pub mod sampler;

pub use changelog::{DrainPacer, OverflowGuard};
pub use client::{Outbox, RelayConfig, RelayHandle, RelayTransportClient, relay_channel};
pub use sampler::{RateChange, RateSampler};
