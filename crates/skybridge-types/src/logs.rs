//! Log identifiers and variable helpers for the protocol-level `log`
//! callback.
//!
//! Identifiers are opaque strings to the bridge; the ground station maps
//! them to human-readable templates. The two-letter prefix names the
//! subsystem (`PX` autopilot link, `NW` network uplink, `PH` autopilot
//! status text) and the third digit encodes the level (`2` = error).

use std::collections::BTreeMap;
use std::fmt::Display;

/// Variables attached to a log event.
pub type LogVariables = BTreeMap<String, String>;

/// Maximum length of the `message` context attached to error reports.
pub const MAX_CONTEXT_LEN: usize = 256;

// ─────────────────────────────────────────────────────────────────────────────
// Autopilot link
// ─────────────────────────────────────────────────────────────────────────────

pub const DEVICE_WAIT: &str = "PX0000";
pub const FIRST_BEACON: &str = "PX0002";
pub const PARAM_FETCH_DONE: &str = "PX0003";
pub const LINK_SHUTDOWN: &str = "PX0004";
pub const PARAM_FETCH_START: &str = "PX0005";
pub const RATE_UPDATED: &str = "PX0010";
pub const CLOCK_DRIFT: &str = "PX0011";
pub const LINK_OPENED: &str = "PX0101";
pub const RATE_CREATED: &str = "PX0102";
pub const COMMAND_ACK: &str = "PX0103";
pub const UNEXPECTED_ACK: &str = "PX0200";
pub const UNHANDLED_FRAME: &str = "PX1100";
pub const TRANSPORT_CLOSED: &str = "PX1104";
pub const BEACON_MISSING: &str = "PX2200";
pub const COMMAND_STALE: &str = "PX2201";
pub const INVALID_PARAMETER: &str = "PX2202";
pub const DEVICE_LOST: &str = "PX2204";
pub const LINK_ERROR: &str = "PX2205";

// ─────────────────────────────────────────────────────────────────────────────
// Network uplink
// ─────────────────────────────────────────────────────────────────────────────

pub const CHANGELOG_OVERFLOW: &str = "NW1200";
pub const NETWORK_ERROR: &str = "NW2101";
pub const UNKNOWN_MESSAGE: &str = "NW2103";

/// Identifier for an autopilot status-text frame of the given severity.
pub fn status_text(severity: u8) -> String {
    format!("PH{severity}000")
}

/// Build a [`LogVariables`] map from `(name, value)` pairs.
pub fn log_vars<const N: usize>(pairs: [(&str, String); N]) -> LogVariables {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Standard variables for an internal failure report: where it happened,
/// the captured error text, and a truncated payload context.
pub fn error_vars(location: &str, error: &dyn Display, message: &str) -> LogVariables {
    log_vars([
        ("location", location.to_string()),
        ("e", error.to_string()),
        ("message", truncate(message, MAX_CONTEXT_LEN)),
    ])
}

/// Truncate `s` to at most `max` characters, marking the cut.
pub fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}
