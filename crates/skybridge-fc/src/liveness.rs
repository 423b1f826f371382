//! [`BeaconMonitor`] – autopilot liveness supervision.
//!
//! The reader task calls [`BeaconMonitor::beacon`] for every heartbeat the
//! autopilot sends. The liveness loop calls
//! [`BeaconMonitor::wait_for_beacon`] once per cycle; the call returns as
//! soon as a fresh beacon arrives, or reports the gap since the last one
//! when the deadline passes.
//!
//! ```text
//! AwaitingFirstBeacon ──beacon──▶ BeaconOk ◀──beacon── BeaconMissing
//!                                     │                     ▲
//!                                     └──────timeout────────┘
//!            any state ──terminate──▶ Terminated
//! ```

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Liveness state of the autopilot link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkHealth {
    /// The session is open but no beacon has been seen yet.
    AwaitingFirstBeacon,
    /// A beacon arrived within the last wait window.
    BeaconOk,
    /// The last wait window expired without a beacon.
    BeaconMissing,
    /// The transport device disappeared; the link will not recover.
    Terminated,
}

/// Outcome of one [`BeaconMonitor::wait_for_beacon`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconWait {
    Received,
    /// No beacon within the window; `gap` is the time since the last one.
    Missing { gap: Duration },
}

// ────────────────────────────────────────────────────────────────────────────
// Internal entry
// ────────────────────────────────────────────────────────────────────────────

struct Entry {
    health: LinkHealth,
    last_beacon: Instant,
}

// ────────────────────────────────────────────────────────────────────────────
// BeaconMonitor
// ────────────────────────────────────────────────────────────────────────────

/// Tracks autopilot beacons and releases waiters when one arrives.
pub struct BeaconMonitor {
    entry: Mutex<Entry>,
    beats: watch::Sender<u64>,
}

impl Default for BeaconMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl BeaconMonitor {
    /// Create a monitor in [`LinkHealth::AwaitingFirstBeacon`].
    ///
    /// The "last received" clock starts now, so the first missing-beacon
    /// report measures from session start.
    pub fn new() -> Self {
        let (beats, _) = watch::channel(0);
        Self {
            entry: Mutex::new(Entry {
                health: LinkHealth::AwaitingFirstBeacon,
                last_beacon: Instant::now(),
            }),
            beats,
        }
    }

    /// Record a beacon: reset the clock and release any waiter.
    ///
    /// No-op once the monitor is terminated.
    pub fn beacon(&self) {
        {
            let mut entry = self.lock();
            if entry.health == LinkHealth::Terminated {
                return;
            }
            entry.health = LinkHealth::BeaconOk;
            entry.last_beacon = Instant::now();
        }
        self.beats.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Wait up to `timeout` for a beacon newer than the call.
    pub async fn wait_for_beacon(&self, timeout: Duration) -> BeaconWait {
        let mut rx = self.beats.subscribe();
        rx.borrow_and_update();

        match tokio::time::timeout(timeout, rx.changed()).await {
            Ok(Ok(())) => BeaconWait::Received,
            _ => {
                let mut entry = self.lock();
                if entry.health != LinkHealth::Terminated {
                    entry.health = LinkHealth::BeaconMissing;
                }
                BeaconWait::Missing {
                    gap: entry.last_beacon.elapsed(),
                }
            }
        }
    }

    /// Current liveness state.
    pub fn health(&self) -> LinkHealth {
        self.lock().health
    }

    /// Move to [`LinkHealth::Terminated`] permanently.
    pub fn terminate(&self) {
        self.lock().health = LinkHealth::Terminated;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Entry> {
        self.entry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
