//! Change-log drain pacing.
//!
//! The relay is the only drainer of the change-log queue. Each drain tick
//! asks [`DrainPacer::next_batch`] how many entries to ship:
//!
//! | Backlog        | Batch            |
//! |----------------|------------------|
//! | > 3000         | 1000             |
//! | > 1000         | 700              |
//! | > 350          | 350              |
//! | 1 ..= 350      | held, see below  |
//!
//! A small backlog is held back while the producer keeps adding to it, and
//! shipped whole on the first tick that finds it unchanged. Under zero
//! production the backlog therefore falls on every tick until it is empty.
//!
//! [`OverflowGuard`] reports a runaway backlog once per episode. Nothing is
//! ever dropped here.

/// Backlog above which the overflow diagnostic fires.
pub const OVERFLOW_THRESHOLD: usize = 15_000;

/// Batch size for a given backlog, per the table above.
pub fn drain_batch_size(backlog: usize) -> usize {
    match backlog {
        n if n > 3000 => 1000,
        n if n > 1000 => 700,
        n if n > 350 => 350,
        _ => 0,
    }
}

/// Tracks what the previous tick left behind to decide when a small
/// backlog has settled.
#[derive(Debug, Default)]
pub struct DrainPacer {
    remaining: usize,
}

impl DrainPacer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries to drain this tick.
    pub fn next_batch(&mut self, backlog: usize) -> usize {
        let mut size = drain_batch_size(backlog);
        if size == 0 && backlog > 0 && backlog == self.remaining {
            size = backlog;
        }
        self.remaining = backlog - size;
        size
    }
}

/// Once-per-episode latch for the overflow diagnostic.
#[derive(Debug)]
pub struct OverflowGuard {
    threshold: usize,
    tripped: bool,
}

impl Default for OverflowGuard {
    fn default() -> Self {
        Self::new(OVERFLOW_THRESHOLD)
    }
}

impl OverflowGuard {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            tripped: false,
        }
    }

    /// Returns `true` exactly when `backlog` crosses above the threshold
    /// for the first time since it was last below it.
    pub fn observe(&mut self, backlog: usize) -> bool {
        if backlog > self.threshold {
            let fire = !self.tripped;
            self.tripped = true;
            fire
        } else {
            if backlog < self.threshold {
                self.tripped = false;
            }
            false
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped
    }
}
