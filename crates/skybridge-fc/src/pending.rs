//! Registry of commands awaiting an autopilot acknowledgement.
//!
//! At most one waiter exists per numeric command id. Registering a second
//! command with the same id drops the first waiter's sender: the earlier
//! caller can no longer be resolved and runs out its own deadline. Every
//! registration also stamps a submission time, which the liveness loop
//! sweeps for commands that never got an acknowledgement.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

/// Identifies one registration so a timed-out caller only withdraws its
/// own waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub command: u16,
    id: u64,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<String>,
}

#[derive(Default)]
struct Inner {
    waiters: HashMap<u16, Waiter>,
    submitted: HashMap<u16, Instant>,
    next_id: u64,
}

/// Pending-command table shared by the dispatch path and the reader task.
#[derive(Default)]
pub struct PendingCommands {
    inner: Mutex<Inner>,
}

impl PendingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `command`, replacing any existing one.
    pub fn register(&self, command: u16) -> (Ticket, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.waiters.insert(command, Waiter { id, tx });
        inner.submitted.insert(command, Instant::now());
        (Ticket { command, id }, rx)
    }

    /// Deliver an acknowledgement. Returns `false` when nobody was waiting.
    pub fn resolve(&self, command: u16, status: String) -> bool {
        let waiter = {
            let mut inner = self.lock();
            inner.submitted.remove(&command);
            inner.waiters.remove(&command)
        };
        match waiter {
            Some(waiter) => waiter.tx.send(status).is_ok(),
            None => false,
        }
    }

    /// Drop the waiter registered under `ticket`, if it is still current.
    pub fn withdraw(&self, ticket: &Ticket) {
        let mut inner = self.lock();
        if inner
            .waiters
            .get(&ticket.command)
            .is_some_and(|w| w.id == ticket.id)
        {
            inner.waiters.remove(&ticket.command);
        }
    }

    /// Remove and return submission records older than `max_age`.
    ///
    /// Waiters are left alone; their callers time out independently.
    pub fn sweep_stale(&self, max_age: Duration) -> Vec<(u16, Duration)> {
        let now = Instant::now();
        let mut inner = self.lock();
        let stale: Vec<(u16, Duration)> = inner
            .submitted
            .iter()
            .map(|(cmd, at)| (*cmd, now.duration_since(*at)))
            .filter(|(_, age)| *age > max_age)
            .collect();
        for (cmd, _) in &stale {
            inner.submitted.remove(cmd);
        }
        stale
    }

    /// Number of commands with a live waiter.
    pub fn waiting(&self) -> usize {
        self.lock().waiters.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
