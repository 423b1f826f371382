//! Change-log queue: the ordered record of per-field value transitions.
//!
//! The queue is unbounded and append-only from the producer's side. The
//! flight-controller link holds the only [`ChangeLogWriter`]; the relay
//! client holds the only [`ChangeLogReader`] and drains it in batches. Both
//! handles are deliberately not `Clone`, so the single-producer /
//! single-drainer discipline is enforced by ownership.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value::FieldValue;

/// One immutable field transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub time: DateTime<Utc>,
    pub category: String,
    pub field: String,
    /// `null` on the wire when the field was first observed.
    pub old: Option<FieldValue>,
    pub new: FieldValue,
}

type Queue = Arc<Mutex<VecDeque<ChangeEvent>>>;

/// Producer half of the change-log queue.
#[derive(Debug)]
pub struct ChangeLogWriter {
    queue: Queue,
}

/// Drainer half of the change-log queue.
#[derive(Debug)]
pub struct ChangeLogReader {
    queue: Queue,
}

/// Create a connected writer/reader pair over an empty queue.
pub fn change_log() -> (ChangeLogWriter, ChangeLogReader) {
    let queue: Queue = Arc::default();
    (
        ChangeLogWriter {
            queue: Arc::clone(&queue),
        },
        ChangeLogReader { queue },
    )
}

impl ChangeLogWriter {
    /// Append one event at the back of the queue.
    pub fn push(&self, event: ChangeEvent) {
        self.lock().push_back(event);
    }

    /// Append several events, preserving their order.
    pub fn extend(&self, events: impl IntoIterator<Item = ChangeEvent>) {
        self.lock().extend(events);
    }

    /// Current backlog.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<ChangeEvent>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ChangeLogReader {
    /// Current backlog.
    pub fn len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return up to `max` events from the front, oldest first.
    pub fn drain(&self, max: usize) -> Vec<ChangeEvent> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let n = max.min(queue.len());
        queue.drain(..n).collect()
    }
}
