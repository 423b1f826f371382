//! Parameter download bookkeeping.
//!
//! A [`ParameterFetchSession`] collects `PARAM_VALUE` frames after a
//! parameter-list request. Ordinary parameters are keyed by name and their
//! indexes tracked against the total the autopilot reports in the first
//! frame. Dynamic parameters (index `0xFFFF`) are kept apart and never count
//! towards completion.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

use crate::frame::DYNAMIC_PARAM_INDEX;

/// Transient accumulator for one parameter download.
#[derive(Debug)]
pub struct ParameterFetchSession {
    buffer: BTreeMap<String, f32>,
    dynamic: BTreeMap<String, f32>,
    received_indexes: HashSet<u16>,
    expected_count: Option<u16>,
    last_received: Instant,
}

impl Default for ParameterFetchSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterFetchSession {
    pub fn new() -> Self {
        Self {
            buffer: BTreeMap::new(),
            dynamic: BTreeMap::new(),
            received_indexes: HashSet::new(),
            expected_count: None,
            last_received: Instant::now(),
        }
    }

    /// Fold one `PARAM_VALUE` frame into the session.
    pub fn record(&mut self, name: &str, index: u16, count: u16, value: f32) {
        if index == DYNAMIC_PARAM_INDEX {
            self.dynamic.insert(name.to_string(), value);
            return;
        }
        self.last_received = Instant::now();
        self.buffer.insert(name.to_string(), value);
        self.received_indexes.insert(index);
        if self.expected_count.is_none() {
            self.expected_count = Some(count);
        }
    }

    /// Every enumerated index has arrived.
    pub fn is_complete(&self) -> bool {
        self.expected_count
            .is_some_and(|n| self.received_indexes.len() >= usize::from(n))
    }

    /// Time since the last ordinary frame.
    pub fn idle_for(&self) -> Duration {
        self.last_received.elapsed()
    }

    pub fn expected_count(&self) -> Option<u16> {
        self.expected_count
    }

    /// Distinct ordinary indexes received so far.
    pub fn received(&self) -> usize {
        self.received_indexes.len()
    }

    /// Consume the session into `(ordinary, dynamic)` values.
    pub fn into_values(self) -> (BTreeMap<String, f32>, BTreeMap<String, f32>) {
        (self.buffer, self.dynamic)
    }
}

/// Permanent parameter store, updated by completed downloads and by
/// unsolicited `PARAM_VALUE` frames.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParameterStore {
    values: BTreeMap<String, f32>,
}

impl ParameterStore {
    /// Merge a finished session; later values win.
    pub fn merge(&mut self, session: ParameterFetchSession) {
        let (ordinary, dynamic) = session.into_values();
        self.values.extend(ordinary);
        self.values.extend(dynamic);
    }

    pub fn set(&mut self, name: &str, value: f32) {
        self.values.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<f32> {
        self.values.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<String, f32> {
        self.values.clone()
    }
}
