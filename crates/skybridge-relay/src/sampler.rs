//! Per-field rate-limited sampling of the state table.
//!
//! Every subscription keeps its own schedule: a field subscribed at `f` Hz
//! becomes due every `1/f` seconds, measured from its own last emission,
//! independently of every other field. The relay polls
//! [`RateSampler::sample`] on a fine tick and ships whatever is due as one
//! `requested_telemetry` batch.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use skybridge_types::{FieldValue, StateView};
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Subscription {
    rate: f64,
    /// `None` once the next emission lies beyond the clock's range.
    due: Option<Instant>,
}

/// What an upsert did to the subscription map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateChange {
    Created,
    Updated { old: f64 },
}

/// Owned by the relay; last request per `(category, field)` wins.
#[derive(Debug, Default)]
pub struct RateSampler {
    subscriptions: HashMap<(String, String), Subscription>,
}

impl RateSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the rate of one field. `rate <= 0` keeps the entry but disables
    /// it. The field becomes due immediately.
    pub fn upsert(&mut self, category: &str, field: &str, rate: f64, now: Instant) -> RateChange {
        let key = (category.to_string(), field.to_string());
        let sub = Subscription {
            rate,
            due: Some(now),
        };
        match self.subscriptions.insert(key, sub) {
            Some(previous) => RateChange::Updated { old: previous.rate },
            None => RateChange::Created,
        }
    }

    /// Number of enabled subscriptions.
    pub fn active(&self) -> usize {
        self.subscriptions.values().filter(|s| s.rate > 0.0).count()
    }

    /// Collect every due field, keyed `"category.field"`.
    ///
    /// Fields absent from the state table are emitted as `null`.
    pub fn sample(&mut self, state: &StateView, now: Instant) -> BTreeMap<String, FieldValue> {
        let mut batch = BTreeMap::new();
        for ((category, field), sub) in &mut self.subscriptions {
            if sub.rate.is_nan() || sub.rate <= 0.0 {
                continue;
            }
            let Some(due) = sub.due.filter(|due| *due <= now) else {
                continue;
            };
            let period = Duration::try_from_secs_f64(1.0 / sub.rate).ok();
            sub.due = match period.and_then(|p| due.checked_add(p)) {
                Some(next) if next > now => Some(next),
                // Fell more than a period behind; restart the schedule.
                Some(_) => period.and_then(|p| now.checked_add(p)),
                None => None,
            };
            let value = state.get(category, field).unwrap_or(FieldValue::Null);
            batch.insert(format!("{category}.{field}"), value);
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skybridge_types::StateTable;

    const TICK: Duration = Duration::from_millis(10);

    fn emissions(rate: f64, seconds: u64) -> usize {
        let table = StateTable::new();
        table.set("VFR_HUD", "alt", 10.0_f64);
        let view = table.view();

        let start = Instant::now();
        let mut sampler = RateSampler::new();
        sampler.upsert("VFR_HUD", "alt", rate, start);

        let ticks = Duration::from_secs(seconds).as_millis() / TICK.as_millis();
        (0..ticks)
            .map(|i| start + TICK * i as u32)
            .filter(|now| !sampler.sample(&view, *now).is_empty())
            .count()
    }

    #[test]
    fn emission_count_tracks_rate() {
        for rate in [0.5, 1.0, 2.0, 3.0, 7.0, 30.0, 100.0] {
            for seconds in [10, 60] {
                let expected = (seconds as f64 * rate).floor() as i64;
                let actual = emissions(rate, seconds) as i64;
                assert!(
                    (actual - expected).abs() <= 1,
                    "rate {rate} over {seconds}s: {actual} vs {expected}"
                );
            }
        }
    }

    #[test]
    fn fields_are_timed_independently() {
        let table = StateTable::new();
        table.set("A", "x", 1_i64);
        table.set("B", "y", 2_i64);
        let view = table.view();

        let t0 = Instant::now();
        let mut sampler = RateSampler::new();
        sampler.upsert("A", "x", 1.0, t0);
        let first = sampler.sample(&view, t0);
        assert_eq!(first.len(), 1);

        sampler.upsert("B", "y", 1.0, t0 + Duration::from_millis(400));
        let second = sampler.sample(&view, t0 + Duration::from_millis(400));
        assert_eq!(second.keys().collect::<Vec<_>>(), ["B.y"]);

        let third = sampler.sample(&view, t0 + Duration::from_millis(1000));
        assert_eq!(third.keys().collect::<Vec<_>>(), ["A.x"]);
    }

    #[test]
    fn zero_rate_disables() {
        let table = StateTable::new();
        table.set("A", "x", 1_i64);
        let t0 = Instant::now();
        let mut sampler = RateSampler::new();
        sampler.upsert("A", "x", 5.0, t0);
        assert_eq!(
            sampler.upsert("A", "x", 0.0, t0),
            RateChange::Updated { old: 5.0 }
        );
        assert_eq!(sampler.active(), 0);
        assert!(sampler.sample(&table.view(), t0).is_empty());
    }

    #[test]
    fn vanishing_rate_emits_once_then_goes_quiet() {
        let table = StateTable::new();
        table.set("VFR_HUD", "alt", 10.0_f64);
        let view = table.view();
        let t0 = Instant::now();
        let mut sampler = RateSampler::new();

        for rate in [1e-20, 1e-300, f64::MIN_POSITIVE] {
            sampler.upsert("VFR_HUD", "alt", rate, t0);
            assert_eq!(sampler.sample(&view, t0).len(), 1, "rate {rate}");
            assert!(sampler.sample(&view, t0 + Duration::from_secs(3600)).is_empty());
        }
        assert_eq!(sampler.active(), 1);
    }

    #[test]
    fn infinite_rate_emits_every_tick() {
        let table = StateTable::new();
        table.set("VFR_HUD", "alt", 10.0_f64);
        let view = table.view();
        let t0 = Instant::now();
        let mut sampler = RateSampler::new();
        sampler.upsert("VFR_HUD", "alt", f64::INFINITY, t0);
        for i in 0..5 {
            assert_eq!(sampler.sample(&view, t0 + TICK * i).len(), 1);
        }
    }

    #[test]
    fn due_fields_coalesce_into_one_batch() {
        let table = StateTable::new();
        table.set("GLOBAL_POSITION_INT", "lat", 123_i64);
        let t0 = Instant::now();
        let mut sampler = RateSampler::new();
        assert_eq!(
            sampler.upsert("GLOBAL_POSITION_INT", "lat", 2.0, t0),
            RateChange::Created
        );
        sampler.upsert("GLOBAL_POSITION_INT", "lon", 2.0, t0);

        let batch = sampler.sample(&table.view(), t0);
        assert_eq!(batch["GLOBAL_POSITION_INT.lat"], FieldValue::Int(123));
        assert_eq!(batch["GLOBAL_POSITION_INT.lon"], FieldValue::Null);
    }
}
