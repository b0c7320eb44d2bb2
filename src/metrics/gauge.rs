//! Gauge metrics sample whole atoms

use super::bucket::{Buckets, Slot};
use super::report::{DimensionData, GaugeAtom};
use crate::config::{GaugeFieldsFilter, GaugeSamplingType};
use crate::event::{LogEvent, MetricDimensionKey};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct GaugeState {
    filter: GaugeFieldsFilter,
    sampling: GaugeSamplingType,
    max_atoms: usize,
    trigger_index: Option<usize>,
    /// Latest `what` atom per key, snapshotted when the trigger fires
    latest: BTreeMap<MetricDimensionKey, GaugeAtom>,
    buckets: Buckets<Vec<GaugeAtom>>,
}

impl GaugeState {
    pub fn new(
        filter: GaugeFieldsFilter,
        sampling: GaugeSamplingType,
        max_atoms: usize,
        trigger_index: Option<usize>,
    ) -> Self {
        Self {
            filter,
            sampling,
            max_atoms: max_atoms.max(1),
            trigger_index,
            latest: BTreeMap::new(),
            buckets: Buckets::default(),
        }
    }

    pub fn is_trigger(&self, matcher_index: usize) -> bool {
        self.trigger_index == Some(matcher_index)
    }

    fn capture(&self, event: &LogEvent) -> GaugeAtom {
        let values = if self.filter.include_all {
            event
                .values
                .iter()
                .enumerate()
                .map(|(idx, v)| (idx as i32 + 1, v.clone()))
                .collect()
        } else {
            self.filter
                .fields
                .iter()
                .filter_map(|f| {
                    event
                        .resolve(f)
                        .into_iter()
                        .next()
                        .map(|v| (f.field, v.clone()))
                })
                .collect()
        };
        GaugeAtom {
            elapsed_timestamp_ns: event.elapsed_timestamp_ns,
            values,
        }
    }

    fn sample(&mut self, key: &MetricDimensionKey, atom: GaugeAtom, hard_limit: usize) -> bool {
        let limit = match self.sampling {
            GaugeSamplingType::RandomOneSample => 1,
            GaugeSamplingType::FirstNSamples => self.max_atoms,
        };
        match self.buckets.slot(key, hard_limit) {
            Slot::Ready(atoms) => {
                if atoms.len() < limit {
                    atoms.push(atom);
                }
                true
            }
            Slot::OverLimit => false,
        }
    }

    /// Handles a `what` atom; false when the guardrail refused the key
    pub fn on_event(&mut self, key: &MetricDimensionKey, event: &LogEvent, hard_limit: usize) -> bool {
        let atom = self.capture(event);
        if self.trigger_index.is_some() {
            if !self.latest.contains_key(key) && self.latest.len() >= hard_limit {
                return false;
            }
            self.latest.insert(key.clone(), atom);
            return true;
        }
        self.sample(key, atom, hard_limit)
    }

    /// Samples the latest atom of every key
    pub fn on_trigger(&mut self, hard_limit: usize) -> bool {
        let latest: Vec<(MetricDimensionKey, GaugeAtom)> = self
            .latest
            .iter()
            .map(|(k, a)| (k.clone(), a.clone()))
            .collect();
        let mut accepted = true;
        for (key, atom) in latest {
            accepted &= self.sample(&key, atom, hard_limit);
        }
        accepted
    }

    pub fn close(&mut self, start_ns: i64, end_ns: i64) {
        self.buckets.close(start_ns, end_ns, |atoms| !atoms.is_empty());
    }

    pub fn report(
        &self,
        current_start_ns: i64,
        now_ns: i64,
    ) -> Vec<DimensionData<Vec<GaugeAtom>>> {
        self.buckets.report(
            current_start_ns,
            now_ns,
            |atoms| !atoms.is_empty(),
            |atoms| atoms.clone(),
        )
    }

    pub fn erase(&mut self) {
        self.buckets.erase();
    }

    pub fn carry_data_from(&mut self, old: &GaugeState) {
        self.latest = old.latest.clone();
        self.buckets = old.buckets.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{FieldRef, Value};

    fn event(ts: i64, v: i32) -> LogEvent {
        LogEvent::new(5, ts)
            .with_value(Value::Int(v))
            .with_value(Value::Str("x".into()))
    }

    fn filter() -> GaugeFieldsFilter {
        GaugeFieldsFilter {
            include_all: false,
            fields: vec![FieldRef::new(1)],
        }
    }

    #[test]
    fn test_first_n_samples_caps_atoms() {
        let mut state = GaugeState::new(filter(), GaugeSamplingType::FirstNSamples, 2, None);
        let key = MetricDimensionKey::default();
        for ts in 0..5 {
            assert!(state.on_event(&key, &event(ts, ts as i32), 10));
        }
        let report = state.report(0, 10);
        let atoms = &report[0].buckets[0].value;
        assert_eq!(atoms.len(), 2);
        assert_eq!(atoms[1].values, vec![(1, Value::Int(1))]);
    }

    #[test]
    fn test_trigger_snapshots_latest_atom() {
        let mut state = GaugeState::new(filter(), GaugeSamplingType::FirstNSamples, 10, Some(7));
        let key = MetricDimensionKey::default();
        state.on_event(&key, &event(1, 1), 10);
        state.on_event(&key, &event(2, 2), 10);
        assert!(state.report(0, 10).is_empty());
        assert!(state.is_trigger(7));
        state.on_trigger(10);
        let report = state.report(0, 10);
        assert_eq!(report[0].buckets[0].value[0].elapsed_timestamp_ns, 2);
    }
}
