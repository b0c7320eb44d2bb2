//! Per-dimension bucket storage shared by the aggregating producers

use super::report::{BucketData, DimensionData};
use crate::event::MetricDimensionKey;
use std::collections::{BTreeMap, HashMap};

/// Result of asking for a slot in the current bucket
pub enum Slot<'a, A> {
    Ready(&'a mut A),
    /// New key refused by the dimension guardrail
    OverLimit,
}

#[derive(Debug, Clone)]
pub struct Buckets<A> {
    current: BTreeMap<MetricDimensionKey, A>,
    past: BTreeMap<MetricDimensionKey, Vec<BucketData<A>>>,
}

impl<A> Default for Buckets<A> {
    fn default() -> Self {
        Self {
            current: BTreeMap::new(),
            past: BTreeMap::new(),
        }
    }
}

impl<A: Clone + Default> Buckets<A> {
    pub fn slot(&mut self, key: &MetricDimensionKey, hard_limit: usize) -> Slot<'_, A> {
        if !self.current.contains_key(key) && self.current.len() >= hard_limit {
            return Slot::OverLimit;
        }
        Slot::Ready(self.current.entry(key.clone()).or_default())
    }

    pub fn current(&self) -> &BTreeMap<MetricDimensionKey, A> {
        &self.current
    }

    pub fn current_value(&self, key: &MetricDimensionKey) -> Option<&A> {
        self.current.get(key)
    }

    /// Moves the current bucket into history; `keep` filters out empty aggregates
    pub fn close(
        &mut self,
        start_ns: i64,
        end_ns: i64,
        keep: impl Fn(&A) -> bool,
    ) -> BTreeMap<MetricDimensionKey, A> {
        let closed = std::mem::take(&mut self.current);
        for (key, value) in &closed {
            if !keep(value) {
                continue;
            }
            self.past.entry(key.clone()).or_default().push(BucketData {
                start_ns,
                end_ns,
                value: value.clone(),
            });
        }
        closed
    }

    /// Past buckets plus a snapshot of the current one ending at `now_ns`
    pub fn report<R>(
        &self,
        current_start_ns: i64,
        now_ns: i64,
        keep: impl Fn(&A) -> bool,
        convert: impl Fn(&A) -> R,
    ) -> Vec<DimensionData<R>> {
        let mut rows: BTreeMap<&MetricDimensionKey, Vec<BucketData<R>>> = BTreeMap::new();
        for (key, buckets) in &self.past {
            rows.entry(key).or_default().extend(buckets.iter().map(|b| BucketData {
                start_ns: b.start_ns,
                end_ns: b.end_ns,
                value: convert(&b.value),
            }));
        }
        if now_ns > current_start_ns {
            for (key, value) in &self.current {
                if keep(value) {
                    rows.entry(key).or_default().push(BucketData {
                        start_ns: current_start_ns,
                        end_ns: now_ns,
                        value: convert(value),
                    });
                }
            }
        }
        rows.into_iter()
            .filter(|(_, buckets)| !buckets.is_empty())
            .map(|(key, buckets)| DimensionData {
                dimension: key.clone(),
                buckets,
            })
            .collect()
    }

    pub fn erase(&mut self) {
        self.current.clear();
        self.past.clear();
    }

    pub fn has_data(&self) -> bool {
        !self.current.is_empty() || !self.past.is_empty()
    }
}

/// Integer view of a closed bucket for anomaly windows
pub fn bucket_values<A>(
    closed: &BTreeMap<MetricDimensionKey, A>,
    to_i64: impl Fn(&A) -> i64,
) -> HashMap<MetricDimensionKey, i64> {
    closed
        .iter()
        .map(|(key, value)| (key.clone(), to_i64(value)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{DimensionKey, StateValue};

    fn key(state: i64) -> MetricDimensionKey {
        MetricDimensionKey::new(
            DimensionKey::default(),
            vec![StateValue {
                atom_id: 1,
                value: state,
            }],
        )
    }

    #[test]
    fn test_guardrail_refuses_new_keys() {
        let mut buckets: Buckets<i64> = Buckets::default();
        assert!(matches!(buckets.slot(&key(1), 1), Slot::Ready(_)));
        assert!(matches!(buckets.slot(&key(2), 1), Slot::OverLimit));
        assert!(matches!(buckets.slot(&key(1), 1), Slot::Ready(_)));
    }

    #[test]
    fn test_report_includes_partial_bucket_without_mutating() {
        let mut buckets: Buckets<i64> = Buckets::default();
        if let Slot::Ready(v) = buckets.slot(&key(1), 10) {
            *v += 2;
        }
        buckets.close(0, 10, |v| *v > 0);
        if let Slot::Ready(v) = buckets.slot(&key(1), 10) {
            *v += 3;
        }
        let first = buckets.report(10, 15, |v| *v > 0, |v| *v);
        let second = buckets.report(10, 15, |v| *v > 0, |v| *v);
        assert_eq!(first, second);
        assert_eq!(first[0].buckets.len(), 2);
        assert_eq!(first[0].buckets[1].value, 3);
    }
}
