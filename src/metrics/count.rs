//! Count metrics

use super::bucket::{bucket_values, Buckets, Slot};
use super::report::DimensionData;
use crate::event::MetricDimensionKey;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct CountState {
    buckets: Buckets<i64>,
}

impl CountState {
    /// Increments `key`; returns the new bucket count, or `None` past the guardrail
    pub fn on_event(&mut self, key: &MetricDimensionKey, hard_limit: usize) -> Option<i64> {
        match self.buckets.slot(key, hard_limit) {
            Slot::Ready(count) => {
                *count += 1;
                Some(*count)
            }
            Slot::OverLimit => None,
        }
    }

    pub fn close(&mut self, start_ns: i64, end_ns: i64) -> HashMap<MetricDimensionKey, i64> {
        let closed = self.buckets.close(start_ns, end_ns, |c| *c > 0);
        bucket_values(&closed, |c| *c)
    }

    pub fn report(&self, current_start_ns: i64, now_ns: i64) -> Vec<DimensionData<i64>> {
        self.buckets
            .report(current_start_ns, now_ns, |c| *c > 0, |c| *c)
    }

    pub fn erase(&mut self) {
        self.buckets.erase();
    }

    pub fn carry_data_from(&mut self, old: &CountState) {
        self.buckets = old.buckets.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_accumulate_per_bucket() {
        let mut state = CountState::default();
        let key = MetricDimensionKey::default();
        assert_eq!(state.on_event(&key, 10), Some(1));
        assert_eq!(state.on_event(&key, 10), Some(2));
        let closed = state.close(0, 100);
        assert_eq!(closed.get(&key), Some(&2));
        assert_eq!(state.on_event(&key, 10), Some(1));

        let report = state.report(100, 150);
        assert_eq!(report.len(), 1);
        let values: Vec<i64> = report[0].buckets.iter().map(|b| b.value).collect();
        assert_eq!(values, vec![2, 1]);
    }
}
