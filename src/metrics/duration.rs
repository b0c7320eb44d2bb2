//! Duration metrics
//!
//! A duration runs from a start matcher to a stop matcher of the metric's `what` predicate and
//! only accumulates while the metric's condition is true. SUM splits running durations at each
//! bucket boundary; MAX_SPARSE records the whole duration in the bucket where it stops.

use super::bucket::{bucket_values, Buckets, Slot};
use super::report::DimensionData;
use crate::condition::ConditionState;
use crate::config::{DurationAggregation, MetricStateLink};
use crate::event::{DimensionKey, MetricDimensionKey};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone)]
struct RunningDuration {
    nesting: i32,
    counting_since: Option<i64>,
    accumulated_ns: i64,
    link_keys: HashMap<usize, DimensionKey>,
}

impl RunningDuration {
    fn elapsed(&self, now_ns: i64) -> i64 {
        self.accumulated_ns + self.counting_since.map_or(0, |since| now_ns - since)
    }
}

/// Result of feeding one matched event to a duration metric
#[derive(Debug, Default)]
pub struct DurationOutcome {
    pub accepted: bool,
    /// Key and bucket value of a duration that just stopped
    pub stopped: Option<(MetricDimensionKey, i64)>,
}

#[derive(Debug, Clone)]
pub struct DurationState {
    aggregation: DurationAggregation,
    start_index: usize,
    stop_index: Option<usize>,
    stop_all_index: Option<usize>,
    count_nesting: bool,
    running: BTreeMap<MetricDimensionKey, RunningDuration>,
    buckets: Buckets<i64>,
}

impl DurationState {
    pub fn new(
        aggregation: DurationAggregation,
        start_index: usize,
        stop_index: Option<usize>,
        stop_all_index: Option<usize>,
        count_nesting: bool,
    ) -> Self {
        Self {
            aggregation,
            start_index,
            stop_index,
            stop_all_index,
            count_nesting,
            running: BTreeMap::new(),
            buckets: Buckets::default(),
        }
    }

    pub fn aggregation(&self) -> DurationAggregation {
        self.aggregation
    }

    pub fn has_running(&self) -> bool {
        self.aggregation == DurationAggregation::Sum
            && self.running.values().any(|r| r.counting_since.is_some())
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn on_event(
        &mut self,
        matcher_index: usize,
        key: MetricDimensionKey,
        link_keys: HashMap<usize, DimensionKey>,
        condition: ConditionState,
        now_ns: i64,
        hard_limit: usize,
    ) -> DurationOutcome {
        if self.stop_all_index == Some(matcher_index) {
            self.stop_all(now_ns);
            return DurationOutcome {
                accepted: true,
                stopped: None,
            };
        }

        if matcher_index == self.start_index {
            if let Some(running) = self.running.get_mut(&key) {
                if self.count_nesting {
                    running.nesting += 1;
                }
                return DurationOutcome {
                    accepted: true,
                    stopped: None,
                };
            }
            if self.running.len() >= hard_limit {
                return DurationOutcome::default();
            }
            self.running.insert(
                key,
                RunningDuration {
                    nesting: 1,
                    counting_since: condition.is_true().then_some(now_ns),
                    accumulated_ns: 0,
                    link_keys,
                },
            );
            return DurationOutcome {
                accepted: true,
                stopped: None,
            };
        }

        if self.stop_index == Some(matcher_index) {
            let finished = match self.running.get_mut(&key) {
                Some(running) => {
                    running.nesting = if self.count_nesting {
                        running.nesting - 1
                    } else {
                        0
                    };
                    running.nesting <= 0
                }
                None => false,
            };
            if finished {
                if let Some(running) = self.running.remove(&key) {
                    let value = self.record(&key, running.elapsed(now_ns));
                    return DurationOutcome {
                        accepted: true,
                        stopped: Some((key, value)),
                    };
                }
            }
        }

        DurationOutcome {
            accepted: true,
            stopped: None,
        }
    }

    fn record(&mut self, key: &MetricDimensionKey, duration_ns: i64) -> i64 {
        match self.buckets.slot(key, usize::MAX) {
            Slot::Ready(value) => {
                match self.aggregation {
                    DurationAggregation::Sum => *value += duration_ns,
                    DurationAggregation::MaxSparse => *value = (*value).max(duration_ns),
                }
                *value
            }
            Slot::OverLimit => 0,
        }
    }

    fn stop_all(&mut self, now_ns: i64) {
        let running = std::mem::take(&mut self.running);
        for (key, duration) in running {
            self.record(&key, duration.elapsed(now_ns));
        }
    }

    /// Pauses or resumes every running duration against a fresh condition query
    pub fn on_condition_changed(
        &mut self,
        now_ns: i64,
        query: impl Fn(&HashMap<usize, DimensionKey>) -> ConditionState,
    ) {
        for running in self.running.values_mut() {
            let condition = query(&running.link_keys).is_true();
            match (condition, running.counting_since) {
                (true, None) => running.counting_since = Some(now_ns),
                (false, Some(since)) => {
                    running.accumulated_ns += now_ns - since;
                    running.counting_since = None;
                }
                _ => {}
            }
        }
    }

    /// Splits durations whose sliced state moved from `old_value` to `new_value`
    pub fn on_state_changed(
        &mut self,
        atom_id: i32,
        primary_key: &DimensionKey,
        link: Option<&MetricStateLink>,
        old_value: i64,
        new_value: i64,
        now_ns: i64,
    ) {
        let affected: Vec<MetricDimensionKey> = self
            .running
            .keys()
            .filter(|key| {
                key.states
                    .iter()
                    .any(|s| s.atom_id == atom_id && s.value == old_value)
            })
            .filter(|key| match link {
                Some(link) => link
                    .fields_in_what
                    .iter()
                    .zip(&link.fields_in_state)
                    .all(|(what, state)| {
                        key.what.value_of(what.field) == primary_key.value_of(state.field)
                    }),
                None => true,
            })
            .cloned()
            .collect();

        for key in affected {
            let Some(running) = self.running.remove(&key) else {
                continue;
            };
            self.record(&key, running.elapsed(now_ns));

            let mut moved = key.clone();
            for state in moved.states.iter_mut() {
                if state.atom_id == atom_id {
                    state.value = new_value;
                }
            }
            self.running.insert(
                moved,
                RunningDuration {
                    nesting: running.nesting,
                    counting_since: running.counting_since.map(|_| now_ns),
                    accumulated_ns: 0,
                    link_keys: running.link_keys,
                },
            );
        }
    }

    pub fn close(&mut self, start_ns: i64, end_ns: i64) -> Option<HashMap<MetricDimensionKey, i64>> {
        if self.aggregation == DurationAggregation::Sum {
            let mut partials = Vec::new();
            for (key, running) in self.running.iter_mut() {
                let elapsed = running.elapsed(end_ns);
                if running.counting_since.is_some() {
                    running.counting_since = Some(end_ns);
                }
                running.accumulated_ns = 0;
                if elapsed > 0 {
                    partials.push((key.clone(), elapsed));
                }
            }
            for (key, elapsed) in partials {
                self.record(&key, elapsed);
            }
        }
        let closed = self.buckets.close(start_ns, end_ns, |v| *v > 0);
        Some(bucket_values(&closed, |v| *v))
    }

    /// Restarts counting durations at `at_ns` after a gap that was not materialized
    pub fn restart_running(&mut self, at_ns: i64) {
        for running in self.running.values_mut() {
            if running.counting_since.is_some() {
                running.counting_since = Some(at_ns);
            }
            running.accumulated_ns = 0;
        }
    }

    pub fn report(&self, current_start_ns: i64, now_ns: i64) -> Vec<DimensionData<i64>> {
        if self.aggregation == DurationAggregation::MaxSparse || self.running.is_empty() {
            return self
                .buckets
                .report(current_start_ns, now_ns, |v| *v > 0, |v| *v);
        }
        let mut snapshot = self.clone();
        for (key, running) in &self.running {
            let elapsed = running.elapsed(now_ns);
            if elapsed > 0 {
                snapshot.record(key, elapsed);
            }
        }
        snapshot
            .buckets
            .report(current_start_ns, now_ns, |v| *v > 0, |v| *v)
    }

    pub fn erase(&mut self, now_ns: i64) {
        self.buckets.erase();
        if self.aggregation == DurationAggregation::Sum {
            self.restart_running(now_ns);
        }
    }

    pub fn carry_data_from(&mut self, old: &DurationState) {
        self.running = old.running.clone();
        self.buckets = old.buckets.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: usize = 0;
    const STOP: usize = 1;
    const STOP_ALL: usize = 2;

    fn state(aggregation: DurationAggregation) -> DurationState {
        DurationState::new(aggregation, START, Some(STOP), Some(STOP_ALL), true)
    }

    fn feed(state: &mut DurationState, matcher: usize, now: i64) -> DurationOutcome {
        state.on_event(
            matcher,
            MetricDimensionKey::default(),
            HashMap::new(),
            ConditionState::True,
            now,
            10,
        )
    }

    fn bucket_sums(report: &[DimensionData<i64>]) -> Vec<i64> {
        report
            .iter()
            .flat_map(|d| d.buckets.iter().map(|b| b.value))
            .collect()
    }

    #[test]
    fn test_sum_splits_at_bucket_boundary() {
        let mut s = state(DurationAggregation::Sum);
        feed(&mut s, START, 50);
        s.close(0, 100);
        let stopped = feed(&mut s, STOP, 130).stopped;
        assert_eq!(stopped.map(|(_, v)| v), Some(30));
        s.close(100, 200);
        assert_eq!(bucket_sums(&s.report(200, 200)), vec![50, 30]);
    }

    #[test]
    fn test_max_sparse_records_on_stop() {
        let mut s = state(DurationAggregation::MaxSparse);
        feed(&mut s, START, 50);
        s.close(0, 100);
        feed(&mut s, STOP, 130);
        s.close(100, 200);
        assert_eq!(bucket_sums(&s.report(200, 200)), vec![80]);
    }

    #[test]
    fn test_nesting_requires_matching_stops() {
        let mut s = state(DurationAggregation::Sum);
        feed(&mut s, START, 0);
        feed(&mut s, START, 10);
        assert!(feed(&mut s, STOP, 20).stopped.is_none());
        assert!(feed(&mut s, STOP, 40).stopped.is_some());
        assert_eq!(s.running_count(), 0);
    }

    #[test]
    fn test_condition_pause_excludes_time() {
        let mut s = state(DurationAggregation::Sum);
        feed(&mut s, START, 0);
        s.on_condition_changed(10, |_| ConditionState::False);
        s.on_condition_changed(30, |_| ConditionState::True);
        let stopped = feed(&mut s, STOP, 50).stopped;
        assert_eq!(stopped.map(|(_, v)| v), Some(30));
    }

    #[test]
    fn test_stop_all_ends_every_duration() {
        let mut s = state(DurationAggregation::Sum);
        feed(&mut s, START, 0);
        feed(&mut s, STOP_ALL, 25);
        assert_eq!(s.running_count(), 0);
        assert_eq!(bucket_sums(&s.report(0, 30)), vec![25]);
    }

    #[test]
    fn test_report_is_stable_while_running() {
        let mut s = state(DurationAggregation::Sum);
        feed(&mut s, START, 0);
        assert_eq!(s.report(0, 40), s.report(0, 40));
        assert_eq!(bucket_sums(&s.report(0, 40)), vec![40]);
    }
}
