//! Distribution metrics backed by a KLL rank sketch

use super::bucket::{Buckets, Slot};
use super::report::{DimensionData, KllSummary};
use crate::event::{FieldRef, LogEvent, MetricDimensionKey};

/// Size of the top compactor
pub const KLL_K: usize = 200;
const CAPACITY_DECAY: f64 = 2.0 / 3.0;

/// Approximate quantile sketch; exact until more than `k` values were added
#[derive(Debug, Clone)]
pub struct KllSketch {
    k: usize,
    levels: Vec<Vec<i64>>,
    count: u64,
    min: i64,
    max: i64,
}

impl Default for KllSketch {
    fn default() -> Self {
        Self::new(KLL_K)
    }
}

impl KllSketch {
    pub fn new(k: usize) -> Self {
        Self {
            k: k.max(2),
            levels: vec![Vec::new()],
            count: 0,
            min: 0,
            max: 0,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn retained(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    fn capacity(&self, level: usize) -> usize {
        let depth = (self.levels.len() - level - 1) as i32;
        ((self.k as f64 * CAPACITY_DECAY.powi(depth)).ceil() as usize).max(2)
    }

    pub fn update(&mut self, value: i64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.levels[0].push(value);
        self.compress();
    }

    fn compress(&mut self) {
        let mut level = 0;
        while level < self.levels.len() {
            if self.levels[level].len() > self.capacity(level) {
                if level + 1 == self.levels.len() {
                    self.levels.push(Vec::new());
                }
                let mut items = std::mem::take(&mut self.levels[level]);
                items.sort_unstable();
                if items.len() % 2 == 1 {
                    if let Some(last) = items.pop() {
                        self.levels[level].push(last);
                    }
                }
                let offset = usize::from(rand::random::<bool>());
                let promoted: Vec<i64> = items.into_iter().skip(offset).step_by(2).collect();
                self.levels[level + 1].extend(promoted);
            }
            level += 1;
        }
    }

    /// Value at normalized rank `q` in [0, 1]
    pub fn quantile(&self, q: f64) -> Option<i64> {
        if self.count == 0 {
            return None;
        }
        let mut weighted: Vec<(i64, u64)> = self
            .levels
            .iter()
            .enumerate()
            .flat_map(|(level, items)| items.iter().map(move |&v| (v, 1u64 << level)))
            .collect();
        weighted.sort_unstable_by_key(|(v, _)| *v);
        let total: u64 = weighted.iter().map(|(_, w)| w).sum();
        let target = (q.clamp(0.0, 1.0) * total as f64).ceil().max(1.0) as u64;
        let mut cumulative = 0;
        for (value, weight) in &weighted {
            cumulative += weight;
            if cumulative >= target {
                return Some(*value);
            }
        }
        weighted.last().map(|(v, _)| *v)
    }

    pub fn summary(&self) -> KllSummary {
        KllSummary {
            count: self.count,
            min: self.min,
            max: self.max,
            p50: self.quantile(0.5).unwrap_or(0),
            p90: self.quantile(0.9).unwrap_or(0),
            p99: self.quantile(0.99).unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KllState {
    kll_field: FieldRef,
    buckets: Buckets<KllSketch>,
}

impl KllState {
    pub fn new(kll_field: FieldRef) -> Self {
        Self {
            kll_field,
            buckets: Buckets::default(),
        }
    }

    /// Adds the event's sketch field; false when the guardrail refused the key
    pub fn on_event(&mut self, key: &MetricDimensionKey, event: &LogEvent, hard_limit: usize) -> bool {
        let Some(value) = event
            .resolve(&self.kll_field)
            .into_iter()
            .find_map(|v| v.as_i64())
        else {
            return true;
        };
        match self.buckets.slot(key, hard_limit) {
            Slot::Ready(sketch) => {
                sketch.update(value);
                true
            }
            Slot::OverLimit => false,
        }
    }

    pub fn close(&mut self, start_ns: i64, end_ns: i64) {
        self.buckets.close(start_ns, end_ns, |s| s.count() > 0);
    }

    pub fn report(&self, current_start_ns: i64, now_ns: i64) -> Vec<DimensionData<KllSummary>> {
        self.buckets.report(
            current_start_ns,
            now_ns,
            |s| s.count() > 0,
            KllSketch::summary,
        )
    }

    pub fn erase(&mut self) {
        self.buckets.erase();
    }

    pub fn carry_data_from(&mut self, old: &KllState) {
        self.buckets = old.buckets.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_inputs_are_exact() {
        let mut sketch = KllSketch::default();
        for v in 1..=100 {
            sketch.update(v);
        }
        let summary = sketch.summary();
        assert_eq!(summary.count, 100);
        assert_eq!((summary.min, summary.max), (1, 100));
        assert_eq!(summary.p50, 50);
        assert_eq!(summary.p90, 90);
        assert_eq!(summary.p99, 99);
    }

    #[test]
    fn test_large_inputs_stay_bounded_and_close() {
        let mut sketch = KllSketch::default();
        for v in 0..100_000 {
            sketch.update(v);
        }
        assert!(sketch.retained() < 2_000);
        let p50 = sketch.quantile(0.5).unwrap();
        assert!((p50 - 50_000).abs() < 5_000, "p50 = {p50}");
        assert_eq!(sketch.summary().max, 99_999);
    }
}
