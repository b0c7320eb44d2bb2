//! Anomaly detection over metric buckets, periodic alarms, and alert subscribers

pub mod alarm;
pub mod subscriber;

pub use alarm::AlarmTracker;
pub use subscriber::{ChannelSink, LogSink, Notification, NotificationSink};

use crate::config::{AlertDef, SubscriptionDef};
use crate::event::MetricDimensionKey;
use crate::hash::content_hash;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// An anomaly declared by a metric producer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeclaredAnomaly {
    pub alert_id: i64,
    pub metric_id: i64,
    pub dimension: MetricDimensionKey,
    pub timestamp_ns: i64,
    pub window_sum: i64,
}

/// Sliding window of bucket values for one alert
#[derive(Debug, Clone)]
pub struct AnomalyTracker {
    pub alert_id: i64,
    pub metric_id: i64,
    pub hash: u64,
    num_buckets: i64,
    threshold: f64,
    refractory_period_ns: i64,
    past_buckets: VecDeque<(i64, HashMap<MetricDimensionKey, i64>)>,
    refractory_end_ns: HashMap<MetricDimensionKey, i64>,
    pub subscriptions: Vec<SubscriptionDef>,
}

impl AnomalyTracker {
    /// Callers validate the alert before construction
    pub fn new(alert: &AlertDef, threshold: f64) -> Self {
        Self {
            alert_id: alert.id,
            metric_id: alert.metric_id,
            hash: content_hash(alert),
            num_buckets: i64::from(alert.num_buckets.max(1)),
            threshold,
            refractory_period_ns: i64::from(alert.refractory_period_secs) * 1_000_000_000,
            past_buckets: VecDeque::new(),
            refractory_end_ns: HashMap::new(),
            subscriptions: Vec::new(),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn num_buckets(&self) -> i64 {
        self.num_buckets
    }

    /// Records the values of a closed bucket
    pub fn add_past_bucket(&mut self, bucket_num: i64, values: HashMap<MetricDimensionKey, i64>) {
        if self.num_buckets <= 1 {
            return;
        }
        if self
            .past_buckets
            .back()
            .is_some_and(|(latest, _)| *latest >= bucket_num)
        {
            return;
        }
        self.past_buckets.push_back((bucket_num, values));
        let oldest_kept = bucket_num + 1 - (self.num_buckets - 1);
        while self
            .past_buckets
            .front()
            .is_some_and(|(num, _)| *num < oldest_kept)
        {
            self.past_buckets.pop_front();
        }
    }

    /// Sum of the window ending with the current bucket
    pub fn window_sum(
        &self,
        current_bucket_num: i64,
        key: &MetricDimensionKey,
        current: i64,
    ) -> i64 {
        let oldest = current_bucket_num - (self.num_buckets - 1);
        self.past_buckets
            .iter()
            .filter(|(num, _)| *num >= oldest && *num < current_bucket_num)
            .filter_map(|(_, values)| values.get(key))
            .sum::<i64>()
            + current
    }

    pub fn detect_anomaly(
        &self,
        current_bucket_num: i64,
        key: &MetricDimensionKey,
        current: i64,
    ) -> bool {
        self.window_sum(current_bucket_num, key, current) as f64 > self.threshold
    }

    /// Fires unless `key` is still inside its refractory period
    pub fn declare_anomaly(&mut self, timestamp_ns: i64, key: &MetricDimensionKey) -> bool {
        if self
            .refractory_end_ns
            .get(key)
            .is_some_and(|end| timestamp_ns < *end)
        {
            return false;
        }
        self.refractory_end_ns
            .insert(key.clone(), timestamp_ns + self.refractory_period_ns);
        true
    }

    pub fn detect_and_declare(
        &mut self,
        timestamp_ns: i64,
        current_bucket_num: i64,
        key: &MetricDimensionKey,
        current: i64,
    ) -> Option<DeclaredAnomaly> {
        if !self.detect_anomaly(current_bucket_num, key, current) {
            return None;
        }
        if !self.declare_anomaly(timestamp_ns, key) {
            return None;
        }
        tracing::info!(
            "Anomaly declared: alert {} on metric {} at {}",
            self.alert_id,
            self.metric_id,
            timestamp_ns
        );
        Some(DeclaredAnomaly {
            alert_id: self.alert_id,
            metric_id: self.metric_id,
            dimension: key.clone(),
            timestamp_ns,
            window_sum: self.window_sum(current_bucket_num, key, current),
        })
    }

    pub fn refractory_end_ns(&self, key: &MetricDimensionKey) -> Option<i64> {
        self.refractory_end_ns.get(key).copied()
    }

    /// Keeps the window and refractory deadlines of a preserved alert
    pub fn carry_state_from(&mut self, old: &AnomalyTracker) {
        self.past_buckets = old.past_buckets.clone();
        self.refractory_end_ns = old.refractory_end_ns.clone();
    }
}
