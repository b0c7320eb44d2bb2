//! Daemon-wide guardrail counters
//!
//! One [`DaemonStats`] is created by the composition root and handed to everything that needs
//! to record runtime errors. Histories are bounded: the oldest entries are evicted first.

use crate::compiler::reason::InvalidConfigReason;
use crate::config::ConfigKey;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

/// Maximum timestamps kept per history
pub const MAX_TIMESTAMP_COUNT: usize = 20;
/// Maximum removed configs remembered
pub const MAX_ICE_BOX_SIZE: usize = 20;

fn push_capped<T>(history: &mut VecDeque<T>, item: T) {
    if history.len() >= MAX_TIMESTAMP_COUNT {
        history.pop_front();
    }
    history.push_back(item);
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigStats {
    pub key: Option<ConfigKey>,
    pub creation_time_ns: i64,
    pub deletion_time_ns: Option<i64>,
    pub is_valid: bool,
    pub invalid_reason: Option<InvalidConfigReason>,
    pub metric_count: usize,
    pub matcher_stats: BTreeMap<i64, u64>,
    pub alert_stats: BTreeMap<i64, u64>,
    pub dimension_limit_reached: BTreeMap<i64, u64>,
    pub late_events: BTreeMap<i64, u64>,
    pub dropped_buckets: BTreeMap<i64, u64>,
    pub restricted_flush_failures: u64,
    pub restricted_query_successes: u64,
    pub restricted_query_failures: u64,
    pub db_corrupted_ns: VecDeque<i64>,
    pub alarms_fired: BTreeMap<i64, u64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AtomStats {
    pub logged: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub configs: Vec<ConfigStats>,
    pub ice_box: Vec<ConfigStats>,
    pub atoms: BTreeMap<i32, AtomStats>,
    pub invalid_events: u64,
    pub subscriptions_started: u64,
    pub subscriptions_ended: u64,
}

#[derive(Debug, Default)]
struct StatsInner {
    configs: BTreeMap<ConfigKey, ConfigStats>,
    ice_box: VecDeque<ConfigStats>,
    atoms: BTreeMap<i32, AtomStats>,
    invalid_events: u64,
    subscriptions_started: u64,
    subscriptions_ended: u64,
}

impl StatsInner {
    fn config(&mut self, key: ConfigKey) -> &mut ConfigStats {
        self.configs.entry(key).or_insert_with(|| ConfigStats {
            key: Some(key),
            ..ConfigStats::default()
        })
    }
}

#[derive(Debug, Default)]
pub struct DaemonStats {
    inner: Mutex<StatsInner>,
}

impl DaemonStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_config_received(
        &self,
        key: ConfigKey,
        now_ns: i64,
        metric_count: usize,
        result: Result<(), &InvalidConfigReason>,
    ) {
        let mut inner = self.inner.lock();
        let stats = inner.config(key);
        stats.creation_time_ns = now_ns;
        stats.metric_count = metric_count;
        stats.is_valid = result.is_ok();
        stats.invalid_reason = result.err().cloned();
    }

    pub fn note_config_removed(&self, key: ConfigKey, now_ns: i64) {
        let mut inner = self.inner.lock();
        if let Some(mut stats) = inner.configs.remove(&key) {
            stats.deletion_time_ns = Some(now_ns);
            if inner.ice_box.len() >= MAX_ICE_BOX_SIZE {
                inner.ice_box.pop_front();
            }
            inner.ice_box.push_back(stats);
        }
    }

    pub fn note_matcher_matched(&self, key: ConfigKey, matcher_id: i64) {
        *self
            .inner
            .lock()
            .config(key)
            .matcher_stats
            .entry(matcher_id)
            .or_default() += 1;
    }

    pub fn note_anomaly_declared(&self, key: ConfigKey, alert_id: i64) {
        *self
            .inner
            .lock()
            .config(key)
            .alert_stats
            .entry(alert_id)
            .or_default() += 1;
    }

    pub fn note_hard_dimension_limit_reached(&self, key: ConfigKey, metric_id: i64) {
        *self
            .inner
            .lock()
            .config(key)
            .dimension_limit_reached
            .entry(metric_id)
            .or_default() += 1;
    }

    pub fn note_late_event_skipped(&self, key: ConfigKey, metric_id: i64) {
        *self
            .inner
            .lock()
            .config(key)
            .late_events
            .entry(metric_id)
            .or_default() += 1;
    }

    pub fn note_bucket_dropped(&self, key: ConfigKey, metric_id: i64) {
        *self
            .inner
            .lock()
            .config(key)
            .dropped_buckets
            .entry(metric_id)
            .or_default() += 1;
    }

    pub fn note_alarm_fired(&self, key: ConfigKey, alarm_id: i64) {
        *self
            .inner
            .lock()
            .config(key)
            .alarms_fired
            .entry(alarm_id)
            .or_default() += 1;
    }

    pub fn note_restricted_flush_failed(&self, key: ConfigKey) {
        self.inner.lock().config(key).restricted_flush_failures += 1;
    }

    pub fn note_restricted_query(&self, key: ConfigKey, success: bool) {
        let mut inner = self.inner.lock();
        let stats = inner.config(key);
        if success {
            stats.restricted_query_successes += 1;
        } else {
            stats.restricted_query_failures += 1;
        }
    }

    pub fn note_db_corrupted(&self, key: ConfigKey, now_ns: i64) {
        push_capped(&mut self.inner.lock().config(key).db_corrupted_ns, now_ns);
    }

    pub fn note_atom_logged(&self, atom_id: i32) {
        self.inner.lock().atoms.entry(atom_id).or_default().logged += 1;
    }

    pub fn note_atom_dropped(&self, atom_id: i32) {
        self.inner.lock().atoms.entry(atom_id).or_default().dropped += 1;
    }

    pub fn note_invalid_event(&self) {
        self.inner.lock().invalid_events += 1;
    }

    pub fn note_subscription_started(&self) {
        self.inner.lock().subscriptions_started += 1;
    }

    pub fn note_subscription_ended(&self) {
        self.inner.lock().subscriptions_ended += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.lock();
        StatsSnapshot {
            configs: inner.configs.values().cloned().collect(),
            ice_box: inner.ice_box.iter().cloned().collect(),
            atoms: inner.atoms.clone(),
            invalid_events: inner.invalid_events,
            subscriptions_started: inner.subscriptions_started,
            subscriptions_ended: inner.subscriptions_ended,
        }
    }

    pub fn config_stats(&self, key: ConfigKey) -> Option<ConfigStats> {
        self.inner.lock().configs.get(&key).cloned()
    }
}
