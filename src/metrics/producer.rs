//! Common producer state machine
//!
//! A [`MetricProducer`] owns everything shared by the six metric variants: bucket timing,
//! condition and state slicing, sampling, activation gating, and the alert trackers bound to
//! it. Variant specific aggregation lives in [`MetricKind`].

use super::activation::{ActivationStore, ActivationWiring};
use super::count::CountState;
use super::duration::DurationState;
use super::event::EventState;
use super::gauge::GaugeState;
use super::kll::KllState;
use super::report::{MetricData, MetricReport};
use super::restricted::{RestrictedBatch, RestrictedState};
use super::value::ValueState;
use crate::anomaly::{AnomalyTracker, DeclaredAnomaly};
use crate::condition::{self, ConditionState, ConditionTracker};
use crate::config::{ConfigKey, MetricStateLink};
use crate::event::{DimensionKey, FieldRef, LogEvent, MetricDimensionKey, StateValue};
use crate::hash::value_hash;
use crate::state::{StateChange, StateDefinition, StateRegistry};
use crate::stats::DaemonStats;
use std::collections::{BTreeSet, HashMap};

pub const DEFAULT_DIMENSION_HARD_LIMIT: usize = 800;
pub const MAX_DIMENSION_HARD_LIMIT: usize = 3000;
/// Gaps longer than this are not materialized bucket by bucket
pub const MAX_SKIPPED_BUCKETS: i64 = 1000;

/// Condition link resolved to a tracker index
#[derive(Debug, Clone)]
pub struct ResolvedLink {
    pub condition_index: usize,
    pub fields_in_what: Vec<FieldRef>,
    pub fields_in_condition: Vec<FieldRef>,
}

#[derive(Debug, Clone)]
pub struct SlicedState {
    pub definition: StateDefinition,
    pub link: Option<MetricStateLink>,
}

#[derive(Debug, Clone, Copy)]
pub struct Sampling {
    pub field: FieldRef,
    pub shard_count: i32,
}

/// Everything a producer reads from the rest of the graph while handling one event
pub struct EventContext<'a> {
    pub conditions: &'a [ConditionTracker],
    pub states: &'a StateRegistry,
    pub activations: &'a ActivationStore,
    pub stats: &'a DaemonStats,
    pub config_key: ConfigKey,
    pub shard_offset: u32,
    pub anomalies: &'a mut Vec<DeclaredAnomaly>,
}

#[derive(Debug, Clone)]
pub enum MetricKind {
    Count(CountState),
    Duration(DurationState),
    Event(EventState),
    Value(ValueState),
    Kll(KllState),
    Gauge(GaugeState),
    Restricted(RestrictedState),
}

impl MetricKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            MetricKind::Count(_) => "count",
            MetricKind::Duration(_) => "duration",
            MetricKind::Event(_) => "event",
            MetricKind::Value(_) => "value",
            MetricKind::Kll(_) => "kll",
            MetricKind::Gauge(_) => "gauge",
            MetricKind::Restricted(_) => "restricted",
        }
    }

    /// Whether alerts can watch this variant
    pub fn supports_anomaly(&self) -> bool {
        matches!(
            self,
            MetricKind::Count(_) | MetricKind::Duration(_) | MetricKind::Value(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct MetricProducer {
    pub id: i64,
    pub index: usize,
    pub hash: u64,
    pub what_index: usize,
    /// Every matcher whose events reach this producer
    pub event_matchers: BTreeSet<usize>,
    pub condition_index: Option<usize>,
    pub links: Vec<ResolvedLink>,
    pub dimensions_in_what: Vec<FieldRef>,
    pub sliced_states: Vec<SlicedState>,
    pub sampling: Option<Sampling>,
    pub activation: ActivationWiring,
    pub anomaly_trackers: Vec<AnomalyTracker>,
    pub dimension_hard_limit: usize,
    pub no_report: bool,
    pub kind: MetricKind,
    bucket_size_ns: i64,
    time_base_ns: i64,
    current_bucket_start_ns: i64,
    current_bucket_num: i64,
}

impl MetricProducer {
    pub fn new(
        id: i64,
        index: usize,
        hash: u64,
        what_index: usize,
        kind: MetricKind,
        bucket_size_ns: i64,
        time_base_ns: i64,
    ) -> Self {
        Self {
            id,
            index,
            hash,
            what_index,
            event_matchers: BTreeSet::from([what_index]),
            condition_index: None,
            links: Vec::new(),
            dimensions_in_what: Vec::new(),
            sliced_states: Vec::new(),
            sampling: None,
            activation: ActivationWiring::default(),
            anomaly_trackers: Vec::new(),
            dimension_hard_limit: DEFAULT_DIMENSION_HARD_LIMIT,
            no_report: false,
            kind,
            bucket_size_ns: bucket_size_ns.max(1),
            time_base_ns,
            current_bucket_start_ns: time_base_ns,
            current_bucket_num: 0,
        }
    }

    pub fn bucket_size_ns(&self) -> i64 {
        self.bucket_size_ns
    }

    pub fn current_bucket_start_ns(&self) -> i64 {
        self.current_bucket_start_ns
    }

    pub fn current_bucket_num(&self) -> i64 {
        self.current_bucket_num
    }

    fn current_bucket_end_ns(&self) -> i64 {
        self.time_base_ns + (self.current_bucket_num + 1) * self.bucket_size_ns
    }

    pub fn is_restricted(&self) -> bool {
        matches!(self.kind, MetricKind::Restricted(_))
    }

    pub fn is_active(&self, activations: &ActivationStore, now_ns: i64) -> bool {
        self.activation.is_active(activations, now_ns)
    }

    /// Keeps aggregation data and bucket position of a producer whose content did not change
    pub fn carry_state_from(&mut self, old: &MetricProducer) {
        self.time_base_ns = old.time_base_ns;
        self.current_bucket_start_ns = old.current_bucket_start_ns;
        self.current_bucket_num = old.current_bucket_num;
        match (&mut self.kind, &old.kind) {
            (MetricKind::Count(new), MetricKind::Count(old)) => new.carry_data_from(old),
            (MetricKind::Duration(new), MetricKind::Duration(old)) => new.carry_data_from(old),
            (MetricKind::Event(new), MetricKind::Event(old)) => new.carry_data_from(old),
            (MetricKind::Value(new), MetricKind::Value(old)) => new.carry_data_from(old),
            (MetricKind::Kll(new), MetricKind::Kll(old)) => new.carry_data_from(old),
            (MetricKind::Gauge(new), MetricKind::Gauge(old)) => new.carry_data_from(old),
            (MetricKind::Restricted(new), MetricKind::Restricted(old)) => {
                new.carry_data_from(old)
            }
            _ => {}
        }
        for tracker in self.anomaly_trackers.iter_mut() {
            if let Some(previous) = old
                .anomaly_trackers
                .iter()
                .find(|t| t.alert_id == tracker.alert_id && t.hash == tracker.hash)
            {
                tracker.carry_state_from(previous);
            }
        }
    }

    /// Condition keys for every linked condition, extracted from `event`
    fn link_keys(&self, event: &LogEvent) -> HashMap<usize, DimensionKey> {
        self.links
            .iter()
            .map(|link| {
                (
                    link.condition_index,
                    DimensionKey::extract_linked(
                        event,
                        &link.fields_in_what,
                        &link.fields_in_condition,
                    ),
                )
            })
            .collect()
    }

    fn condition_state(
        &self,
        conditions: &[ConditionTracker],
        keys: &HashMap<usize, DimensionKey>,
    ) -> ConditionState {
        match self.condition_index {
            Some(index) => condition::query(conditions, index, keys),
            None => ConditionState::True,
        }
    }

    /// Dimension key for `event`, or `None` when sampling drops it
    fn dimension_key(&self, event: &LogEvent, ctx: &EventContext<'_>) -> Option<MetricDimensionKey> {
        if let Some(sampling) = &self.sampling {
            let value = event.resolve(&sampling.field).into_iter().next()?;
            let shard_count = u64::try_from(sampling.shard_count).unwrap_or(1).max(1);
            if value_hash(value) % shard_count != u64::from(ctx.shard_offset) % shard_count {
                return None;
            }
        }
        let what = DimensionKey::extract(event, &self.dimensions_in_what);
        let states = self
            .sliced_states
            .iter()
            .map(|sliced| {
                let primary_key = match &sliced.link {
                    Some(link) => DimensionKey::extract_linked(
                        event,
                        &link.fields_in_what,
                        &link.fields_in_state,
                    ),
                    None => DimensionKey::default(),
                };
                let raw = ctx.states.value(sliced.definition.atom_id, &primary_key);
                StateValue {
                    atom_id: sliced.definition.atom_id,
                    value: sliced.definition.map_value(raw),
                }
            })
            .collect();
        Some(MetricDimensionKey::new(what, states))
    }

    /// Handles an event matched by one of this producer's matchers
    pub fn on_matched_event(
        &mut self,
        matcher_index: usize,
        event: &LogEvent,
        ctx: &mut EventContext<'_>,
    ) {
        let now = event.elapsed_timestamp_ns;
        if now < self.current_bucket_start_ns {
            ctx.stats.note_late_event_skipped(ctx.config_key, self.id);
            return;
        }
        self.flush_if_needed(now, ctx);

        if !self.is_active(ctx.activations, now) {
            return;
        }

        if let MetricKind::Gauge(state) = &mut self.kind {
            if state.is_trigger(matcher_index) {
                if !state.on_trigger(self.dimension_hard_limit) {
                    ctx.stats
                        .note_hard_dimension_limit_reached(ctx.config_key, self.id);
                }
                return;
            }
        }

        let link_keys = self.link_keys(event);
        let condition = self.condition_state(ctx.conditions, &link_keys);
        let Some(key) = self.dimension_key(event, ctx) else {
            return;
        };

        let hard_limit = self.dimension_hard_limit;
        let bucket_num = self.current_bucket_num;
        let accepted = match &mut self.kind {
            MetricKind::Count(state) => {
                if !condition.is_true() {
                    return;
                }
                match state.on_event(&key, hard_limit) {
                    Some(value) => {
                        for tracker in self.anomaly_trackers.iter_mut() {
                            ctx.anomalies
                                .extend(tracker.detect_and_declare(now, bucket_num, &key, value));
                        }
                        true
                    }
                    None => false,
                }
            }
            MetricKind::Duration(state) => {
                let recorded =
                    state.on_event(matcher_index, key, link_keys, condition, now, hard_limit);
                if let Some((key, value)) = &recorded.stopped {
                    for tracker in self.anomaly_trackers.iter_mut() {
                        ctx.anomalies
                            .extend(tracker.detect_and_declare(now, bucket_num, key, *value));
                    }
                }
                recorded.accepted
            }
            MetricKind::Event(state) => {
                if condition.is_true() {
                    state.on_event(event);
                }
                true
            }
            MetricKind::Value(state) => {
                if !condition.is_true() {
                    return;
                }
                match state.on_event(&key, event, hard_limit) {
                    Some(value) => {
                        for tracker in self.anomaly_trackers.iter_mut() {
                            ctx.anomalies
                                .extend(tracker.detect_and_declare(now, bucket_num, &key, value));
                        }
                        true
                    }
                    None => false,
                }
            }
            MetricKind::Kll(state) => {
                if !condition.is_true() {
                    return;
                }
                state.on_event(&key, event, hard_limit)
            }
            MetricKind::Gauge(state) => {
                if !condition.is_true() {
                    return;
                }
                state.on_event(&key, event, hard_limit)
            }
            MetricKind::Restricted(state) => {
                if condition.is_true() {
                    state.on_event(event);
                }
                true
            }
        };
        if !accepted {
            ctx.stats
                .note_hard_dimension_limit_reached(ctx.config_key, self.id);
        }
    }

    /// Re-evaluates running durations after one of this producer's conditions changed
    pub fn on_condition_changed(&mut self, now_ns: i64, ctx: &mut EventContext<'_>) {
        if now_ns < self.current_bucket_start_ns {
            return;
        }
        self.flush_if_needed(now_ns, ctx);
        let conditions = ctx.conditions;
        let condition_index = self.condition_index;
        if let MetricKind::Duration(state) = &mut self.kind {
            state.on_condition_changed(now_ns, |keys| match condition_index {
                Some(index) => condition::query(conditions, index, keys),
                None => ConditionState::True,
            });
        }
    }

    /// Moves running durations to the new state slice
    pub fn on_state_changed(&mut self, change: &StateChange, now_ns: i64, ctx: &mut EventContext<'_>) {
        if now_ns < self.current_bucket_start_ns {
            return;
        }
        self.flush_if_needed(now_ns, ctx);
        let Some(sliced) = self
            .sliced_states
            .iter()
            .find(|s| s.definition.atom_id == change.atom_id)
        else {
            return;
        };
        let old_value = sliced.definition.map_value(change.old_value);
        let new_value = sliced.definition.map_value(change.new_value);
        if old_value == new_value {
            return;
        }
        let link = sliced.link.clone();
        if let MetricKind::Duration(state) = &mut self.kind {
            state.on_state_changed(
                change.atom_id,
                &change.primary_key,
                link.as_ref(),
                old_value,
                new_value,
                now_ns,
            );
        }
    }

    /// Closes every bucket that ended at or before `now_ns`
    pub fn flush_if_needed(&mut self, now_ns: i64, ctx: &mut EventContext<'_>) {
        if now_ns < self.current_bucket_end_ns() {
            return;
        }
        let target_num = (now_ns - self.time_base_ns) / self.bucket_size_ns;
        let has_running = matches!(&self.kind, MetricKind::Duration(d) if d.has_running());

        if has_running && target_num - self.current_bucket_num <= MAX_SKIPPED_BUCKETS {
            while self.current_bucket_num < target_num {
                self.close_current_bucket(ctx);
            }
            return;
        }

        self.close_current_bucket(ctx);
        if self.current_bucket_num < target_num {
            if has_running {
                ctx.stats.note_bucket_dropped(ctx.config_key, self.id);
                if let MetricKind::Duration(state) = &mut self.kind {
                    state.restart_running(self.time_base_ns + target_num * self.bucket_size_ns);
                }
            }
            self.current_bucket_num = target_num;
            self.current_bucket_start_ns = self.time_base_ns + target_num * self.bucket_size_ns;
        }
    }

    fn close_current_bucket(&mut self, ctx: &mut EventContext<'_>) {
        let start = self.current_bucket_start_ns;
        let end = self.current_bucket_end_ns();
        let values = match &mut self.kind {
            MetricKind::Count(state) => Some(state.close(start, end)),
            MetricKind::Duration(state) => state.close(start, end),
            MetricKind::Value(state) => Some(state.close(start, end)),
            MetricKind::Kll(state) => {
                state.close(start, end);
                None
            }
            MetricKind::Gauge(state) => {
                state.close(start, end);
                None
            }
            MetricKind::Event(_) | MetricKind::Restricted(_) => None,
        };
        if let Some(values) = values {
            for tracker in self.anomaly_trackers.iter_mut() {
                tracker.add_past_bucket(self.current_bucket_num, values.clone());
            }
        }
        tracing::trace!(
            "Closed bucket {} of metric {} for config {}",
            self.current_bucket_num,
            self.id,
            ctx.config_key
        );
        self.current_bucket_num += 1;
        self.current_bucket_start_ns = end;
    }

    /// Report of past buckets plus the current partial bucket; `None` for unreported metrics
    pub fn on_dump_report(
        &mut self,
        dump_time_ns: i64,
        erase: bool,
        ctx: &mut EventContext<'_>,
    ) -> Option<MetricReport> {
        if dump_time_ns >= self.current_bucket_start_ns {
            self.flush_if_needed(dump_time_ns, ctx);
        }
        if self.no_report || self.is_restricted() {
            return None;
        }
        let start = self.current_bucket_start_ns;
        let data = match &self.kind {
            MetricKind::Count(state) => MetricData::Count(state.report(start, dump_time_ns)),
            MetricKind::Duration(state) => {
                MetricData::Duration(state.report(start, dump_time_ns))
            }
            MetricKind::Event(state) => MetricData::Event(state.report()),
            MetricKind::Value(state) => MetricData::Value(state.report(start, dump_time_ns)),
            MetricKind::Kll(state) => MetricData::Kll(state.report(start, dump_time_ns)),
            MetricKind::Gauge(state) => MetricData::Gauge(state.report(start, dump_time_ns)),
            MetricKind::Restricted(_) => return None,
        };
        let report = MetricReport {
            metric_id: self.id,
            is_active: self.is_active(ctx.activations, dump_time_ns),
            bucket_size_ns: self.bucket_size_ns,
            data,
        };
        if erase {
            self.erase(dump_time_ns);
        }
        Some(report)
    }

    fn erase(&mut self, now_ns: i64) {
        match &mut self.kind {
            MetricKind::Count(state) => state.erase(),
            MetricKind::Duration(state) => state.erase(now_ns),
            MetricKind::Event(state) => state.erase(),
            MetricKind::Value(state) => state.erase(),
            MetricKind::Kll(state) => state.erase(),
            MetricKind::Gauge(state) => state.erase(),
            MetricKind::Restricted(_) => {}
        }
        if now_ns > self.current_bucket_start_ns {
            self.current_bucket_start_ns = now_ns;
        }
    }

    pub fn restricted_rows(&self) -> usize {
        match &self.kind {
            MetricKind::Restricted(state) => state.len(),
            _ => 0,
        }
    }

    pub fn take_restricted_batch(&mut self) -> Option<RestrictedBatch> {
        match &mut self.kind {
            MetricKind::Restricted(state) => state.take_batch(self.id),
            _ => None,
        }
    }

    /// Puts a batch back after a failed flush
    pub fn requeue_restricted_batch(&mut self, batch: RestrictedBatch) {
        if let MetricKind::Restricted(state) = &mut self.kind {
            state.requeue(batch);
        }
    }

    pub fn mark_restricted_table_created(&mut self) {
        if let MetricKind::Restricted(state) = &mut self.kind {
            state.mark_table_created();
        }
    }

    pub fn restricted_category(&self) -> Option<i32> {
        match &self.kind {
            MetricKind::Restricted(state) => state.category(),
            _ => None,
        }
    }

    pub fn restore_restricted_category(&mut self, category: i32) {
        if let MetricKind::Restricted(state) = &mut self.kind {
            state.restore_category(category);
        }
    }

    /// Keeps the restriction category and table status of a replaced producer of the same metric
    pub fn carry_restricted_table_from(&mut self, old: &MetricProducer) {
        if let (MetricKind::Restricted(new), MetricKind::Restricted(old)) =
            (&mut self.kind, &old.kind)
        {
            new.carry_table_state_from(old);
        }
    }
}
