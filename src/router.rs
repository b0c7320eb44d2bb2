//! Event router
//!
//! A [`MetricsManager`] owns one compiled graph and drives it with events. Per event it
//! evaluates the matchers interested in the atom, applies activations, updates states, then
//! conditions, and only then hands the event to the metric producers, so a producer always sees
//! the condition value the same event produced.

use crate::anomaly::subscriber::select_subscriptions;
use crate::anomaly::{DeclaredAnomaly, Notification, NotificationSink};
use crate::compiler::CompiledGraph;
use crate::condition::{self, ConditionState};
use crate::config::{ConfigKey, RuleType};
use crate::event::LogEvent;
use crate::matcher::{self, MatchingState};
use crate::metrics::{ActivationRecord, ConfigMetricsReport, EventContext, RestrictedBatch};
use crate::stats::DaemonStats;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

pub struct MetricsManager {
    graph: CompiledGraph,
    stats: Arc<DaemonStats>,
    sink: Arc<dyn NotificationSink>,
    shard_offset: u32,
    last_report_ns: i64,
}

impl MetricsManager {
    pub fn new(
        graph: CompiledGraph,
        stats: Arc<DaemonStats>,
        sink: Arc<dyn NotificationSink>,
        shard_offset: u32,
    ) -> Self {
        let last_report_ns = graph.time_base_ns;
        Self {
            graph,
            stats,
            sink,
            shard_offset,
            last_report_ns,
        }
    }

    pub fn config_key(&self) -> ConfigKey {
        self.graph.config_key
    }

    pub fn graph(&self) -> &CompiledGraph {
        &self.graph
    }

    /// Installs a recompiled graph in place of the current one
    pub fn replace_graph(&mut self, graph: CompiledGraph) {
        self.graph = graph;
    }

    pub fn interesting_atom_ids(&self) -> BTreeSet<i32> {
        self.graph.interesting_atom_ids()
    }

    pub fn is_restricted(&self) -> bool {
        self.graph.is_restricted()
    }

    pub fn restricted_delegate(&self) -> Option<&str> {
        self.graph.restricted_delegate.as_deref()
    }

    pub fn restricted_ttl_ns(&self) -> i64 {
        self.graph.restricted_ttl_ns
    }

    pub fn restricted_metric_ids(&self) -> Vec<i64> {
        self.graph
            .producers
            .iter()
            .filter(|p| p.is_restricted())
            .map(|p| p.id)
            .collect()
    }

    /// Largest number of buffered restricted rows of any metric
    pub fn max_restricted_rows(&self) -> usize {
        self.graph
            .producers
            .iter()
            .map(|p| p.restricted_rows())
            .max()
            .unwrap_or(0)
    }

    pub fn on_log_event(&mut self, event: &LogEvent) {
        let key = self.graph.config_key;
        let now = event.elapsed_timestamp_ns;
        let graph = &mut self.graph;

        let mut matcher_cache = vec![MatchingState::NotComputed; graph.matchers.len()];
        let mut matched = Vec::new();
        if let Some(candidates) = graph.atom_matchers.get(&event.atom_id) {
            for &index in candidates {
                if matcher::evaluate(&graph.matchers, index, event, &mut matcher_cache) {
                    self.stats.note_matcher_matched(key, graph.matchers[index].id);
                    matched.push(index);
                }
            }
        }

        // Activations
        for &m in &matched {
            let Some(producers) = graph.activation_metrics.get(&m) else {
                continue;
            };
            for &p in producers {
                let wiring = &graph.producers[p].activation;
                if let Some(activation_key) = wiring.on_matcher.get(&m) {
                    if let Some(activation) = graph.activations.get_mut(activation_key) {
                        activation.activate(now);
                    }
                }
                for activation_key in wiring.deactivate_on_matcher.get(&m).into_iter().flatten() {
                    if let Some(activation) = graph.activations.get_mut(activation_key) {
                        activation.deactivate();
                    }
                }
            }
        }

        let mut anomalies = Vec::new();

        // States
        let changes = graph.states.on_event(event);
        for change in &changes {
            let listeners: Vec<usize> = graph.states.listeners(change.atom_id).collect();
            let mut ctx = EventContext {
                conditions: &graph.conditions,
                states: &graph.states,
                activations: &graph.activations,
                stats: &self.stats,
                config_key: key,
                shard_offset: self.shard_offset,
                anomalies: &mut anomalies,
            };
            for p in listeners {
                graph.producers[p].on_state_changed(change, now, &mut ctx);
            }
        }

        if matched.is_empty() {
            self.dispatch_anomalies(anomalies);
            return;
        }

        // Conditions
        let mut condition_cache = vec![ConditionState::NotEvaluated; graph.conditions.len()];
        let mut changed = vec![false; graph.conditions.len()];
        let interested: BTreeSet<usize> = matched
            .iter()
            .filter_map(|m| graph.matcher_conditions.get(m))
            .flatten()
            .copied()
            .collect();
        for &c in &interested {
            condition::evaluate(
                &mut graph.conditions,
                c,
                event,
                &matcher_cache,
                &mut condition_cache,
                &mut changed,
            );
        }

        let mut ctx = EventContext {
            conditions: &graph.conditions,
            states: &graph.states,
            activations: &graph.activations,
            stats: &self.stats,
            config_key: key,
            shard_offset: self.shard_offset,
            anomalies: &mut anomalies,
        };

        let condition_listeners: BTreeSet<usize> = changed
            .iter()
            .enumerate()
            .filter(|(_, changed)| **changed)
            .filter_map(|(c, _)| graph.condition_metrics.get(&c))
            .flatten()
            .copied()
            .collect();
        for p in condition_listeners {
            graph.producers[p].on_condition_changed(now, &mut ctx);
        }

        // Metrics
        for &m in &matched {
            for &p in graph.matcher_metrics.get(&m).into_iter().flatten() {
                graph.producers[p].on_matched_event(m, event, &mut ctx);
            }
        }

        self.dispatch_anomalies(anomalies);
    }

    fn dispatch_anomalies(&self, anomalies: Vec<DeclaredAnomaly>) {
        let key = self.graph.config_key;
        for anomaly in anomalies {
            self.stats.note_anomaly_declared(key, anomaly.alert_id);
            let Some(producer) = self.graph.producer(anomaly.metric_id) else {
                continue;
            };
            let Some(tracker) = producer
                .anomaly_trackers
                .iter()
                .find(|t| t.alert_id == anomaly.alert_id)
            else {
                continue;
            };
            for subscription in select_subscriptions(&tracker.subscriptions) {
                self.sink.notify(Notification {
                    config_key: key,
                    rule_type: RuleType::Alert,
                    rule_id: anomaly.alert_id,
                    subscription_id: subscription.id,
                    subscriber: subscription.subscriber.clone().unwrap_or_default(),
                    metric_id: Some(anomaly.metric_id),
                    dimension: Some(anomaly.dimension.clone()),
                    timestamp_ns: anomaly.timestamp_ns,
                });
            }
        }
    }

    /// Reports every reported metric at `dump_time_ns`
    pub fn dump_report(&mut self, dump_time_ns: i64, erase: bool) -> ConfigMetricsReport {
        let key = self.graph.config_key;
        let graph = &mut self.graph;
        let mut anomalies = Vec::new();
        let mut ctx = EventContext {
            conditions: &graph.conditions,
            states: &graph.states,
            activations: &graph.activations,
            stats: &self.stats,
            config_key: key,
            shard_offset: self.shard_offset,
            anomalies: &mut anomalies,
        };
        let metrics = graph
            .producers
            .iter_mut()
            .filter_map(|p| p.on_dump_report(dump_time_ns, erase, &mut ctx))
            .collect();
        let report = ConfigMetricsReport {
            config_key: key,
            last_report_elapsed_ns: self.last_report_ns,
            current_report_elapsed_ns: dump_time_ns,
            metrics,
        };
        self.last_report_ns = dump_time_ns;
        self.dispatch_anomalies(anomalies);
        report
    }

    /// Fires due alarms; returns how many fired
    pub fn fire_alarms(&mut self, now_wall_ns: i64) -> usize {
        let key = self.graph.config_key;
        let mut fired = 0;
        for alarm in self.graph.alarms.iter_mut() {
            if !alarm.fire_if_due(now_wall_ns) {
                continue;
            }
            fired += 1;
            self.stats.note_alarm_fired(key, alarm.id);
            for subscription in select_subscriptions(&alarm.subscriptions) {
                self.sink.notify(Notification {
                    config_key: key,
                    rule_type: RuleType::Alarm,
                    rule_id: alarm.id,
                    subscription_id: subscription.id,
                    subscriber: subscription.subscriber.clone().unwrap_or_default(),
                    metric_id: None,
                    dimension: None,
                    timestamp_ns: now_wall_ns,
                });
            }
        }
        fired
    }

    pub fn next_alarm_ns(&self) -> Option<i64> {
        self.graph.alarms.iter().map(|a| a.next_fire_ns()).min()
    }

    pub fn snapshot_activations(&self, now_ns: i64) -> Vec<ActivationRecord> {
        self.graph.activations.snapshot(now_ns)
    }

    pub fn load_activations(&mut self, records: &[ActivationRecord], now_ns: i64) {
        self.graph.activations.load(records, now_ns);
    }

    pub fn take_restricted_batches(&mut self) -> Vec<RestrictedBatch> {
        self.graph
            .producers
            .iter_mut()
            .filter_map(|p| p.take_restricted_batch())
            .collect()
    }

    pub fn requeue_restricted_batch(&mut self, batch: RestrictedBatch) {
        let index = self.graph.metric_ids.get(&batch.metric_id).copied();
        if let Some(index) = index {
            self.graph.producers[index].requeue_restricted_batch(batch);
        }
    }

    pub fn mark_restricted_table_created(&mut self, metric_id: i64) {
        if let Some(&index) = self.graph.metric_ids.get(&metric_id) {
            self.graph.producers[index].mark_restricted_table_created();
        }
    }

    /// Last restriction category of each restricted metric that has seen an event
    pub fn restricted_categories(&self) -> BTreeMap<i64, i32> {
        self.graph
            .producers
            .iter()
            .filter_map(|p| p.restricted_category().map(|category| (p.id, category)))
            .collect()
    }

    pub fn load_restricted_categories(&mut self, categories: &BTreeMap<i64, i32>) {
        for (metric_id, category) in categories {
            if let Some(&index) = self.graph.metric_ids.get(metric_id) {
                self.graph.producers[index].restore_restricted_category(*category);
            }
        }
    }

    /// Activation state of every metric, keyed by metric id
    pub fn active_metrics(&self, now_ns: i64) -> HashMap<i64, bool> {
        self.graph
            .producers
            .iter()
            .map(|p| (p.id, p.is_active(&self.graph.activations, now_ns)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::ChannelSink;
    use crate::compiler::compile;
    use crate::config::{
        AlarmDef, AlertDef, AtomMatcher, CountMetric, DimensionalSamplingInfo, DurationMetric,
        EventActivation, EventMetric, FieldValueMatcher, MetricActivation, Predicate,
        SimpleAtomMatcher, SimplePredicate, StateDef, SubscriptionDef, TelemetryConfig,
        ValueMatcher,
    };
    use crate::event::{FieldRef, StateAnnotations, Value};
    use crate::metrics::MetricData;
    use tokio::sync::mpsc::UnboundedReceiver;

    const SEC: i64 = 1_000_000_000;

    fn config() -> TelemetryConfig {
        let mut config = TelemetryConfig::new(1);
        config.atom_matchers = vec![
            AtomMatcher::simple(1, SimpleAtomMatcher::new(10)),
            AtomMatcher::simple(2, SimpleAtomMatcher::new(11)),
            AtomMatcher::simple(3, SimpleAtomMatcher::new(12)),
        ];
        config.predicates = vec![Predicate::simple(
            20,
            SimplePredicate {
                start: Some(2),
                stop: Some(3),
                ..SimplePredicate::default()
            },
        )];
        config
    }

    fn manager(config: &TelemetryConfig) -> (MetricsManager, UnboundedReceiver<Notification>) {
        sharded_manager(config, 0)
    }

    fn sharded_manager(
        config: &TelemetryConfig,
        shard_offset: u32,
    ) -> (MetricsManager, UnboundedReceiver<Notification>) {
        let graph = compile(config, ConfigKey::new(0, config.id), 0, 0).unwrap();
        let (sink, rx) = ChannelSink::new();
        let manager = MetricsManager::new(
            graph,
            Arc::new(DaemonStats::new()),
            Arc::new(sink),
            shard_offset,
        );
        (manager, rx)
    }

    fn counts(report: &ConfigMetricsReport, metric_id: i64) -> Vec<i64> {
        let metric = report
            .metrics
            .iter()
            .find(|m| m.metric_id == metric_id)
            .unwrap();
        match &metric.data {
            MetricData::Count(rows) | MetricData::Duration(rows) => rows
                .iter()
                .flat_map(|d| d.buckets.iter().map(|b| b.value))
                .collect(),
            other => panic!("unexpected data {other:?}"),
        }
    }

    #[test]
    fn test_condition_gates_count() {
        let mut c = config();
        c.count_metrics = vec![CountMetric {
            id: 100,
            what: Some(1),
            condition: Some(20),
            ..CountMetric::default()
        }];
        let (mut m, _rx) = manager(&c);
        m.on_log_event(&LogEvent::new(10, 1));
        m.on_log_event(&LogEvent::new(11, 2));
        m.on_log_event(&LogEvent::new(10, 3));
        m.on_log_event(&LogEvent::new(12, 4));
        m.on_log_event(&LogEvent::new(10, 5));
        assert_eq!(counts(&m.dump_report(10, false), 100), vec![1]);
    }

    #[test]
    fn test_dump_without_erase_is_idempotent() {
        let mut c = config();
        c.count_metrics = vec![CountMetric {
            id: 100,
            what: Some(1),
            ..CountMetric::default()
        }];
        let (mut m, _rx) = manager(&c);
        m.on_log_event(&LogEvent::new(10, 1));
        m.on_log_event(&LogEvent::new(10, 2));
        let first = m.dump_report(50, false);
        let second = m.dump_report(50, false);
        assert_eq!(first.metrics, second.metrics);
        assert_eq!(counts(&m.dump_report(60, true), 100), vec![2]);
        assert!(m.dump_report(70, false).metrics[0].data.is_empty());
    }

    #[test]
    fn test_activation_and_deactivation() {
        let mut c = config();
        c.count_metrics = vec![CountMetric {
            id: 100,
            what: Some(1),
            ..CountMetric::default()
        }];
        c.metric_activations = vec![MetricActivation {
            metric_id: 100,
            activation_type: Default::default(),
            event_activation: vec![EventActivation {
                atom_matcher_id: 2,
                ttl_seconds: 10,
                deactivation_atom_matcher_id: Some(3),
                activation_type: None,
            }],
        }];
        let (mut m, _rx) = manager(&c);
        m.on_log_event(&LogEvent::new(10, 1));
        m.on_log_event(&LogEvent::new(11, 2));
        m.on_log_event(&LogEvent::new(10, 3));
        m.on_log_event(&LogEvent::new(12, 4));
        m.on_log_event(&LogEvent::new(10, 5));
        m.on_log_event(&LogEvent::new(11, 6));
        m.on_log_event(&LogEvent::new(10, 7));
        // TTL of 10s expires
        m.on_log_event(&LogEvent::new(10, 6 + 10 * SEC));
        assert_eq!(counts(&m.dump_report(20 * SEC, false), 100), vec![2]);
        assert_eq!(m.active_metrics(20 * SEC).get(&100), Some(&false));
    }

    #[test]
    fn test_anomaly_notifies_subscribers() {
        let mut c = config();
        c.count_metrics = vec![CountMetric {
            id: 100,
            what: Some(1),
            ..CountMetric::default()
        }];
        c.alerts = vec![AlertDef {
            id: 7,
            metric_id: 100,
            num_buckets: 1,
            refractory_period_secs: 3600,
            trigger_if_sum_gt: Some(1.0),
        }];
        c.subscriptions = vec![SubscriptionDef {
            id: 8,
            rule_type: RuleType::Alert,
            rule_id: 7,
            subscriber: Some("incidentd".into()),
            probability_of_informing: 1.0,
        }];
        let (mut m, mut rx) = manager(&c);
        for ts in 1..=4 {
            m.on_log_event(&LogEvent::new(10, ts));
        }
        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.rule_id, 7);
        assert_eq!(notification.subscription_id, 8);
        assert_eq!(notification.timestamp_ns, 2);
        assert!(rx.try_recv().is_err());
        let stats = m.stats.config_stats(m.config_key()).unwrap();
        assert_eq!(stats.alert_stats.get(&7), Some(&1));
    }

    #[test]
    fn test_alarm_fires_through_sink() {
        let mut c = config();
        c.alarms = vec![AlarmDef {
            id: 3,
            offset_millis: 1,
            period_millis: 1000,
        }];
        c.subscriptions = vec![SubscriptionDef {
            id: 4,
            rule_type: RuleType::Alarm,
            rule_id: 3,
            subscriber: Some("watcher".into()),
            probability_of_informing: 1.0,
        }];
        let (mut m, mut rx) = manager(&c);
        assert_eq!(m.next_alarm_ns(), Some(1_000_000));
        assert_eq!(m.fire_alarms(0), 0);
        assert_eq!(m.fire_alarms(2_000_000), 1);
        assert_eq!(rx.try_recv().unwrap().rule_type, RuleType::Alarm);
    }

    #[test]
    fn test_state_change_splits_duration() {
        let mut c = config();
        c.states = vec![StateDef {
            id: 40,
            atom_id: 50,
            map: None,
        }];
        c.duration_metrics = vec![DurationMetric {
            id: 200,
            what: Some(20),
            slice_by_state: vec![40],
            ..DurationMetric::default()
        }];
        let (mut m, _rx) = manager(&c);
        let screen = |ts: i64, value: i32| {
            LogEvent::new(50, ts)
                .with_value(Value::Int(value))
                .with_state_annotations(StateAnnotations::default())
        };
        m.on_log_event(&screen(0, 1));
        m.on_log_event(&LogEvent::new(11, 10));
        m.on_log_event(&screen(30, 2));
        m.on_log_event(&LogEvent::new(12, 100));
        let report = m.dump_report(200, false);
        let MetricData::Duration(rows) = &report.metrics[0].data else {
            panic!("expected duration data");
        };
        let mut by_state: Vec<(i64, i64)> = rows
            .iter()
            .map(|d| (d.dimension.states[0].value, d.buckets[0].value))
            .collect();
        by_state.sort();
        assert_eq!(by_state, vec![(1, 20), (2, 70)]);
    }

    #[test]
    fn test_event_metric_records_matching_atoms() {
        let mut c = config();
        let mut simple = SimpleAtomMatcher::new(13);
        simple.field_value_matcher.push(FieldValueMatcher {
            field: 1,
            position: None,
            value: ValueMatcher::GtInt(5),
        });
        c.atom_matchers.push(AtomMatcher::simple(4, simple));
        c.event_metrics = vec![EventMetric {
            id: 300,
            what: Some(4),
            ..EventMetric::default()
        }];
        let (mut m, _rx) = manager(&c);
        m.on_log_event(&LogEvent::new(13, 1).with_value(Value::Int(9)));
        m.on_log_event(&LogEvent::new(13, 2).with_value(Value::Int(1)));
        let report = m.dump_report(3, false);
        let MetricData::Event(rows) = &report.metrics[0].data else {
            panic!("expected event data");
        };
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].atom.resolve(&FieldRef::new(1)), vec![&Value::Int(9)]);
    }

    #[test]
    fn test_shard_offset_wraps_around_shard_count() {
        let mut c = config();
        c.count_metrics = vec![CountMetric {
            id: 100,
            what: Some(1),
            dimensions_in_what: vec![FieldRef::new(1)],
            dimensional_sampling_info: Some(DimensionalSamplingInfo {
                sampled_what_field: Some(FieldRef::new(1)),
                shard_count: 2,
            }),
            ..CountMetric::default()
        }];
        let total = |offset: u32| {
            let (mut m, _rx) = sharded_manager(&c, offset);
            for uid in 1..=20 {
                m.on_log_event(&LogEvent::new(10, i64::from(uid)).with_value(Value::Int(uid)));
            }
            counts(&m.dump_report(100, false), 100).iter().sum::<i64>()
        };
        let (even, odd) = (total(0), total(1));
        assert_eq!(even + odd, 20);
        assert!(odd > 0);
        assert_eq!(total(3), odd);
        assert_eq!(total(4), even);
    }
}
