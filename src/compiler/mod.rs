//! Config compiler
//!
//! Turns a [`TelemetryConfig`] into a [`CompiledGraph`]: flat vectors of matcher, condition and
//! metric trackers cross-referenced by index, plus the reverse maps the router needs to send an
//! event to exactly the trackers interested in it. Compilation is all or nothing; the first
//! invalid entry aborts with an [`InvalidConfigReason`].

mod metrics;
pub mod reason;
pub mod update;

pub use reason::{CompileResult, InvalidConfigReason, InvalidConfigReasonCode};
pub use update::{recompile, UpdateStatus, UpdateSummary};

use crate::anomaly::{AlarmTracker, AnomalyTracker};
use crate::condition::{self, ConditionTracker};
use crate::config::{ConfigKey, DurationAggregation, MetricActivation, RuleType, TelemetryConfig};
use crate::hash::content_hash;
use crate::matcher::{self, MatcherTracker};
use crate::metrics::{ActivationStore, MetricKind, MetricProducer};
use crate::state::StateRegistry;
use metrics::MetricBuilder;
use std::collections::{BTreeSet, HashMap};

/// Executable form of one configuration
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    pub config_key: ConfigKey,
    pub hash: u64,
    pub time_base_ns: i64,
    pub matchers: Vec<MatcherTracker>,
    pub conditions: Vec<ConditionTracker>,
    pub states: StateRegistry,
    pub producers: Vec<MetricProducer>,
    pub activations: ActivationStore,
    pub alarms: Vec<AlarmTracker>,
    pub matcher_ids: HashMap<i64, usize>,
    pub condition_ids: HashMap<i64, usize>,
    pub metric_ids: HashMap<i64, usize>,
    /// Atom id to the matchers that can match it
    pub atom_matchers: HashMap<i32, Vec<usize>>,
    /// Matcher to every condition whose value it can change
    pub matcher_conditions: HashMap<usize, Vec<usize>>,
    /// Matcher to the producers consuming its events
    pub matcher_metrics: HashMap<usize, Vec<usize>>,
    /// Matcher to the producers it activates or deactivates
    pub activation_metrics: HashMap<usize, Vec<usize>>,
    /// Condition to the producers reading it
    pub condition_metrics: HashMap<usize, Vec<usize>>,
    pub restricted_delegate: Option<String>,
    pub restricted_ttl_ns: i64,
}

impl CompiledGraph {
    pub fn is_restricted(&self) -> bool {
        self.restricted_delegate.is_some()
    }

    /// Every atom id this graph wants to see
    pub fn interesting_atom_ids(&self) -> BTreeSet<i32> {
        let mut atoms: BTreeSet<i32> = self.atom_matchers.keys().copied().collect();
        atoms.extend(self.states.state_atoms());
        atoms
    }

    pub fn producer(&self, metric_id: i64) -> Option<&MetricProducer> {
        self.metric_ids
            .get(&metric_id)
            .map(|&index| &self.producers[index])
    }
}

fn check_duplicates<'a>(
    ids: impl IntoIterator<Item = &'a i64>,
    reason: impl Fn(i64) -> InvalidConfigReason,
) -> CompileResult<HashMap<i64, usize>> {
    let mut map = HashMap::new();
    for (index, &id) in ids.into_iter().enumerate() {
        if map.insert(id, index).is_some() {
            return Err(reason(id));
        }
    }
    Ok(map)
}

/// Compiles `config` for `key`. Buckets are aligned to `time_base_ns`; alarms start at `wall_ns`.
pub fn compile(
    config: &TelemetryConfig,
    key: ConfigKey,
    time_base_ns: i64,
    wall_ns: i64,
) -> CompileResult<CompiledGraph> {
    tracing::debug!(
        "Compiling config {} ({} matchers, {} predicates, {} metrics)",
        key,
        config.atom_matchers.len(),
        config.predicates.len(),
        config.metric_count()
    );

    // Matchers
    let matcher_ids = check_duplicates(config.atom_matchers.iter().map(|m| &m.id), |id| {
        InvalidConfigReason::matcher(InvalidConfigReasonCode::MatcherDuplicate, id)
    })?;
    let mut matchers = config
        .atom_matchers
        .iter()
        .enumerate()
        .map(|(index, m)| MatcherTracker::create(m, index))
        .collect::<CompileResult<Vec<_>>>()?;
    matcher::init_matchers(&mut matchers, &matcher_ids)?;

    // Conditions
    let condition_ids = check_duplicates(config.predicates.iter().map(|p| &p.id), |id| {
        InvalidConfigReason::condition(InvalidConfigReasonCode::ConditionDuplicate, id)
    })?;
    let mut conditions = config
        .predicates
        .iter()
        .enumerate()
        .map(|(index, p)| ConditionTracker::create(p, index))
        .collect::<CompileResult<Vec<_>>>()?;
    condition::init_conditions(&mut conditions, &condition_ids, &matcher_ids)?;

    // States
    let mut states = StateRegistry::build(&config.states)?;

    // Metrics
    let mut activation_table: HashMap<i64, &MetricActivation> = HashMap::new();
    for activation in &config.metric_activations {
        if activation_table
            .insert(activation.metric_id, activation)
            .is_some()
        {
            return Err(InvalidConfigReason::metric(
                InvalidConfigReasonCode::MetricHasMultipleActivations,
                activation.metric_id,
            ));
        }
    }
    let mut activations = ActivationStore::default();
    let builder = MetricBuilder {
        config,
        matchers: &matchers,
        matcher_ids: &matcher_ids,
        conditions: &conditions,
        condition_ids: &condition_ids,
        states: &states,
        activation_table: &activation_table,
        time_base_ns,
    };
    let mut producers = builder.build_all(&mut activations)?;
    let mut metric_ids = HashMap::new();
    for producer in &producers {
        if metric_ids.insert(producer.id, producer.index).is_some() {
            return Err(InvalidConfigReason::metric(
                InvalidConfigReasonCode::MetricDuplicate,
                producer.id,
            ));
        }
    }
    if let Some(orphan) = activation_table
        .keys()
        .find(|id| !metric_ids.contains_key(id))
    {
        return Err(InvalidConfigReason::metric(
            InvalidConfigReasonCode::MetricActivationNotFound,
            *orphan,
        ));
    }
    for id in &config.no_report_metrics {
        let Some(&index) = metric_ids.get(id) else {
            return Err(InvalidConfigReason::metric(
                InvalidConfigReasonCode::NoReportMetricNotFound,
                *id,
            ));
        };
        producers[index].no_report = true;
    }

    // Alerts
    let mut alert_ids = HashMap::new();
    for alert in &config.alerts {
        if alert_ids.insert(alert.id, alert.metric_id).is_some() {
            return Err(InvalidConfigReason::alert(
                InvalidConfigReasonCode::AlertDuplicate,
                alert.id,
            ));
        }
        let Some(&index) = metric_ids.get(&alert.metric_id) else {
            return Err(InvalidConfigReason::alert(
                InvalidConfigReasonCode::AlertMetricNotFound,
                alert.id,
            )
            .with_metric(alert.metric_id));
        };
        let Some(threshold) = alert.trigger_if_sum_gt else {
            return Err(InvalidConfigReason::alert(
                InvalidConfigReasonCode::AlertThresholdMissing,
                alert.id,
            ));
        };
        if threshold < 0.0 || alert.num_buckets <= 0 {
            return Err(InvalidConfigReason::alert(
                InvalidConfigReasonCode::AlertInvalidTriggerOrNumBuckets,
                alert.id,
            ));
        }
        let producer = &mut producers[index];
        if !producer.kind.supports_anomaly()
            || !threshold_reachable(producer, alert.num_buckets, threshold)
        {
            return Err(InvalidConfigReason::alert(
                InvalidConfigReasonCode::AlertCannotAddAnomaly,
                alert.id,
            )
            .with_metric(alert.metric_id));
        }
        producer
            .anomaly_trackers
            .push(AnomalyTracker::new(alert, threshold));
    }

    // Alarms
    let mut alarm_ids = HashMap::new();
    let mut alarms = Vec::with_capacity(config.alarms.len());
    for alarm in &config.alarms {
        if alarm_ids.insert(alarm.id, alarms.len()).is_some() {
            return Err(InvalidConfigReason::alarm(
                InvalidConfigReasonCode::AlarmDuplicate,
                alarm.id,
            ));
        }
        if alarm.offset_millis <= 0 {
            return Err(InvalidConfigReason::alarm(
                InvalidConfigReasonCode::AlarmOffsetLessThanOrEqualZero,
                alarm.id,
            ));
        }
        if alarm.period_millis <= 0 {
            return Err(InvalidConfigReason::alarm(
                InvalidConfigReasonCode::AlarmPeriodLessThanOrEqualZero,
                alarm.id,
            ));
        }
        let Some(tracker) = AlarmTracker::new(alarm, wall_ns) else {
            return Err(InvalidConfigReason::alarm(
                InvalidConfigReasonCode::AlarmOutOfRange,
                alarm.id,
            ));
        };
        alarms.push(tracker);
    }

    // Subscriptions
    let mut subscription_ids = BTreeSet::new();
    for subscription in &config.subscriptions {
        if !subscription_ids.insert(subscription.id) {
            return Err(InvalidConfigReason::subscription(
                InvalidConfigReasonCode::SubscriptionDuplicate,
                subscription.id,
            ));
        }
        if subscription
            .subscriber
            .as_deref()
            .map_or(true, |s| s.trim().is_empty())
        {
            return Err(InvalidConfigReason::subscription(
                InvalidConfigReasonCode::SubscriptionSubscriberInfoMissing,
                subscription.id,
            ));
        }
        let bound = match subscription.rule_type {
            RuleType::Alert => {
                let tracker = alert_ids
                    .get(&subscription.rule_id)
                    .and_then(|metric_id| metric_ids.get(metric_id))
                    .and_then(|&index| {
                        producers[index]
                            .anomaly_trackers
                            .iter()
                            .position(|t| t.alert_id == subscription.rule_id)
                            .map(|position| (index, position))
                    });
                match tracker {
                    Some((index, position)) => {
                        producers[index].anomaly_trackers[position]
                            .subscriptions
                            .push(subscription.clone());
                        true
                    }
                    None => false,
                }
            }
            RuleType::Alarm => match alarm_ids.get(&subscription.rule_id) {
                Some(&index) => {
                    alarms[index].subscriptions.push(subscription.clone());
                    true
                }
                None => false,
            },
        };
        if !bound {
            return Err(InvalidConfigReason::subscription(
                InvalidConfigReasonCode::SubscriptionRuleNotFound,
                subscription.id,
            ));
        }
    }

    // Sliced state registration
    for producer in &producers {
        for sliced in &producer.sliced_states {
            if config
                .whitelisted_atom_ids
                .contains(&sliced.definition.atom_id)
            {
                return Err(InvalidConfigReason::metric(
                    InvalidConfigReasonCode::MetricSlicedStateAtomAllowedFromAnyUid,
                    producer.id,
                )
                .with_state(sliced.definition.id));
            }
            states.register_listener(sliced.definition.atom_id, producer.index);
        }
    }

    let mut graph = CompiledGraph {
        config_key: key,
        hash: content_hash(config),
        time_base_ns,
        matchers,
        conditions,
        states,
        producers,
        activations,
        alarms,
        matcher_ids,
        condition_ids,
        metric_ids,
        atom_matchers: HashMap::new(),
        matcher_conditions: HashMap::new(),
        matcher_metrics: HashMap::new(),
        activation_metrics: HashMap::new(),
        condition_metrics: HashMap::new(),
        restricted_delegate: config.restricted_metrics_delegate.clone(),
        restricted_ttl_ns: config.restricted_ttl_ns(),
    };
    build_index_maps(&mut graph);

    tracing::info!(
        "Compiled config {}: {} matchers, {} conditions, {} metrics, {} alarms",
        key,
        graph.matchers.len(),
        graph.conditions.len(),
        graph.producers.len(),
        graph.alarms.len()
    );
    Ok(graph)
}

/// Whether a window of `num_buckets` buckets can ever sum above `threshold`
fn threshold_reachable(producer: &MetricProducer, num_buckets: i32, threshold: f64) -> bool {
    match &producer.kind {
        MetricKind::Duration(state) => {
            let bucket = producer.bucket_size_ns() as f64;
            let max = match state.aggregation() {
                DurationAggregation::Sum => bucket * f64::from(num_buckets),
                DurationAggregation::MaxSparse => bucket,
            };
            threshold <= max
        }
        _ => true,
    }
}

fn condition_subtree(conditions: &[ConditionTracker], root: usize, out: &mut BTreeSet<usize>) {
    if out.insert(root) {
        for &child in conditions[root].children() {
            condition_subtree(conditions, child, out);
        }
    }
}

fn build_index_maps(graph: &mut CompiledGraph) {
    for tracker in &graph.matchers {
        for &atom in &tracker.atom_ids {
            graph
                .atom_matchers
                .entry(atom)
                .or_default()
                .push(tracker.index);
        }
    }

    for tracker in &graph.conditions {
        for &m in &tracker.matcher_indices {
            graph
                .matcher_conditions
                .entry(m)
                .or_default()
                .push(tracker.index);
        }
    }

    for producer in &graph.producers {
        for &m in &producer.event_matchers {
            graph
                .matcher_metrics
                .entry(m)
                .or_default()
                .push(producer.index);
        }

        let activation_matchers: BTreeSet<usize> = producer
            .activation
            .on_matcher
            .keys()
            .chain(producer.activation.deactivate_on_matcher.keys())
            .copied()
            .collect();
        for m in activation_matchers {
            graph
                .activation_metrics
                .entry(m)
                .or_default()
                .push(producer.index);
        }

        let mut read_conditions = BTreeSet::new();
        if let Some(root) = producer.condition_index {
            condition_subtree(&graph.conditions, root, &mut read_conditions);
        }
        for link in &producer.links {
            read_conditions.insert(link.condition_index);
        }
        for c in read_conditions {
            graph
                .condition_metrics
                .entry(c)
                .or_default()
                .push(producer.index);
        }
    }
}
