//! Hot reload of an installed configuration
//!
//! A recompiled graph is built from scratch, then every tracker whose content and dependencies
//! are unchanged takes over the runtime state of its predecessor. Activations and state values
//! are copied forward by stable id regardless of status.

use super::{compile, CompileResult, CompiledGraph};
use crate::condition::ConditionKind;
use crate::config::{ConfigKey, TelemetryConfig};
use crate::matcher::MatcherKind;
use crate::metrics::MetricProducer;
use serde::Serialize;

/// How one tracker of the new graph relates to the previous graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpdateStatus {
    /// Id absent from the previous graph
    New,
    /// Content or a dependency changed
    Replace,
    /// Same content and dependencies; runtime state is carried over
    Preserve,
}

impl UpdateStatus {
    fn merge(self, dependency: UpdateStatus) -> UpdateStatus {
        match (self, dependency) {
            (UpdateStatus::Preserve, UpdateStatus::Preserve) => UpdateStatus::Preserve,
            (UpdateStatus::New, _) => UpdateStatus::New,
            _ => UpdateStatus::Replace,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateSummary {
    pub new_metrics: Vec<i64>,
    pub replaced_metrics: Vec<i64>,
    pub preserved_metrics: Vec<i64>,
    pub preserved_conditions: usize,
    pub carried_activations: usize,
}

/// Recompiles `config` on top of `previous`, keeping the previous time base
pub fn recompile(
    config: &TelemetryConfig,
    key: ConfigKey,
    previous: &CompiledGraph,
    wall_ns: i64,
) -> CompileResult<(CompiledGraph, UpdateSummary)> {
    let mut graph = compile(config, key, previous.time_base_ns, wall_ns)?;
    let mut summary = UpdateSummary::default();

    // The new graph already passed cycle detection, so the recursive walks below terminate.
    let mut classifier = Classifier::new(&graph, previous);
    for index in 0..graph.matchers.len() {
        classifier.matcher_status(index);
    }
    for index in 0..graph.conditions.len() {
        classifier.condition_status(index);
    }
    let condition_statuses = classifier.conditions.clone();
    let metric_statuses: Vec<UpdateStatus> = graph
        .producers
        .iter()
        .map(|producer| classifier.metric_status(producer))
        .collect();

    for (tracker, status) in graph.conditions.iter_mut().zip(&condition_statuses) {
        if *status != Some(UpdateStatus::Preserve) {
            continue;
        }
        if let Some(&old_index) = previous.condition_ids.get(&tracker.id) {
            tracker.carry_state_from(&previous.conditions[old_index]);
            summary.preserved_conditions += 1;
        }
    }

    for (producer, status) in graph.producers.iter_mut().zip(metric_statuses) {
        match status {
            UpdateStatus::New => summary.new_metrics.push(producer.id),
            UpdateStatus::Replace => {
                if let Some(old) = previous.producer(producer.id) {
                    producer.carry_restricted_table_from(old);
                }
                summary.replaced_metrics.push(producer.id);
            }
            UpdateStatus::Preserve => {
                if let Some(old) = previous.producer(producer.id) {
                    producer.carry_state_from(old);
                }
                summary.preserved_metrics.push(producer.id);
            }
        }
    }

    summary.carried_activations = graph.activations.carry_forward_from(&previous.activations);
    graph.states.carry_values_from(&previous.states);

    tracing::info!(
        "Updated config {}: {} new, {} replaced, {} preserved metrics, {} activations carried",
        key,
        summary.new_metrics.len(),
        summary.replaced_metrics.len(),
        summary.preserved_metrics.len(),
        summary.carried_activations
    );
    Ok((graph, summary))
}

struct Classifier<'a> {
    graph: &'a CompiledGraph,
    previous: &'a CompiledGraph,
    matchers: Vec<Option<UpdateStatus>>,
    conditions: Vec<Option<UpdateStatus>>,
}

impl<'a> Classifier<'a> {
    fn new(graph: &'a CompiledGraph, previous: &'a CompiledGraph) -> Self {
        Self {
            graph,
            previous,
            matchers: vec![None; graph.matchers.len()],
            conditions: vec![None; graph.conditions.len()],
        }
    }

    fn matcher_status(&mut self, index: usize) -> UpdateStatus {
        if let Some(status) = self.matchers[index] {
            return status;
        }
        let tracker = &self.graph.matchers[index];
        let mut status = match self.previous.matcher_ids.get(&tracker.id) {
            None => UpdateStatus::New,
            Some(&old) if self.previous.matchers[old].hash != tracker.hash => UpdateStatus::Replace,
            Some(_) => UpdateStatus::Preserve,
        };
        if let MatcherKind::Combination { children, .. } = &tracker.kind {
            for &child in children {
                status = status.merge(self.matcher_status(child));
            }
        }
        self.matchers[index] = Some(status);
        status
    }

    fn condition_status(&mut self, index: usize) -> UpdateStatus {
        if let Some(status) = self.conditions[index] {
            return status;
        }
        let tracker = &self.graph.conditions[index];
        let mut status = match self.previous.condition_ids.get(&tracker.id) {
            None => UpdateStatus::New,
            Some(&old) if self.previous.conditions[old].hash != tracker.hash => {
                UpdateStatus::Replace
            }
            Some(_) => UpdateStatus::Preserve,
        };
        match &tracker.kind {
            ConditionKind::Simple(simple) => {
                for matcher in [simple.start, simple.stop, simple.stop_all]
                    .into_iter()
                    .flatten()
                {
                    status = status.merge(self.matcher_status(matcher));
                }
            }
            ConditionKind::Combination { children, .. } => {
                for &child in children {
                    status = status.merge(self.condition_status(child));
                }
            }
        }
        self.conditions[index] = Some(status);
        status
    }

    fn metric_status(&mut self, producer: &MetricProducer) -> UpdateStatus {
        let mut status = match self.previous.producer(producer.id) {
            None => return UpdateStatus::New,
            Some(old)
                if old.hash != producer.hash
                    || old.kind.type_name() != producer.kind.type_name() =>
            {
                UpdateStatus::Replace
            }
            Some(_) => UpdateStatus::Preserve,
        };

        let matchers = producer
            .event_matchers
            .iter()
            .chain(producer.activation.on_matcher.keys())
            .chain(producer.activation.deactivate_on_matcher.keys())
            .copied()
            .collect::<Vec<_>>();
        for matcher in matchers {
            status = status.merge(self.matcher_status(matcher));
        }

        let conditions = producer
            .condition_index
            .into_iter()
            .chain(producer.links.iter().map(|l| l.condition_index))
            .collect::<Vec<_>>();
        for condition in conditions {
            status = status.merge(self.condition_status(condition));
        }

        for sliced in &producer.sliced_states {
            let unchanged = self
                .previous
                .states
                .definition(sliced.definition.id)
                .is_some_and(|old| old.hash == sliced.definition.hash);
            if !unchanged {
                status = UpdateStatus::Replace;
            }
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AtomMatcher, CountMetric, EventActivation, LogicalOperation, MetricActivation, Predicate,
        SimpleAtomMatcher, SimplePredicate,
    };
    use crate::metrics::ActivationKey;

    fn key() -> ConfigKey {
        ConfigKey::new(0, 1)
    }

    fn config() -> TelemetryConfig {
        let mut config = TelemetryConfig::new(1);
        config.atom_matchers = vec![
            AtomMatcher::simple(1, SimpleAtomMatcher::new(10)),
            AtomMatcher::simple(2, SimpleAtomMatcher::new(11)),
            AtomMatcher::combination(3, LogicalOperation::Or, vec![1, 2]),
        ];
        config.predicates = vec![Predicate::simple(
            20,
            SimplePredicate {
                start: Some(1),
                stop: Some(2),
                ..SimplePredicate::default()
            },
        )];
        config.count_metrics = vec![
            CountMetric {
                id: 100,
                what: Some(1),
                ..CountMetric::default()
            },
            CountMetric {
                id: 101,
                what: Some(3),
                condition: Some(20),
                ..CountMetric::default()
            },
        ];
        config.metric_activations = vec![MetricActivation {
            metric_id: 100,
            activation_type: Default::default(),
            event_activation: vec![EventActivation {
                atom_matcher_id: 2,
                ttl_seconds: 100,
                deactivation_atom_matcher_id: None,
                activation_type: None,
            }],
        }];
        config
    }

    #[test]
    fn test_unchanged_config_preserves_everything() {
        let previous = compile(&config(), key(), 0, 0).unwrap();
        let (graph, summary) = recompile(&config(), key(), &previous, 0).unwrap();
        assert_eq!(summary.preserved_metrics, vec![100, 101]);
        assert!(summary.new_metrics.is_empty());
        assert_eq!(summary.preserved_conditions, 1);
        assert_eq!(summary.carried_activations, 1);
        assert_eq!(graph.time_base_ns, previous.time_base_ns);
    }

    #[test]
    fn test_changed_child_matcher_replaces_dependents() {
        let previous = compile(&config(), key(), 0, 0).unwrap();
        let mut changed = config();
        changed.atom_matchers[1] = AtomMatcher::simple(2, SimpleAtomMatcher::new(12));
        changed.count_metrics.push(CountMetric {
            id: 102,
            what: Some(1),
            ..CountMetric::default()
        });
        let (_, summary) = recompile(&changed, key(), &previous, 0).unwrap();
        // 100 depends on matcher 2 through its activation; 101 through matcher 3 and predicate 20
        assert_eq!(summary.replaced_metrics, vec![100, 101]);
        assert_eq!(summary.new_metrics, vec![102]);
        assert_eq!(summary.preserved_conditions, 0);
    }

    #[test]
    fn test_activation_ttl_survives_replacement() {
        let mut previous = compile(&config(), key(), 0, 0).unwrap();
        let activation_key = ActivationKey {
            metric_id: 100,
            matcher_id: 2,
        };
        previous
            .activations
            .get_mut(&activation_key)
            .unwrap()
            .activate(1_000);

        let mut changed = config();
        changed.count_metrics[0].bucket = crate::config::TimeUnit::OneDay;
        let (graph, summary) = recompile(&changed, key(), &previous, 0).unwrap();
        assert_eq!(summary.replaced_metrics, vec![100]);
        let now = 50_000_000_000;
        assert_eq!(
            graph.activations.get(&activation_key).unwrap().remaining_ttl_ns(now),
            previous.activations.get(&activation_key).unwrap().remaining_ttl_ns(now)
        );
    }
}
