//! Metric producer construction

use super::reason::{CompileResult, InvalidConfigReason, InvalidConfigReasonCode as Code};
use crate::condition::{ConditionKind, ConditionTracker};
use crate::config::{
    CountMetric, DimensionalSamplingInfo, DurationAggregation, DurationMetric, EventMetric,
    GaugeMetric, GaugeSamplingType, KllMetric, MetricActivation, MetricConditionLink,
    MetricStateLink, TelemetryConfig, TimeUnit, ValueMetric,
};
use crate::event::{is_subset, FieldRef, Position};
use crate::hash::{combine, content_hash};
use crate::matcher::MatcherTracker;
use crate::metrics::count::CountState;
use crate::metrics::duration::DurationState;
use crate::metrics::event::EventState;
use crate::metrics::gauge::GaugeState;
use crate::metrics::kll::KllState;
use crate::metrics::restricted::RestrictedState;
use crate::metrics::value::ValueState;
use crate::metrics::{
    Activation, ActivationKey, ActivationStore, ActivationWiring, MetricKind, MetricProducer,
    ResolvedLink, Sampling, SlicedState, DEFAULT_DIMENSION_HARD_LIMIT, MAX_DIMENSION_HARD_LIMIT,
};
use crate::state::StateRegistry;
use serde::Serialize;
use std::collections::HashMap;

/// Fields every metric variant shares
struct CommonDef<'a> {
    id: i64,
    condition: Option<i64>,
    dimensions_in_what: &'a [FieldRef],
    links: &'a [MetricConditionLink],
    slice_by_state: &'a [i64],
    state_link: &'a [MetricStateLink],
    bucket: TimeUnit,
    sampling: Option<&'a DimensionalSamplingInfo>,
    max_dimensions: Option<usize>,
    /// Event metrics have no dimensions; their links apply to the raw atom
    check_link_subset: bool,
}

pub(super) struct MetricBuilder<'a> {
    pub config: &'a TelemetryConfig,
    pub matchers: &'a [MatcherTracker],
    pub matcher_ids: &'a HashMap<i64, usize>,
    pub conditions: &'a [ConditionTracker],
    pub condition_ids: &'a HashMap<i64, usize>,
    pub states: &'a StateRegistry,
    pub activation_table: &'a HashMap<i64, &'a MetricActivation>,
    pub time_base_ns: i64,
}

impl<'a> MetricBuilder<'a> {
    /// Builds every metric in variant order; producer index equals vector position
    pub fn build_all(&self, store: &mut ActivationStore) -> CompileResult<Vec<MetricProducer>> {
        let restricted = self.config.is_restricted();
        let mut producers = Vec::with_capacity(self.config.metric_count());

        if restricted {
            let unsupported = self
                .config
                .count_metrics
                .iter()
                .map(|m| m.id)
                .chain(self.config.duration_metrics.iter().map(|m| m.id))
                .chain(self.config.value_metrics.iter().map(|m| m.id))
                .chain(self.config.kll_metrics.iter().map(|m| m.id))
                .chain(self.config.gauge_metrics.iter().map(|m| m.id))
                .next();
            if let Some(id) = unsupported {
                return Err(InvalidConfigReason::metric(
                    Code::RestrictedMetricNotSupported,
                    id,
                ));
            }
        }

        for metric in &self.config.count_metrics {
            let index = producers.len();
            producers.push(self.build_count(metric, index, store)?);
        }
        for metric in &self.config.duration_metrics {
            let index = producers.len();
            producers.push(self.build_duration(metric, index, store)?);
        }
        for metric in &self.config.event_metrics {
            let index = producers.len();
            producers.push(self.build_event(metric, index, restricted, store)?);
        }
        for metric in &self.config.value_metrics {
            let index = producers.len();
            producers.push(self.build_value(metric, index, store)?);
        }
        for metric in &self.config.kll_metrics {
            let index = producers.len();
            producers.push(self.build_kll(metric, index, store)?);
        }
        for metric in &self.config.gauge_metrics {
            let index = producers.len();
            producers.push(self.build_gauge(metric, index, store)?);
        }
        Ok(producers)
    }

    fn metric_hash<T: Serialize>(&self, metric_id: i64, metric: &T) -> u64 {
        let hash = content_hash(metric);
        match self.activation_table.get(&metric_id) {
            Some(activation) => combine(hash, content_hash(activation)),
            None => hash,
        }
    }

    fn resolve_what(&self, metric_id: i64, what: Option<i64>) -> CompileResult<usize> {
        let what = what.ok_or_else(|| InvalidConfigReason::metric(Code::MetricMissingWhat, metric_id))?;
        self.matcher_ids.get(&what).copied().ok_or_else(|| {
            InvalidConfigReason::metric(Code::MetricMatcherNotFound, metric_id).with_matcher(what)
        })
    }

    fn resolve_matcher(&self, matcher_id: i64, code: Code, metric_id: i64) -> CompileResult<usize> {
        self.matcher_ids
            .get(&matcher_id)
            .copied()
            .ok_or_else(|| InvalidConfigReason::metric(code, metric_id).with_matcher(matcher_id))
    }

    fn check_single_atom(&self, def: &CommonDef<'_>, what_index: usize) -> CompileResult<()> {
        let matcher = &self.matchers[what_index];
        if !def.dimensions_in_what.is_empty() && matcher.atom_ids.len() > 1 {
            return Err(
                InvalidConfigReason::metric(Code::MetricMatcherMoreThanOneAtom, def.id)
                    .with_matcher(matcher.id),
            );
        }
        Ok(())
    }

    fn resolve_condition(
        &self,
        def: &CommonDef<'_>,
    ) -> CompileResult<(Option<usize>, Vec<ResolvedLink>)> {
        let condition_index = match def.condition {
            Some(id) => Some(self.condition_ids.get(&id).copied().ok_or_else(|| {
                InvalidConfigReason::metric(Code::MetricConditionNotFound, def.id)
                    .with_condition(id)
            })?),
            None => None,
        };
        if condition_index.is_none() && !def.links.is_empty() {
            return Err(InvalidConfigReason::metric(
                Code::MetricConditionLinkNoCondition,
                def.id,
            ));
        }

        let mut links = Vec::with_capacity(def.links.len());
        for link in def.links {
            let Some(&index) = self.condition_ids.get(&link.condition) else {
                return Err(
                    InvalidConfigReason::metric(Code::MetricConditionLinkNotFound, def.id)
                        .with_condition(link.condition),
                );
            };
            if link.fields_in_what.len() != link.fields_in_condition.len() {
                return Err(
                    InvalidConfigReason::metric(Code::MetricConditionLinkMalformed, def.id)
                        .with_condition(link.condition),
                );
            }
            if def.check_link_subset && !is_subset(&link.fields_in_what, def.dimensions_in_what) {
                return Err(InvalidConfigReason::metric(
                    Code::MetricConditionLinkNotSubsetDimensions,
                    def.id,
                )
                .with_condition(link.condition));
            }
            links.push(ResolvedLink {
                condition_index: index,
                fields_in_what: link.fields_in_what.clone(),
                fields_in_condition: link.fields_in_condition.clone(),
            });
        }
        Ok((condition_index, links))
    }

    fn resolve_states(&self, def: &CommonDef<'_>) -> CompileResult<Vec<SlicedState>> {
        if def.slice_by_state.is_empty() && !def.state_link.is_empty() {
            return Err(InvalidConfigReason::metric(Code::MetricStateLinkNoState, def.id));
        }
        for link in def.state_link {
            if !is_subset(&link.fields_in_what, def.dimensions_in_what) {
                return Err(InvalidConfigReason::metric(
                    Code::MetricStateLinkNotSubsetDimInWhat,
                    def.id,
                ));
            }
        }
        def.slice_by_state
            .iter()
            .map(|state_id| {
                let definition = self.states.definition(*state_id).ok_or_else(|| {
                    InvalidConfigReason::metric(Code::MetricStateNotFound, def.id)
                        .with_state(*state_id)
                })?;
                let link = def
                    .state_link
                    .iter()
                    .find(|l| l.state_atom_id == definition.atom_id)
                    .cloned();
                Ok(SlicedState {
                    definition: definition.clone(),
                    link,
                })
            })
            .collect()
    }

    fn resolve_sampling(&self, def: &CommonDef<'_>) -> CompileResult<Option<Sampling>> {
        let Some(info) = def.sampling else {
            return Ok(None);
        };
        let Some(field) = info.sampled_what_field else {
            return Err(InvalidConfigReason::metric(
                Code::MetricDimensionalSamplingInfoMissingSampledField,
                def.id,
            ));
        };
        if info.shard_count <= 1 {
            return Err(InvalidConfigReason::metric(
                Code::MetricDimensionalSamplingInfoIncorrectShardCount,
                def.id,
            ));
        }
        if matches!(field.position, Some(Position::All) | Some(Position::Any)) {
            return Err(InvalidConfigReason::metric(
                Code::MetricSampledFieldIncorrectSize,
                def.id,
            ));
        }
        if !is_subset(std::slice::from_ref(&field), def.dimensions_in_what) {
            return Err(InvalidConfigReason::metric(
                Code::MetricSampledFieldsNotSubsetDimInWhat,
                def.id,
            ));
        }
        Ok(Some(Sampling {
            field,
            shard_count: info.shard_count,
        }))
    }

    fn resolve_activation(
        &self,
        metric_id: i64,
        store: &mut ActivationStore,
    ) -> CompileResult<ActivationWiring> {
        let mut wiring = ActivationWiring::default();
        let Some(activation) = self.activation_table.get(&metric_id) else {
            return Ok(wiring);
        };
        for event_activation in &activation.event_activation {
            let matcher_index = self.resolve_matcher(
                event_activation.atom_matcher_id,
                Code::MetricActivationMatcherNotFound,
                metric_id,
            )?;
            let key = ActivationKey {
                metric_id,
                matcher_id: event_activation.atom_matcher_id,
            };
            let activation_type = event_activation
                .activation_type
                .unwrap_or(activation.activation_type);
            store.insert(
                key,
                Activation::new(
                    activation_type,
                    event_activation.ttl_seconds.saturating_mul(1_000_000_000),
                ),
            );
            wiring.on_matcher.insert(matcher_index, key);
            wiring.keys.push(key);

            if let Some(deactivation_id) = event_activation.deactivation_atom_matcher_id {
                let deactivation_index = self.resolve_matcher(
                    deactivation_id,
                    Code::MetricDeactivationMatcherNotFound,
                    metric_id,
                )?;
                wiring
                    .deactivate_on_matcher
                    .entry(deactivation_index)
                    .or_default()
                    .push(key);
            }
        }
        Ok(wiring)
    }

    /// Applies the shared wiring to a producer built by one of the variant builders
    fn finish(
        &self,
        def: &CommonDef<'_>,
        mut producer: MetricProducer,
        store: &mut ActivationStore,
    ) -> CompileResult<MetricProducer> {
        let (condition_index, links) = self.resolve_condition(def)?;
        producer.condition_index = condition_index;
        producer.links = links;
        producer.dimensions_in_what = def.dimensions_in_what.to_vec();
        producer.sliced_states = self.resolve_states(def)?;
        producer.sampling = self.resolve_sampling(def)?;
        producer.activation = self.resolve_activation(def.id, store)?;
        producer.dimension_hard_limit = def
            .max_dimensions
            .map_or(DEFAULT_DIMENSION_HARD_LIMIT, |limit| {
                limit.clamp(DEFAULT_DIMENSION_HARD_LIMIT, MAX_DIMENSION_HARD_LIMIT)
            });
        Ok(producer)
    }

    fn build_count(
        &self,
        metric: &CountMetric,
        index: usize,
        store: &mut ActivationStore,
    ) -> CompileResult<MetricProducer> {
        let def = CommonDef {
            id: metric.id,
            condition: metric.condition,
            dimensions_in_what: &metric.dimensions_in_what,
            links: &metric.links,
            slice_by_state: &metric.slice_by_state,
            state_link: &metric.state_link,
            bucket: metric.bucket,
            sampling: metric.dimensional_sampling_info.as_ref(),
            max_dimensions: metric.max_dimensions_per_bucket,
            check_link_subset: true,
        };
        let what_index = self.resolve_what(metric.id, metric.what)?;
        self.check_single_atom(&def, what_index)?;
        let producer = MetricProducer::new(
            metric.id,
            index,
            self.metric_hash(metric.id, metric),
            what_index,
            MetricKind::Count(CountState::default()),
            def.bucket.bucket_size_ns(),
            self.time_base_ns,
        );
        self.finish(&def, producer, store)
    }

    fn build_duration(
        &self,
        metric: &DurationMetric,
        index: usize,
        store: &mut ActivationStore,
    ) -> CompileResult<MetricProducer> {
        let def = CommonDef {
            id: metric.id,
            condition: metric.condition,
            dimensions_in_what: &metric.dimensions_in_what,
            links: &metric.links,
            slice_by_state: &metric.slice_by_state,
            state_link: &metric.state_link,
            bucket: metric.bucket,
            sampling: metric.dimensional_sampling_info.as_ref(),
            max_dimensions: metric.max_dimensions_per_bucket,
            check_link_subset: true,
        };
        let what = metric
            .what
            .ok_or_else(|| InvalidConfigReason::metric(Code::MetricMissingWhat, metric.id))?;
        let Some(&what_condition) = self.condition_ids.get(&what) else {
            return Err(
                InvalidConfigReason::metric(Code::DurationMetricWhatNotFound, metric.id)
                    .with_condition(what),
            );
        };
        let ConditionKind::Simple(simple) = &self.conditions[what_condition].kind else {
            return Err(
                InvalidConfigReason::metric(Code::DurationMetricWhatNotSimple, metric.id)
                    .with_condition(what),
            );
        };
        let Some(start) = simple.start else {
            return Err(
                InvalidConfigReason::metric(Code::DurationMetricMissingStart, metric.id)
                    .with_condition(what),
            );
        };
        if metric.aggregation_type == DurationAggregation::MaxSparse
            && !metric.slice_by_state.is_empty()
        {
            return Err(InvalidConfigReason::metric(
                Code::DurationMetricMaxSparseHasSliceByState,
                metric.id,
            ));
        }
        self.check_single_atom(&def, start)?;

        let state = DurationState::new(
            metric.aggregation_type,
            start,
            simple.stop,
            simple.stop_all,
            simple.count_nesting,
        );
        let mut producer = MetricProducer::new(
            metric.id,
            index,
            self.metric_hash(metric.id, metric),
            start,
            MetricKind::Duration(state),
            def.bucket.bucket_size_ns(),
            self.time_base_ns,
        );
        producer
            .event_matchers
            .extend(simple.stop.into_iter().chain(simple.stop_all));
        self.finish(&def, producer, store)
    }

    fn build_event(
        &self,
        metric: &EventMetric,
        index: usize,
        restricted: bool,
        store: &mut ActivationStore,
    ) -> CompileResult<MetricProducer> {
        let def = CommonDef {
            id: metric.id,
            condition: metric.condition,
            dimensions_in_what: &[],
            links: &metric.links,
            slice_by_state: &[],
            state_link: &[],
            bucket: TimeUnit::default(),
            sampling: None,
            max_dimensions: None,
            check_link_subset: false,
        };
        let what_index = self.resolve_what(metric.id, metric.what)?;
        let kind = if restricted {
            MetricKind::Restricted(RestrictedState::default())
        } else {
            MetricKind::Event(EventState::default())
        };
        let producer = MetricProducer::new(
            metric.id,
            index,
            self.metric_hash(metric.id, metric),
            what_index,
            kind,
            def.bucket.bucket_size_ns(),
            self.time_base_ns,
        );
        self.finish(&def, producer, store)
    }

    fn build_value(
        &self,
        metric: &ValueMetric,
        index: usize,
        store: &mut ActivationStore,
    ) -> CompileResult<MetricProducer> {
        let def = CommonDef {
            id: metric.id,
            condition: metric.condition,
            dimensions_in_what: &metric.dimensions_in_what,
            links: &metric.links,
            slice_by_state: &metric.slice_by_state,
            state_link: &metric.state_link,
            bucket: metric.bucket,
            sampling: metric.dimensional_sampling_info.as_ref(),
            max_dimensions: metric.max_dimensions_per_bucket,
            check_link_subset: true,
        };
        let what_index = self.resolve_what(metric.id, metric.what)?;
        if metric.value_field.is_empty() {
            return Err(InvalidConfigReason::metric(
                Code::ValueMetricMissingValueField,
                metric.id,
            ));
        }
        if metric
            .value_field
            .iter()
            .any(|f| f.position == Some(Position::All))
        {
            return Err(InvalidConfigReason::metric(
                Code::ValueMetricValueFieldHasPositionAll,
                metric.id,
            ));
        }
        self.check_single_atom(&def, what_index)?;
        let producer = MetricProducer::new(
            metric.id,
            index,
            self.metric_hash(metric.id, metric),
            what_index,
            MetricKind::Value(ValueState::new(
                metric.value_field.clone(),
                metric.aggregation_type,
            )),
            def.bucket.bucket_size_ns(),
            self.time_base_ns,
        );
        self.finish(&def, producer, store)
    }

    fn build_kll(
        &self,
        metric: &KllMetric,
        index: usize,
        store: &mut ActivationStore,
    ) -> CompileResult<MetricProducer> {
        let def = CommonDef {
            id: metric.id,
            condition: metric.condition,
            dimensions_in_what: &metric.dimensions_in_what,
            links: &metric.links,
            slice_by_state: &metric.slice_by_state,
            state_link: &metric.state_link,
            bucket: metric.bucket,
            sampling: metric.dimensional_sampling_info.as_ref(),
            max_dimensions: metric.max_dimensions_per_bucket,
            check_link_subset: true,
        };
        let what_index = self.resolve_what(metric.id, metric.what)?;
        let Some(kll_field) = metric.kll_field else {
            return Err(InvalidConfigReason::metric(
                Code::KllMetricMissingKllField,
                metric.id,
            ));
        };
        if kll_field.position == Some(Position::All) {
            return Err(InvalidConfigReason::metric(
                Code::KllMetricKllFieldHasPositionAll,
                metric.id,
            ));
        }
        self.check_single_atom(&def, what_index)?;
        let producer = MetricProducer::new(
            metric.id,
            index,
            self.metric_hash(metric.id, metric),
            what_index,
            MetricKind::Kll(KllState::new(kll_field)),
            def.bucket.bucket_size_ns(),
            self.time_base_ns,
        );
        self.finish(&def, producer, store)
    }

    fn build_gauge(
        &self,
        metric: &GaugeMetric,
        index: usize,
        store: &mut ActivationStore,
    ) -> CompileResult<MetricProducer> {
        let def = CommonDef {
            id: metric.id,
            condition: metric.condition,
            dimensions_in_what: &metric.dimensions_in_what,
            links: &metric.links,
            slice_by_state: &metric.slice_by_state,
            state_link: &metric.state_link,
            bucket: metric.bucket,
            sampling: metric.dimensional_sampling_info.as_ref(),
            max_dimensions: metric.max_dimensions_per_bucket,
            check_link_subset: true,
        };
        let what_index = self.resolve_what(metric.id, metric.what)?;
        let filter = &metric.gauge_fields_filter;
        if filter.include_all == !filter.fields.is_empty() {
            return Err(InvalidConfigReason::metric(
                Code::GaugeMetricIncorrectFieldFilter,
                metric.id,
            ));
        }
        let trigger_index = match metric.trigger_event {
            Some(trigger) => {
                if metric.sampling_type != GaugeSamplingType::FirstNSamples {
                    return Err(InvalidConfigReason::metric(
                        Code::GaugeMetricTriggerNoFirstNSamples,
                        metric.id,
                    ));
                }
                Some(self.resolve_matcher(trigger, Code::GaugeMetricTriggerNotFound, metric.id)?)
            }
            None => None,
        };
        self.check_single_atom(&def, what_index)?;
        let mut producer = MetricProducer::new(
            metric.id,
            index,
            self.metric_hash(metric.id, metric),
            what_index,
            MetricKind::Gauge(GaugeState::new(
                filter.clone(),
                metric.sampling_type,
                metric.max_num_gauge_atoms_per_bucket,
                trigger_index,
            )),
            def.bucket.bucket_size_ns(),
            self.time_base_ns,
        );
        producer.event_matchers.extend(trigger_index);
        self.finish(&def, producer, store)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{compile, CompileResult, CompiledGraph};
    use super::*;
    use crate::config::{
        AtomMatcher, ConfigKey, EventActivation, GaugeFieldsFilter, MetricActivation, Predicate,
        SimpleAtomMatcher, SimplePredicate, StateDef,
    };

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
                dimensions: vec![FieldRef::new(1)],
                ..SimplePredicate::default()
            },
        )];
        config.states = vec![StateDef {
            id: 30,
            atom_id: 40,
            map: None,
        }];
        config
    }

    fn count(id: i64) -> CountMetric {
        CountMetric {
            id,
            what: Some(1),
            dimensions_in_what: vec![FieldRef::new(1), FieldRef::new(2)],
            ..CountMetric::default()
        }
    }

    fn try_compile(config: &TelemetryConfig) -> CompileResult<CompiledGraph> {
        compile(config, ConfigKey::new(0, 1), 0, 0)
    }

    fn code_of(config: &TelemetryConfig) -> Code {
        try_compile(config).unwrap_err().code
    }

    #[test]
    fn test_condition_link_must_be_subset_of_dimensions() {
        let mut c = config();
        let mut metric = count(100);
        metric.condition = Some(20);
        metric.links = vec![MetricConditionLink {
            condition: 20,
            fields_in_what: vec![FieldRef::new(2)],
            fields_in_condition: vec![FieldRef::new(1)],
        }];
        c.count_metrics = vec![metric.clone()];
        assert!(try_compile(&c).is_ok());

        c.count_metrics[0].links[0].fields_in_what = vec![FieldRef::new(3)];
        assert_eq!(code_of(&c), Code::MetricConditionLinkNotSubsetDimensions);

        c.count_metrics[0].links[0].fields_in_what = vec![FieldRef::new(1), FieldRef::new(2)];
        assert_eq!(code_of(&c), Code::MetricConditionLinkMalformed);

        c.count_metrics[0].condition = None;
        assert_eq!(code_of(&c), Code::MetricConditionLinkNoCondition);
    }

    #[test]
    fn test_unknown_sliced_state_rejects_metric() {
        let mut c = config();
        let mut metric = count(100);
        metric.slice_by_state = vec![31];
        c.count_metrics = vec![metric];
        let reason = try_compile(&c).unwrap_err();
        assert_eq!(reason.code, Code::MetricStateNotFound);
        assert_eq!(reason.state_id, Some(31));

        c.count_metrics[0].slice_by_state = vec![30];
        let graph = try_compile(&c).unwrap();
        assert_eq!(graph.producers[0].sliced_states[0].definition.atom_id, 40);
        assert!(graph.interesting_atom_ids().contains(&40));
    }

    #[test]
    fn test_whitelisted_state_atom_cannot_be_sliced() {
        let mut c = config();
        let mut metric = count(100);
        metric.slice_by_state = vec![30];
        c.count_metrics = vec![metric];
        c.whitelisted_atom_ids = vec![40];
        assert_eq!(code_of(&c), Code::MetricSlicedStateAtomAllowedFromAnyUid);
    }

    #[test]
    fn test_sampling_validation() {
        let mut c = config();
        let mut metric = count(100);
        metric.dimensional_sampling_info = Some(DimensionalSamplingInfo {
            sampled_what_field: Some(FieldRef::new(1)),
            shard_count: 1,
        });
        c.count_metrics = vec![metric];
        assert_eq!(code_of(&c), Code::MetricDimensionalSamplingInfoIncorrectShardCount);

        let info = c.count_metrics[0].dimensional_sampling_info.as_mut().unwrap();
        info.shard_count = 4;
        info.sampled_what_field = Some(FieldRef::with_position(1, Position::Any));
        assert_eq!(code_of(&c), Code::MetricSampledFieldIncorrectSize);

        let info = c.count_metrics[0].dimensional_sampling_info.as_mut().unwrap();
        info.sampled_what_field = Some(FieldRef::new(5));
        assert_eq!(code_of(&c), Code::MetricSampledFieldsNotSubsetDimInWhat);

        let info = c.count_metrics[0].dimensional_sampling_info.as_mut().unwrap();
        info.sampled_what_field = None;
        assert_eq!(code_of(&c), Code::MetricDimensionalSamplingInfoMissingSampledField);

        let info = c.count_metrics[0].dimensional_sampling_info.as_mut().unwrap();
        info.sampled_what_field = Some(FieldRef::new(2));
        let graph = try_compile(&c).unwrap();
        assert_eq!(graph.producers[0].sampling.map(|s| s.shard_count), Some(4));
    }

    #[test]
    fn test_duration_what_rules() {
        let mut c = config();
        c.duration_metrics = vec![DurationMetric {
            id: 200,
            what: Some(99),
            ..DurationMetric::default()
        }];
        assert_eq!(code_of(&c), Code::DurationMetricWhatNotFound);

        c.duration_metrics[0].what = Some(20);
        c.duration_metrics[0].aggregation_type = DurationAggregation::MaxSparse;
        c.duration_metrics[0].slice_by_state = vec![30];
        assert_eq!(code_of(&c), Code::DurationMetricMaxSparseHasSliceByState);

        c.duration_metrics[0].slice_by_state.clear();
        let graph = try_compile(&c).unwrap();
        let producer = &graph.producers[0];
        assert_eq!(producer.event_matchers.len(), 2);
        assert_eq!(graph.matcher_metrics.get(&2), Some(&vec![0]));
    }

    #[test]
    fn test_gauge_filter_and_trigger_rules() {
        let mut c = config();
        c.gauge_metrics = vec![GaugeMetric {
            id: 300,
            what: Some(1),
            ..GaugeMetric::default()
        }];
        assert_eq!(code_of(&c), Code::GaugeMetricIncorrectFieldFilter);

        c.gauge_metrics[0].gauge_fields_filter = GaugeFieldsFilter {
            include_all: true,
            fields: Vec::new(),
        };
        c.gauge_metrics[0].trigger_event = Some(2);
        assert_eq!(code_of(&c), Code::GaugeMetricTriggerNoFirstNSamples);

        c.gauge_metrics[0].sampling_type = GaugeSamplingType::FirstNSamples;
        c.gauge_metrics[0].trigger_event = Some(77);
        assert_eq!(code_of(&c), Code::GaugeMetricTriggerNotFound);

        c.gauge_metrics[0].trigger_event = Some(2);
        assert!(try_compile(&c).is_ok());
    }

    #[test]
    fn test_value_and_kll_field_rules() {
        let mut c = config();
        c.value_metrics = vec![ValueMetric {
            id: 400,
            what: Some(1),
            ..ValueMetric::default()
        }];
        assert_eq!(code_of(&c), Code::ValueMetricMissingValueField);
        c.value_metrics[0].value_field = vec![FieldRef::with_position(2, Position::All)];
        assert_eq!(code_of(&c), Code::ValueMetricValueFieldHasPositionAll);
        c.value_metrics.clear();

        c.kll_metrics = vec![KllMetric {
            id: 500,
            what: Some(1),
            ..KllMetric::default()
        }];
        assert_eq!(code_of(&c), Code::KllMetricMissingKllField);
        c.kll_metrics[0].kll_field = Some(FieldRef::new(2));
        assert!(try_compile(&c).is_ok());
    }

    #[test]
    fn test_activation_wiring() {
        let mut c = config();
        c.count_metrics = vec![count(100)];
        c.metric_activations = vec![MetricActivation {
            metric_id: 100,
            activation_type: Default::default(),
            event_activation: vec![EventActivation {
                atom_matcher_id: 2,
                ttl_seconds: 60,
                deactivation_atom_matcher_id: Some(3),
                activation_type: None,
            }],
        }];
        let graph = try_compile(&c).unwrap();
        assert_eq!(graph.activations.len(), 1);
        assert_eq!(graph.activation_metrics.get(&1), Some(&vec![0]));
        assert_eq!(graph.activation_metrics.get(&2), Some(&vec![0]));

        c.metric_activations[0].event_activation[0].deactivation_atom_matcher_id = Some(9);
        assert_eq!(code_of(&c), Code::MetricDeactivationMatcherNotFound);

        c.metric_activations[0].metric_id = 101;
        assert_eq!(code_of(&c), Code::MetricActivationNotFound);

        c.metric_activations[0].metric_id = 100;
        c.metric_activations[0].event_activation[0].deactivation_atom_matcher_id = None;
        c.metric_activations.push(c.metric_activations[0].clone());
        assert_eq!(code_of(&c), Code::MetricHasMultipleActivations);
    }
}
