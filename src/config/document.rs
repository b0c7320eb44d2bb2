//! Configuration document types
//!
//! A [`TelemetryConfig`] describes everything one configuration asks the daemon to measure.
//! Cross references between entries are by stable 64-bit id and are resolved by the compiler.

use crate::event::FieldRef;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub id: i64,
    #[serde(default)]
    pub atom_matchers: Vec<AtomMatcher>,
    #[serde(default)]
    pub predicates: Vec<Predicate>,
    #[serde(default)]
    pub states: Vec<StateDef>,
    #[serde(default)]
    pub count_metrics: Vec<CountMetric>,
    #[serde(default)]
    pub duration_metrics: Vec<DurationMetric>,
    #[serde(default)]
    pub event_metrics: Vec<EventMetric>,
    #[serde(default)]
    pub value_metrics: Vec<ValueMetric>,
    #[serde(default)]
    pub kll_metrics: Vec<KllMetric>,
    #[serde(default)]
    pub gauge_metrics: Vec<GaugeMetric>,
    #[serde(default)]
    pub metric_activations: Vec<MetricActivation>,
    #[serde(default)]
    pub alerts: Vec<AlertDef>,
    #[serde(default)]
    pub alarms: Vec<AlarmDef>,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionDef>,
    #[serde(default)]
    pub no_report_metrics: Vec<i64>,
    #[serde(default)]
    pub whitelisted_atom_ids: Vec<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restricted_metrics_delegate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restricted_ttl_days: Option<u32>,
}

impl TelemetryConfig {
    pub const DEFAULT_RESTRICTED_TTL_DAYS: u32 = 7;

    pub fn new(id: i64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn is_restricted(&self) -> bool {
        self.restricted_metrics_delegate.is_some()
    }

    pub fn restricted_ttl_ns(&self) -> i64 {
        let days = self
            .restricted_ttl_days
            .unwrap_or(Self::DEFAULT_RESTRICTED_TTL_DAYS);
        i64::from(days) * 24 * 3600 * 1_000_000_000
    }

    pub fn metric_count(&self) -> usize {
        self.count_metrics.len()
            + self.duration_metrics.len()
            + self.event_metrics.len()
            + self.value_metrics.len()
            + self.kll_metrics.len()
            + self.gauge_metrics.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogicalOperation {
    And,
    Or,
    Not,
    Nand,
    Nor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomMatcher {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simple_atom_matcher: Option<SimpleAtomMatcher>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combination: Option<MatcherCombination>,
}

impl AtomMatcher {
    pub fn simple(id: i64, matcher: SimpleAtomMatcher) -> Self {
        Self {
            id,
            simple_atom_matcher: Some(matcher),
            combination: None,
        }
    }

    pub fn combination(id: i64, operation: LogicalOperation, children: Vec<i64>) -> Self {
        Self {
            id,
            simple_atom_matcher: None,
            combination: Some(MatcherCombination {
                operation,
                matcher: children,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleAtomMatcher {
    pub atom_id: i32,
    #[serde(default)]
    pub field_value_matcher: Vec<FieldValueMatcher>,
}

impl SimpleAtomMatcher {
    pub fn new(atom_id: i32) -> Self {
        Self {
            atom_id,
            field_value_matcher: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatcherCombination {
    pub operation: LogicalOperation,
    #[serde(default)]
    pub matcher: Vec<i64>,
}

/// Constraint on one field of a simple matcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValueMatcher {
    pub field: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<crate::event::Position>,
    #[serde(flatten)]
    pub value: ValueMatcher,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueMatcher {
    EqBool(bool),
    EqString(String),
    EqInt(i64),
    LtInt(i64),
    GtInt(i64),
    LteInt(i64),
    GteInt(i64),
    LtFloat(f64),
    GtFloat(f64),
    EqAnyInt(Vec<i64>),
    NeqAnyInt(Vec<i64>),
    EqAnyString(Vec<String>),
    NeqAnyString(Vec<String>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InitialValue {
    #[default]
    Unknown,
    False,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simple_predicate: Option<SimplePredicate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combination: Option<PredicateCombination>,
}

impl Predicate {
    pub fn simple(id: i64, predicate: SimplePredicate) -> Self {
        Self {
            id,
            simple_predicate: Some(predicate),
            combination: None,
        }
    }

    pub fn combination(id: i64, operation: LogicalOperation, children: Vec<i64>) -> Self {
        Self {
            id,
            simple_predicate: None,
            combination: Some(PredicateCombination {
                operation,
                predicate: children,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimplePredicate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_all: Option<i64>,
    #[serde(default = "default_true")]
    pub count_nesting: bool,
    #[serde(default)]
    pub initial_value: InitialValue,
    #[serde(default)]
    pub dimensions: Vec<FieldRef>,
}

impl Default for SimplePredicate {
    fn default() -> Self {
        Self {
            start: None,
            stop: None,
            stop_all: None,
            count_nesting: true,
            initial_value: InitialValue::Unknown,
            dimensions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredicateCombination {
    pub operation: LogicalOperation,
    #[serde(default)]
    pub predicate: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDef {
    pub id: i64,
    pub atom_id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<StateMap>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMap {
    #[serde(default)]
    pub group: Vec<StateGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateGroup {
    pub group_id: i64,
    #[serde(default)]
    pub value: Vec<i32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeUnit {
    OneMinute,
    FiveMinutes,
    TenMinutes,
    ThirtyMinutes,
    #[default]
    OneHour,
    ThreeHours,
    SixHours,
    TwelveHours,
    OneDay,
    OneWeek,
    /// One second buckets, for tests
    Ctx,
}

impl TimeUnit {
    pub fn bucket_size_ns(self) -> i64 {
        const MINUTE: i64 = 60 * 1_000_000_000;
        match self {
            TimeUnit::OneMinute => MINUTE,
            TimeUnit::FiveMinutes => 5 * MINUTE,
            TimeUnit::TenMinutes => 10 * MINUTE,
            TimeUnit::ThirtyMinutes => 30 * MINUTE,
            TimeUnit::OneHour => 60 * MINUTE,
            TimeUnit::ThreeHours => 3 * 60 * MINUTE,
            TimeUnit::SixHours => 6 * 60 * MINUTE,
            TimeUnit::TwelveHours => 12 * 60 * MINUTE,
            TimeUnit::OneDay => 24 * 60 * MINUTE,
            TimeUnit::OneWeek => 7 * 24 * 60 * MINUTE,
            TimeUnit::Ctx => 1_000_000_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricConditionLink {
    pub condition: i64,
    #[serde(default)]
    pub fields_in_what: Vec<FieldRef>,
    #[serde(default)]
    pub fields_in_condition: Vec<FieldRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricStateLink {
    pub state_atom_id: i32,
    #[serde(default)]
    pub fields_in_what: Vec<FieldRef>,
    #[serde(default)]
    pub fields_in_state: Vec<FieldRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionalSamplingInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampled_what_field: Option<FieldRef>,
    #[serde(default)]
    pub shard_count: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CountMetric {
    pub id: i64,
    #[serde(default)]
    pub what: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<i64>,
    #[serde(default)]
    pub dimensions_in_what: Vec<FieldRef>,
    #[serde(default)]
    pub links: Vec<MetricConditionLink>,
    #[serde(default)]
    pub slice_by_state: Vec<i64>,
    #[serde(default)]
    pub state_link: Vec<MetricStateLink>,
    #[serde(default)]
    pub bucket: TimeUnit,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensional_sampling_info: Option<DimensionalSamplingInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_dimensions_per_bucket: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DurationAggregation {
    #[default]
    Sum,
    MaxSparse,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DurationMetric {
    pub id: i64,
    /// Id of a simple predicate whose start/stop matchers delimit durations
    #[serde(default)]
    pub what: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<i64>,
    #[serde(default)]
    pub dimensions_in_what: Vec<FieldRef>,
    #[serde(default)]
    pub links: Vec<MetricConditionLink>,
    #[serde(default)]
    pub slice_by_state: Vec<i64>,
    #[serde(default)]
    pub state_link: Vec<MetricStateLink>,
    #[serde(default)]
    pub bucket: TimeUnit,
    #[serde(default)]
    pub aggregation_type: DurationAggregation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensional_sampling_info: Option<DimensionalSamplingInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_dimensions_per_bucket: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetric {
    pub id: i64,
    #[serde(default)]
    pub what: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<i64>,
    #[serde(default)]
    pub links: Vec<MetricConditionLink>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueAggregation {
    #[default]
    Sum,
    Min,
    Max,
    Avg,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueMetric {
    pub id: i64,
    #[serde(default)]
    pub what: Option<i64>,
    #[serde(default)]
    pub value_field: Vec<FieldRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<i64>,
    #[serde(default)]
    pub dimensions_in_what: Vec<FieldRef>,
    #[serde(default)]
    pub links: Vec<MetricConditionLink>,
    #[serde(default)]
    pub slice_by_state: Vec<i64>,
    #[serde(default)]
    pub state_link: Vec<MetricStateLink>,
    #[serde(default)]
    pub bucket: TimeUnit,
    #[serde(default)]
    pub aggregation_type: ValueAggregation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensional_sampling_info: Option<DimensionalSamplingInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_dimensions_per_bucket: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KllMetric {
    pub id: i64,
    #[serde(default)]
    pub what: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kll_field: Option<FieldRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<i64>,
    #[serde(default)]
    pub dimensions_in_what: Vec<FieldRef>,
    #[serde(default)]
    pub links: Vec<MetricConditionLink>,
    #[serde(default)]
    pub slice_by_state: Vec<i64>,
    #[serde(default)]
    pub state_link: Vec<MetricStateLink>,
    #[serde(default)]
    pub bucket: TimeUnit,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensional_sampling_info: Option<DimensionalSamplingInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_dimensions_per_bucket: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GaugeFieldsFilter {
    #[serde(default)]
    pub include_all: bool,
    #[serde(default)]
    pub fields: Vec<FieldRef>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GaugeSamplingType {
    #[default]
    RandomOneSample,
    FirstNSamples,
}

fn default_max_gauge_atoms() -> usize {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeMetric {
    pub id: i64,
    #[serde(default)]
    pub what: Option<i64>,
    #[serde(default)]
    pub gauge_fields_filter: GaugeFieldsFilter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<i64>,
    #[serde(default)]
    pub dimensions_in_what: Vec<FieldRef>,
    #[serde(default)]
    pub links: Vec<MetricConditionLink>,
    #[serde(default)]
    pub slice_by_state: Vec<i64>,
    #[serde(default)]
    pub state_link: Vec<MetricStateLink>,
    #[serde(default)]
    pub bucket: TimeUnit,
    #[serde(default)]
    pub sampling_type: GaugeSamplingType,
    #[serde(default = "default_max_gauge_atoms")]
    pub max_num_gauge_atoms_per_bucket: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_event: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensional_sampling_info: Option<DimensionalSamplingInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_dimensions_per_bucket: Option<usize>,
}

impl Default for GaugeMetric {
    fn default() -> Self {
        Self {
            id: 0,
            what: None,
            gauge_fields_filter: GaugeFieldsFilter::default(),
            condition: None,
            dimensions_in_what: Vec::new(),
            links: Vec::new(),
            slice_by_state: Vec::new(),
            state_link: Vec::new(),
            bucket: TimeUnit::default(),
            sampling_type: GaugeSamplingType::default(),
            max_num_gauge_atoms_per_bucket: default_max_gauge_atoms(),
            trigger_event: None,
            dimensional_sampling_info: None,
            max_dimensions_per_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivationType {
    #[default]
    ActivateImmediately,
    ActivateOnBoot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventActivation {
    pub atom_matcher_id: i64,
    pub ttl_seconds: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deactivation_atom_matcher_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_type: Option<ActivationType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricActivation {
    pub metric_id: i64,
    #[serde(default)]
    pub activation_type: ActivationType,
    #[serde(default)]
    pub event_activation: Vec<EventActivation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertDef {
    pub id: i64,
    pub metric_id: i64,
    #[serde(default)]
    pub num_buckets: i32,
    #[serde(default)]
    pub refractory_period_secs: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_if_sum_gt: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmDef {
    pub id: i64,
    pub offset_millis: i64,
    pub period_millis: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    Alert,
    Alarm,
}

fn default_probability() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionDef {
    pub id: i64,
    pub rule_type: RuleType,
    pub rule_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscriber: Option<String>,
    #[serde(default = "default_probability")]
    pub probability_of_informing: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_document_parses() {
        let yaml = r#"
id: 12345
atom_matchers:
  - id: 1
    simple_atom_matcher:
      atom_id: 999
      field_value_matcher:
        - field: 1
          eq_int: 3
  - id: 2
    combination:
      operation: NOT
      matcher: [1]
predicates:
  - id: 10
    simple_predicate:
      start: 1
      stop: 2
count_metrics:
  - id: 100
    what: 1
    condition: 10
    bucket: FIVE_MINUTES
"#;
        let config: TelemetryConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.id, 12345);
        assert_eq!(
            config.atom_matchers[0]
                .simple_atom_matcher
                .as_ref()
                .unwrap()
                .field_value_matcher[0]
                .value,
            ValueMatcher::EqInt(3)
        );
        let predicate = config.predicates[0].simple_predicate.as_ref().unwrap();
        assert!(predicate.count_nesting);
        assert_eq!(predicate.initial_value, InitialValue::Unknown);
        assert_eq!(config.count_metrics[0].bucket, TimeUnit::FiveMinutes);
        assert_eq!(config.metric_count(), 1);
    }

    #[test]
    fn test_restricted_ttl_default() {
        let mut config = TelemetryConfig::new(1);
        assert!(!config.is_restricted());
        assert_eq!(config.restricted_ttl_ns(), 7 * 24 * 3600 * 1_000_000_000);
        config.restricted_ttl_days = Some(1);
        assert_eq!(config.restricted_ttl_ns(), 24 * 3600 * 1_000_000_000);
    }
}
