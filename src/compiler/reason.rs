//! Reasons a configuration is rejected

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Machine-readable rejection code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum InvalidConfigReasonCode {
    #[error("MATCHER_DUPLICATE")]
    MatcherDuplicate,
    #[error("MATCHER_MALFORMED_CONTENTS_CASE")]
    MatcherMalformedContentsCase,
    #[error("MATCHER_NO_CHILDREN")]
    MatcherNoChildren,
    #[error("MATCHER_NOT_OPERATION_IS_NOT_UNARY")]
    MatcherNotOperationIsNotUnary,
    #[error("MATCHER_CHILD_NOT_FOUND")]
    MatcherChildNotFound,
    #[error("MATCHER_CYCLE")]
    MatcherCycle,

    #[error("CONDITION_DUPLICATE")]
    ConditionDuplicate,
    #[error("CONDITION_MALFORMED_CONTENTS_CASE")]
    ConditionMalformedContentsCase,
    #[error("CONDITION_NO_CHILDREN")]
    ConditionNoChildren,
    #[error("CONDITION_NOT_OPERATION_IS_NOT_UNARY")]
    ConditionNotOperationIsNotUnary,
    #[error("CONDITION_CHILD_NOT_FOUND")]
    ConditionChildNotFound,
    #[error("CONDITION_CYCLE")]
    ConditionCycle,
    #[error("CONDITION_START_MATCHER_NOT_FOUND")]
    ConditionStartMatcherNotFound,
    #[error("CONDITION_STOP_MATCHER_NOT_FOUND")]
    ConditionStopMatcherNotFound,
    #[error("CONDITION_STOP_ALL_MATCHER_NOT_FOUND")]
    ConditionStopAllMatcherNotFound,

    #[error("STATE_DUPLICATE")]
    StateDuplicate,

    #[error("METRIC_DUPLICATE")]
    MetricDuplicate,
    #[error("METRIC_MISSING_WHAT")]
    MetricMissingWhat,
    #[error("METRIC_MATCHER_NOT_FOUND")]
    MetricMatcherNotFound,
    #[error("METRIC_MATCHER_MORE_THAN_ONE_ATOM")]
    MetricMatcherMoreThanOneAtom,
    #[error("METRIC_CONDITION_NOT_FOUND")]
    MetricConditionNotFound,
    #[error("METRIC_CONDITIONLINK_NO_CONDITION")]
    MetricConditionLinkNoCondition,
    #[error("METRIC_CONDITIONLINK_NOT_FOUND")]
    MetricConditionLinkNotFound,
    #[error("METRIC_CONDITIONLINK_MALFORMED")]
    MetricConditionLinkMalformed,
    #[error("METRIC_CONDITIONLINK_NOT_SUBSET_DIMENSIONS")]
    MetricConditionLinkNotSubsetDimensions,
    #[error("METRIC_STATE_NOT_FOUND")]
    MetricStateNotFound,
    #[error("METRIC_STATELINK_NO_STATE")]
    MetricStateLinkNoState,
    #[error("METRIC_STATELINK_NOT_SUBSET_DIM_IN_WHAT")]
    MetricStateLinkNotSubsetDimInWhat,
    #[error("METRIC_ACTIVATION_NOT_FOUND")]
    MetricActivationNotFound,
    #[error("METRIC_ACTIVATION_MATCHER_NOT_FOUND")]
    MetricActivationMatcherNotFound,
    #[error("METRIC_DEACTIVATION_MATCHER_NOT_FOUND")]
    MetricDeactivationMatcherNotFound,
    #[error("METRIC_HAS_MULTIPLE_ACTIVATIONS")]
    MetricHasMultipleActivations,
    #[error("METRIC_DIMENSIONAL_SAMPLING_INFO_MISSING_SAMPLED_FIELD")]
    MetricDimensionalSamplingInfoMissingSampledField,
    #[error("METRIC_DIMENSIONAL_SAMPLING_INFO_INCORRECT_SHARD_COUNT")]
    MetricDimensionalSamplingInfoIncorrectShardCount,
    #[error("METRIC_SAMPLED_FIELD_INCORRECT_SIZE")]
    MetricSampledFieldIncorrectSize,
    #[error("METRIC_SAMPLED_FIELDS_NOT_SUBSET_DIM_IN_WHAT")]
    MetricSampledFieldsNotSubsetDimInWhat,
    #[error("METRIC_SLICED_STATE_ATOM_ALLOWED_FROM_ANY_UID")]
    MetricSlicedStateAtomAllowedFromAnyUid,

    #[error("DURATION_METRIC_WHAT_NOT_FOUND")]
    DurationMetricWhatNotFound,
    #[error("DURATION_METRIC_WHAT_NOT_SIMPLE")]
    DurationMetricWhatNotSimple,
    #[error("DURATION_METRIC_MISSING_START")]
    DurationMetricMissingStart,
    #[error("DURATION_METRIC_MAX_SPARSE_HAS_SLICE_BY_STATE")]
    DurationMetricMaxSparseHasSliceByState,

    #[error("VALUE_METRIC_MISSING_VALUE_FIELD")]
    ValueMetricMissingValueField,
    #[error("VALUE_METRIC_VALUE_FIELD_HAS_POSITION_ALL")]
    ValueMetricValueFieldHasPositionAll,
    #[error("KLL_METRIC_MISSING_KLL_FIELD")]
    KllMetricMissingKllField,
    #[error("KLL_METRIC_KLL_FIELD_HAS_POSITION_ALL")]
    KllMetricKllFieldHasPositionAll,
    #[error("GAUGE_METRIC_INCORRECT_FIELD_FILTER")]
    GaugeMetricIncorrectFieldFilter,
    #[error("GAUGE_METRIC_TRIGGER_NO_FIRST_N_SAMPLES")]
    GaugeMetricTriggerNoFirstNSamples,
    #[error("GAUGE_METRIC_TRIGGER_NOT_FOUND")]
    GaugeMetricTriggerNotFound,

    #[error("RESTRICTED_METRIC_NOT_SUPPORTED")]
    RestrictedMetricNotSupported,
    #[error("NO_REPORT_METRIC_NOT_FOUND")]
    NoReportMetricNotFound,

    #[error("ALERT_DUPLICATE")]
    AlertDuplicate,
    #[error("ALERT_METRIC_NOT_FOUND")]
    AlertMetricNotFound,
    #[error("ALERT_THRESHOLD_MISSING")]
    AlertThresholdMissing,
    #[error("ALERT_INVALID_TRIGGER_OR_NUM_BUCKETS")]
    AlertInvalidTriggerOrNumBuckets,
    #[error("ALERT_CANNOT_ADD_ANOMALY")]
    AlertCannotAddAnomaly,

    #[error("ALARM_DUPLICATE")]
    AlarmDuplicate,
    #[error("ALARM_OFFSET_LESS_THAN_OR_EQUAL_ZERO")]
    AlarmOffsetLessThanOrEqualZero,
    #[error("ALARM_PERIOD_LESS_THAN_OR_EQUAL_ZERO")]
    AlarmPeriodLessThanOrEqualZero,
    #[error("ALARM_OUT_OF_RANGE")]
    AlarmOutOfRange,

    #[error("SUBSCRIPTION_DUPLICATE")]
    SubscriptionDuplicate,
    #[error("SUBSCRIPTION_RULE_NOT_FOUND")]
    SubscriptionRuleNotFound,
    #[error("SUBSCRIPTION_SUBSCRIBER_INFO_MISSING")]
    SubscriptionSubscriberInfoMissing,
}

impl Serialize for InvalidConfigReasonCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A rejection code plus the ids of the offending entities
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidConfigReason {
    pub code: InvalidConfigReasonCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alarm_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub matcher_ids: Vec<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub condition_ids: Vec<i64>,
}

impl InvalidConfigReason {
    pub fn new(code: InvalidConfigReasonCode) -> Self {
        Self {
            code,
            metric_id: None,
            state_id: None,
            alert_id: None,
            alarm_id: None,
            subscription_id: None,
            matcher_ids: Vec::new(),
            condition_ids: Vec::new(),
        }
    }

    pub fn metric(code: InvalidConfigReasonCode, metric_id: i64) -> Self {
        Self::new(code).with_metric(metric_id)
    }

    pub fn matcher(code: InvalidConfigReasonCode, matcher_id: i64) -> Self {
        Self::new(code).with_matcher(matcher_id)
    }

    pub fn condition(code: InvalidConfigReasonCode, condition_id: i64) -> Self {
        Self::new(code).with_condition(condition_id)
    }

    pub fn alert(code: InvalidConfigReasonCode, alert_id: i64) -> Self {
        Self::new(code).with_alert(alert_id)
    }

    pub fn alarm(code: InvalidConfigReasonCode, alarm_id: i64) -> Self {
        Self {
            alarm_id: Some(alarm_id),
            ..Self::new(code)
        }
    }

    pub fn subscription(code: InvalidConfigReasonCode, subscription_id: i64) -> Self {
        Self {
            subscription_id: Some(subscription_id),
            ..Self::new(code)
        }
    }

    pub fn with_metric(mut self, metric_id: i64) -> Self {
        self.metric_id = Some(metric_id);
        self
    }

    pub fn with_state(mut self, state_id: i64) -> Self {
        self.state_id = Some(state_id);
        self
    }

    pub fn with_alert(mut self, alert_id: i64) -> Self {
        self.alert_id = Some(alert_id);
        self
    }

    pub fn with_matcher(mut self, matcher_id: i64) -> Self {
        self.matcher_ids.push(matcher_id);
        self
    }

    pub fn with_condition(mut self, condition_id: i64) -> Self {
        self.condition_ids.push(condition_id);
        self
    }

    /// Ids are pushed innermost first while unwinding a cycle; callers see them in path order
    pub(crate) fn reverse_ids(mut self) -> Self {
        self.matcher_ids.reverse();
        self.condition_ids.reverse();
        self
    }
}

impl fmt::Display for InvalidConfigReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(id) = self.metric_id {
            write!(f, " metric={id}")?;
        }
        if let Some(id) = self.state_id {
            write!(f, " state={id}")?;
        }
        if let Some(id) = self.alert_id {
            write!(f, " alert={id}")?;
        }
        if let Some(id) = self.alarm_id {
            write!(f, " alarm={id}")?;
        }
        if let Some(id) = self.subscription_id {
            write!(f, " subscription={id}")?;
        }
        if !self.matcher_ids.is_empty() {
            write!(f, " matchers={:?}", self.matcher_ids)?;
        }
        if !self.condition_ids.is_empty() {
            write!(f, " conditions={:?}", self.condition_ids)?;
        }
        Ok(())
    }
}

impl std::error::Error for InvalidConfigReason {}

pub type CompileResult<T> = Result<T, InvalidConfigReason>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_lists_ids() {
        let reason = InvalidConfigReason::metric(
            InvalidConfigReasonCode::MetricConditionLinkNotFound,
            5,
        )
        .with_condition(9);
        assert_eq!(
            reason.to_string(),
            "METRIC_CONDITIONLINK_NOT_FOUND metric=5 conditions=[9]"
        );
    }

    #[test]
    fn test_serializes_code_in_wire_form() {
        let reason = InvalidConfigReason::alarm(
            InvalidConfigReasonCode::AlarmPeriodLessThanOrEqualZero,
            3,
        );
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["code"], "ALARM_PERIOD_LESS_THAN_OR_EQUAL_ZERO");
        assert_eq!(json["alarm_id"], 3);
        assert!(json.get("metric_id").is_none());
    }
}
