//! Metric producers
//!
//! Six aggregation variants share one producer state machine (see [`producer`]). Restricted
//! configs replace event metrics with a buffering variant whose rows go to the restricted store.

pub mod activation;
pub mod bucket;
pub mod count;
pub mod duration;
pub mod event;
pub mod gauge;
pub mod kll;
pub mod producer;
pub mod report;
pub mod restricted;
pub mod value;

pub use activation::{
    Activation, ActivationKey, ActivationRecord, ActivationState, ActivationStore, ActivationWiring,
};
pub use producer::{
    EventContext, MetricKind, MetricProducer, ResolvedLink, Sampling, SlicedState,
    DEFAULT_DIMENSION_HARD_LIMIT, MAX_DIMENSION_HARD_LIMIT,
};
pub use report::{
    BucketData, ConfigMetricsReport, DimensionData, EventRecord, GaugeAtom, KllSummary,
    MetricData, MetricReport,
};
pub use restricted::RestrictedBatch;
