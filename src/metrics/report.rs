//! Dumped report documents

use crate::config::ConfigKey;
use crate::event::{LogEvent, MetricDimensionKey, Value};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigMetricsReport {
    pub config_key: ConfigKey,
    pub last_report_elapsed_ns: i64,
    pub current_report_elapsed_ns: i64,
    pub metrics: Vec<MetricReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReport {
    pub metric_id: i64,
    pub is_active: bool,
    pub bucket_size_ns: i64,
    pub data: MetricData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "rows", rename_all = "snake_case")]
pub enum MetricData {
    Count(Vec<DimensionData<i64>>),
    Duration(Vec<DimensionData<i64>>),
    Event(Vec<EventRecord>),
    Value(Vec<DimensionData<Vec<f64>>>),
    Kll(Vec<DimensionData<KllSummary>>),
    Gauge(Vec<DimensionData<Vec<GaugeAtom>>>),
}

impl MetricData {
    pub fn is_empty(&self) -> bool {
        match self {
            MetricData::Count(rows) | MetricData::Duration(rows) => rows.is_empty(),
            MetricData::Event(rows) => rows.is_empty(),
            MetricData::Value(rows) => rows.is_empty(),
            MetricData::Kll(rows) => rows.is_empty(),
            MetricData::Gauge(rows) => rows.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionData<T> {
    pub dimension: MetricDimensionKey,
    pub buckets: Vec<BucketData<T>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketData<T> {
    pub start_ns: i64,
    pub end_ns: i64,
    pub value: T,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub elapsed_timestamp_ns: i64,
    pub atom: LogEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KllSummary {
    pub count: u64,
    pub min: i64,
    pub max: i64,
    pub p50: i64,
    pub p90: i64,
    pub p99: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeAtom {
    pub elapsed_timestamp_ns: i64,
    pub values: Vec<(i32, Value)>,
}
