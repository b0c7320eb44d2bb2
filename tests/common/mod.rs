//! Common test utilities and helpers

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use telemd::anomaly::LogSink;
use telemd::config::{
    AtomMatcher, ConfigKey, CountMetric, DaemonSettings, EventMetric, SimpleAtomMatcher,
    TelemetryConfig,
};
use telemd::event::{LogEvent, Value};
use telemd::metrics::{ConfigMetricsReport, MetricData};
use telemd::TelemetryService;
use tempfile::TempDir;

pub const SEC: i64 = 1_000_000_000;
pub const DELEGATE: &str = "com.example.delegate";

/// A service whose restricted stores live in a temporary directory
pub struct TestService {
    pub dir: TempDir,
    pub service: Arc<TelemetryService>,
}

impl TestService {
    pub fn new() -> Self {
        Self::with_settings(|_| {})
    }

    pub fn with_settings(customize: impl FnOnce(&mut DaemonSettings)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut settings = DaemonSettings {
            data_dir: dir.path().join("db"),
            activation_snapshot_path: Some(dir.path().join("activations.json")),
            ..DaemonSettings::default()
        };
        customize(&mut settings);
        let service = Arc::new(TelemetryService::with_sqlite(settings, Arc::new(LogSink)));
        Self { dir, service }
    }

    pub fn db_path(&self, key: ConfigKey) -> PathBuf {
        self.dir
            .path()
            .join("db")
            .join(format!("{}_{}.db", key.uid, key.id))
    }
}

/// Config with one restricted event metric (id 5) over atom 999
pub fn restricted_config(id: i64) -> TelemetryConfig {
    let mut config = TelemetryConfig::new(id);
    config.atom_matchers = vec![AtomMatcher::simple(1, SimpleAtomMatcher::new(999))];
    config.event_metrics = vec![EventMetric {
        id: 5,
        what: Some(1),
        ..EventMetric::default()
    }];
    config.restricted_metrics_delegate = Some(DELEGATE.to_string());
    config
}

/// Config with count metric 100 over atom 10
pub fn count_config(id: i64) -> TelemetryConfig {
    let mut config = TelemetryConfig::new(id);
    config.atom_matchers = vec![AtomMatcher::simple(1, SimpleAtomMatcher::new(10))];
    config.count_metrics = vec![CountMetric {
        id: 100,
        what: Some(1),
        ..CountMetric::default()
    }];
    config
}

pub fn restricted_event(elapsed_ns: i64, wall_ns: i64) -> LogEvent {
    LogEvent::new(999, elapsed_ns)
        .with_wall_time(wall_ns)
        .with_value(Value::Int(elapsed_ns as i32))
        .with_value(Value::Str("payload".into()))
        .with_restriction_category(1)
}

/// Sum of every bucket of a count or duration metric
pub fn metric_total(report: &ConfigMetricsReport, metric_id: i64) -> i64 {
    report
        .metrics
        .iter()
        .find(|m| m.metric_id == metric_id)
        .map(|m| match &m.data {
            MetricData::Count(rows) | MetricData::Duration(rows) => rows
                .iter()
                .flat_map(|d| d.buckets.iter().map(|b| b.value))
                .sum(),
            _ => 0,
        })
        .unwrap_or(0)
}
