//! # telemd
//!
//! Configuration compiler and runtime graph of an on-device telemetry daemon.
//!
//! A configuration document describes atom matchers, conditions, states, metrics, alerts and
//! alarms. The compiler turns it into a [`compiler::CompiledGraph`]; a
//! [`router::MetricsManager`] drives that graph with events and produces reports.
//!
//! ## Modules
//!
//! - `config` - Configuration documents, loaders and daemon settings
//! - `event` - Events, typed values, field references and dimension keys
//! - `matcher` - Atom matcher trackers
//! - `condition` - Condition trackers and their tri-state values
//! - `state` - State registry for metrics sliced by state
//! - `metrics` - Metric producers, activations and reports
//! - `anomaly` - Anomaly and alarm trackers, alert notifications
//! - `compiler` - Config compilation, hot reload and rejection reasons
//! - `router` - Per-config event routing
//! - `filter` - Atom-interest filter for the ingestion boundary
//! - `storage` - Restricted metric persistence
//! - `subscription` - Live shell subscriptions
//! - `stats` - Daemon-wide guardrail counters
//! - `service` - Composition root
pub mod anomaly;
pub mod compiler;
pub mod condition;
pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod hash;
pub mod matcher;
pub mod metrics;
pub mod router;
pub mod service;
pub mod state;
pub mod stats;
pub mod storage;
pub mod subscription;

pub use error::{Result, TelemetryError};
pub use router::MetricsManager;
pub use service::TelemetryService;
