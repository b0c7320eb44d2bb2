//! Composition root
//!
//! [`TelemetryService`] owns every installed configuration's [`MetricsManager`] together with
//! the shared collaborators: stats, the atom filter, the restricted store, the notification
//! sink and the shell subscriber. Ingestion is synchronous; storage work is async and never
//! holds the graph lock across an await.

use crate::anomaly::NotificationSink;
use crate::compiler::{self, UpdateSummary};
use crate::config::{ConfigKey, DaemonSettings, TelemetryConfig};
use crate::error::{Result, TelemetryError};
use crate::event::LogEvent;
use crate::filter::{ConsumerId, LogEventFilter};
use crate::metrics::{ActivationRecord, ConfigMetricsReport, RestrictedBatch};
use crate::router::MetricsManager;
use crate::stats::DaemonStats;
use crate::storage::{QueryResult, RestrictedStore, SqliteStore, StorageResult};
use crate::subscription::ShellSubscriber;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Tick of the alarm and subscription workers
const WORKER_TICK: Duration = Duration::from_millis(500);

/// Activations of every config, as written on shutdown
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivationSnapshot {
    pub configs: Vec<ConfigActivations>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigActivations {
    pub key: ConfigKey,
    pub activations: Vec<ActivationRecord>,
    /// Last restriction category seen per restricted metric id
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub restricted_categories: BTreeMap<i64, i32>,
}

pub struct TelemetryService {
    settings: DaemonSettings,
    managers: Mutex<BTreeMap<ConfigKey, MetricsManager>>,
    stats: Arc<DaemonStats>,
    filter: Arc<LogEventFilter>,
    store: Arc<dyn RestrictedStore>,
    sink: Arc<dyn NotificationSink>,
    subscriber: Arc<ShellSubscriber>,
    flush_signal: Notify,
    started: Instant,
}

impl TelemetryService {
    pub fn new(
        settings: DaemonSettings,
        store: Arc<dyn RestrictedStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let stats = Arc::new(DaemonStats::new());
        let filter = Arc::new(LogEventFilter::new(settings.filter_enabled));
        let subscriber = Arc::new(ShellSubscriber::new(
            &settings,
            filter.clone(),
            stats.clone(),
        ));
        Self {
            settings,
            managers: Mutex::new(BTreeMap::new()),
            stats,
            filter,
            store,
            sink,
            subscriber,
            flush_signal: Notify::new(),
            started: Instant::now(),
        }
    }

    /// Service backed by a SQLite store in the settings' data directory
    pub fn with_sqlite(settings: DaemonSettings, sink: Arc<dyn NotificationSink>) -> Self {
        let store = Arc::new(SqliteStore::new(settings.data_dir.clone()));
        Self::new(settings, store, sink)
    }

    pub fn settings(&self) -> &DaemonSettings {
        &self.settings
    }

    pub fn stats(&self) -> &Arc<DaemonStats> {
        &self.stats
    }

    pub fn filter(&self) -> &Arc<LogEventFilter> {
        &self.filter
    }

    pub fn subscriber(&self) -> &Arc<ShellSubscriber> {
        &self.subscriber
    }

    /// Monotonic nanoseconds since the service started
    pub fn elapsed_ns(&self) -> i64 {
        self.started.elapsed().as_nanos() as i64
    }

    pub fn wall_ns() -> i64 {
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    }

    pub fn config_keys(&self) -> Vec<ConfigKey> {
        self.managers.lock().keys().copied().collect()
    }

    pub fn has_config(&self, key: ConfigKey) -> bool {
        self.managers.lock().contains_key(&key)
    }

    /// Installs or updates a config. Updates keep the time base and carry preserved state.
    ///
    /// An invalid update removes the previously installed version.
    pub async fn add_config(
        &self,
        key: ConfigKey,
        config: &TelemetryConfig,
        elapsed_ns: i64,
        wall_ns: i64,
    ) -> Result<Option<UpdateSummary>> {
        let outcome = {
            let mut managers = self.managers.lock();
            let compiled = match managers.get(&key) {
                Some(existing) => compiler::recompile(config, key, existing.graph(), wall_ns)
                    .map(|(graph, summary)| (graph, Some(summary))),
                None => compiler::compile(config, key, elapsed_ns, wall_ns).map(|g| (g, None)),
            };
            match compiled {
                Ok((graph, summary)) => {
                    self.stats
                        .note_config_received(key, wall_ns, config.metric_count(), Ok(()));
                    let atoms = graph.interesting_atom_ids();
                    let was_restricted = managers.get(&key).map(|m| m.is_restricted());
                    let now_restricted = graph.is_restricted();
                    match managers.get_mut(&key) {
                        Some(manager) => manager.replace_graph(graph),
                        None => {
                            let manager = MetricsManager::new(
                                graph,
                                self.stats.clone(),
                                self.sink.clone(),
                                self.settings.shard_offset,
                            );
                            managers.insert(key, manager);
                        }
                    }
                    self.filter.set_atom_ids(ConsumerId::Config(key), atoms);
                    Ok((summary, was_restricted == Some(true) && !now_restricted))
                }
                Err(reason) => {
                    self.stats.note_config_received(
                        key,
                        wall_ns,
                        config.metric_count(),
                        Err(&reason),
                    );
                    let previous = managers.remove(&key);
                    self.filter.remove_consumer(ConsumerId::Config(key));
                    Err((reason, previous.is_some_and(|m| m.is_restricted())))
                }
            }
        };

        match outcome {
            Ok((summary, lost_restriction)) => {
                if lost_restriction {
                    self.delete_store(key).await;
                }
                info!("Installed config {}", key);
                Ok(summary)
            }
            Err((reason, drop_store)) => {
                warn!("Rejected config {}: {}", key, reason);
                if drop_store {
                    self.delete_store(key).await;
                }
                Err(reason.into())
            }
        }
    }

    pub async fn remove_config(&self, key: ConfigKey, wall_ns: i64) -> Result<()> {
        let manager = self
            .managers
            .lock()
            .remove(&key)
            .ok_or(TelemetryError::UnknownConfig(key))?;
        self.filter.remove_consumer(ConsumerId::Config(key));
        self.stats.note_config_removed(key, wall_ns);
        if manager.is_restricted() {
            self.delete_store(key).await;
        }
        info!("Removed config {}", key);
        Ok(())
    }

    /// Routes one event to the shell subscriber and every installed config
    pub fn on_log_event(&self, event: &LogEvent) {
        if let Err(e) = event.validate() {
            self.stats.note_invalid_event();
            warn!("Dropping invalid event: {}", e);
            return;
        }
        if !self.filter.is_atom_in_use(event.atom_id) {
            self.stats.note_atom_dropped(event.atom_id);
            return;
        }
        self.stats.note_atom_logged(event.atom_id);
        self.subscriber.on_log_event(event);

        let mut flush_needed = false;
        let mut managers = self.managers.lock();
        for manager in managers.values_mut() {
            manager.on_log_event(event);
            flush_needed |= manager.is_restricted()
                && manager.max_restricted_rows() >= self.settings.max_restricted_buffer_rows;
        }
        drop(managers);

        if flush_needed {
            debug!("Restricted buffer limit reached, requesting flush");
            self.flush_signal.notify_one();
        }
    }

    pub fn dump_report(
        &self,
        key: ConfigKey,
        dump_time_ns: i64,
        erase: bool,
    ) -> Result<ConfigMetricsReport> {
        let mut managers = self.managers.lock();
        let manager = managers
            .get_mut(&key)
            .ok_or(TelemetryError::UnknownConfig(key))?;
        Ok(manager.dump_report(dump_time_ns, erase))
    }

    pub fn fire_alarms(&self, wall_ns: i64) -> usize {
        self.managers
            .lock()
            .values_mut()
            .map(|m| m.fire_alarms(wall_ns))
            .sum()
    }

    /// Runs a read-only query on a restricted config's store on behalf of `caller`
    pub async fn query(&self, key: ConfigKey, sql: &str, caller: &str) -> Result<QueryResult> {
        let check = {
            let managers = self.managers.lock();
            match managers.get(&key) {
                None => Err(TelemetryError::UnknownConfig(key)),
                Some(m) if !m.is_restricted() => Err(TelemetryError::NotRestricted(key)),
                Some(m) if m.restricted_delegate() != Some(caller) => {
                    Err(TelemetryError::PermissionDenied {
                        key,
                        caller: caller.to_string(),
                    })
                }
                Some(_) => Ok(()),
            }
        };
        if let Err(e) = check {
            self.stats.note_restricted_query(key, false);
            return Err(e);
        }

        self.flush_config(key).await;
        let result = self.store.query(key, sql).await;
        self.stats.note_restricted_query(key, result.is_ok());
        Ok(result?)
    }

    /// Writes buffered restricted rows of every config; returns rows written
    pub async fn flush_restricted(&self) -> usize {
        let mut written = 0;
        for key in self.config_keys() {
            written += self.flush_config(key).await;
        }
        written
    }

    async fn flush_config(&self, key: ConfigKey) -> usize {
        let batches = match self.managers.lock().get_mut(&key) {
            Some(manager) => manager.take_restricted_batches(),
            None => return 0,
        };

        let mut written = 0;
        for batch in batches {
            match self.write_batch(key, &batch).await {
                Ok(rows) => written += rows,
                Err(e) => {
                    self.stats.note_restricted_flush_failed(key);
                    if e.is_retryable() {
                        warn!(
                            "Restricted flush of metric {} failed, retrying later: {}",
                            batch.metric_id, e
                        );
                        if let Some(manager) = self.managers.lock().get_mut(&key) {
                            manager.requeue_restricted_batch(batch);
                        }
                    } else {
                        error!(
                            "Dropping {} rows of metric {}: {}",
                            batch.rows.len(),
                            batch.metric_id,
                            e
                        );
                    }
                }
            }
        }
        written
    }

    async fn write_batch(&self, key: ConfigKey, batch: &RestrictedBatch) -> StorageResult<usize> {
        let written = self
            .store
            .write_batch(key, batch.metric_id, &batch.rows, batch.reset)
            .await?;
        if !batch.rows.is_empty() {
            if let Some(manager) = self.managers.lock().get_mut(&key) {
                manager.mark_restricted_table_created(batch.metric_id);
            }
        }
        Ok(written)
    }

    fn restricted_ttls(&self) -> Vec<(ConfigKey, i64)> {
        self.managers
            .lock()
            .iter()
            .filter(|(_, m)| m.is_restricted())
            .map(|(key, m)| (*key, m.restricted_ttl_ns()))
            .collect()
    }

    /// Deletes restricted rows older than each config's TTL; returns rows deleted
    pub async fn enforce_ttl(&self, wall_ns: i64) -> u64 {
        let mut deleted = 0;
        for (key, ttl_ns) in self.restricted_ttls() {
            match self.store.flush_ttl(key, wall_ns - ttl_ns).await {
                Ok(rows) => deleted += rows,
                Err(e) => warn!("TTL enforcement for config {} failed: {}", key, e),
            }
        }
        deleted
    }

    /// Deletes the stores of restricted configs that fail their integrity check
    pub async fn check_integrity(&self, wall_ns: i64) -> usize {
        let mut corrupted = 0;
        for (key, _) in self.restricted_ttls() {
            let healthy = match self.store.verify_integrity(key).await {
                Ok(healthy) => healthy,
                Err(e) => {
                    warn!("Integrity check of config {} failed: {}", key, e);
                    false
                }
            };
            if !healthy {
                error!("Restricted store of config {} is corrupted", key);
                self.stats.note_db_corrupted(key, wall_ns);
                self.delete_store(key).await;
                corrupted += 1;
            }
        }
        corrupted
    }

    async fn delete_store(&self, key: ConfigKey) {
        if let Err(e) = self.store.delete_store(key).await {
            warn!("Failed to delete restricted store of config {}: {}", key, e);
        }
    }

    pub fn snapshot_activations(&self, elapsed_ns: i64) -> ActivationSnapshot {
        let managers = self.managers.lock();
        ActivationSnapshot {
            configs: managers
                .iter()
                .map(|(key, m)| ConfigActivations {
                    key: *key,
                    activations: m.snapshot_activations(elapsed_ns),
                    restricted_categories: m.restricted_categories(),
                })
                .filter(|c| !c.activations.is_empty() || !c.restricted_categories.is_empty())
                .collect(),
        }
    }

    /// Applies a snapshot to the installed configs; returns how many configs were restored
    pub fn restore_activations(&self, snapshot: &ActivationSnapshot, elapsed_ns: i64) -> usize {
        let mut managers = self.managers.lock();
        let mut restored = 0;
        for entry in &snapshot.configs {
            if let Some(manager) = managers.get_mut(&entry.key) {
                manager.load_activations(&entry.activations, elapsed_ns);
                manager.load_restricted_categories(&entry.restricted_categories);
                restored += 1;
            }
        }
        restored
    }

    /// Writes the activation snapshot to the configured path, if any
    pub async fn save_activations(&self, elapsed_ns: i64) -> Result<()> {
        let Some(path) = &self.settings.activation_snapshot_path else {
            return Ok(());
        };
        let snapshot = self.snapshot_activations(elapsed_ns);
        let content = serde_json::to_vec_pretty(&snapshot)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, content).await?;
        debug!("Saved activations of {} configs", snapshot.configs.len());
        Ok(())
    }

    /// Reads the activation snapshot from the configured path, if present
    pub async fn load_activations(&self, elapsed_ns: i64) -> Result<usize> {
        let Some(path) = &self.settings.activation_snapshot_path else {
            return Ok(0);
        };
        if !path.exists() {
            return Ok(0);
        }
        let content = tokio::fs::read(path).await?;
        let snapshot: ActivationSnapshot = serde_json::from_slice(&content)?;
        Ok(self.restore_activations(&snapshot, elapsed_ns))
    }

    /// Flushes restricted data and persists activations
    pub async fn shutdown(&self) -> Result<()> {
        self.flush_restricted().await;
        self.save_activations(self.elapsed_ns()).await
    }

    /// Starts the periodic workers: restricted flush, TTL, integrity, alarms and subscriptions
    pub fn spawn_background(self: Arc<Self>) -> BackgroundTasks {
        let mut handles = Vec::new();

        let service = self.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(service.settings.flush_interval());
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = service.flush_signal.notified() => {}
                }
                let rows = service.flush_restricted().await;
                if rows > 0 {
                    debug!("Flushed {} restricted rows", rows);
                }
            }
        }));

        let service = self.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(service.settings.ttl_check_interval());
            loop {
                interval.tick().await;
                service.enforce_ttl(Self::wall_ns()).await;
            }
        }));

        let service = self.clone();
        handles.push(tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(service.settings.integrity_check_interval());
            loop {
                interval.tick().await;
                service.check_integrity(Self::wall_ns()).await;
            }
        }));

        let service = self.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(WORKER_TICK);
            loop {
                interval.tick().await;
                service.fire_alarms(Self::wall_ns());
            }
        }));

        handles.push(self.subscriber.clone().spawn(WORKER_TICK));
        BackgroundTasks { handles }
    }
}

/// Handles of the background workers
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}
