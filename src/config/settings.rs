//! Daemon runtime settings

use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// Directory holding restricted metric databases
    pub data_dir: PathBuf,
    pub flush_interval_secs: u64,
    /// Buffered rows per restricted metric that trigger an early flush
    pub max_restricted_buffer_rows: usize,
    pub ttl_check_interval_secs: u64,
    pub integrity_check_interval_secs: u64,
    pub filter_enabled: bool,
    pub shard_offset: u32,
    pub max_subscriptions: usize,
    pub heartbeat_interval_millis: u64,
    pub min_callback_interval_millis: u64,
    pub activation_snapshot_path: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("telemd-data"),
            flush_interval_secs: 60,
            max_restricted_buffer_rows: 1000,
            ttl_check_interval_secs: 3600,
            integrity_check_interval_secs: 6 * 3600,
            filter_enabled: true,
            shard_offset: 0,
            max_subscriptions: 20,
            heartbeat_interval_millis: 1000,
            min_callback_interval_millis: 1000,
            activation_snapshot_path: None,
            log_level: None,
        }
    }
}

impl DaemonSettings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut settings: DaemonSettings = toml::from_str(&content)?;
        settings.merge_env_vars();
        Ok(settings)
    }

    pub fn merge_env_vars(&mut self) {
        if let Ok(dir) = std::env::var("TELEMD_DB_DIR") {
            self.data_dir = PathBuf::from(dir);
        }

        if let Ok(interval) = std::env::var("TELEMD_FLUSH_INTERVAL_SECS") {
            if let Ok(value) = interval.parse::<u64>() {
                self.flush_interval_secs = value;
            }
        }

        if let Ok(enabled) = std::env::var("TELEMD_FILTER_ENABLED") {
            if let Ok(value) = enabled.parse::<bool>() {
                self.filter_enabled = value;
            }
        }

        if let Ok(offset) = std::env::var("TELEMD_SHARD_OFFSET") {
            if let Ok(value) = offset.parse::<u32>() {
                self.shard_offset = value;
            }
        }

        if let Ok(level) = std::env::var("TELEMD_LOG") {
            self.log_level = Some(level);
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    pub fn ttl_check_interval(&self) -> Duration {
        Duration::from_secs(self.ttl_check_interval_secs.max(1))
    }

    pub fn integrity_check_interval(&self) -> Duration {
        Duration::from_secs(self.integrity_check_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_settings_fill_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("telemd.toml");
        std::fs::write(&path, "flush_interval_secs = 5\nmax_subscriptions = 3\n").unwrap();

        let settings: DaemonSettings =
            toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(settings.flush_interval_secs, 5);
        assert_eq!(settings.max_subscriptions, 3);
        assert!(settings.filter_enabled);
        assert_eq!(settings.heartbeat_interval_millis, 1000);
    }

    #[test]
    fn test_zero_intervals_clamp() {
        let settings = DaemonSettings {
            flush_interval_secs: 0,
            ..DaemonSettings::default()
        };
        assert_eq!(settings.flush_interval(), Duration::from_secs(1));
    }
}
