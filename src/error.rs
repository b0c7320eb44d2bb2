use crate::compiler::reason::InvalidConfigReason;
use crate::config::{ConfigError, ConfigKey};
use crate::event::EventError;
use crate::storage::StorageError;
use crate::subscription::SubscriptionError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid config: {0}")]
    InvalidConfig(#[from] InvalidConfigReason),

    #[error("Invalid event: {0}")]
    Event(#[from] EventError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown config {0}")]
    UnknownConfig(ConfigKey),

    #[error("Config {0} has no restricted metrics")]
    NotRestricted(ConfigKey),

    #[error("Permission denied: {caller} is not the delegate of config {key}")]
    PermissionDenied { key: ConfigKey, caller: String },
}

pub type Result<T> = std::result::Result<T, TelemetryError>;
