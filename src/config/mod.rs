//! Configuration documents and daemon settings

pub mod document;
pub mod loader;
pub mod settings;

pub use document::*;
pub use loader::{load_config, load_config_sync, parse_config, ConfigFormat};
pub use settings::DaemonSettings;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identifies one installed configuration: the owner uid plus the config id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigKey {
    pub uid: i32,
    pub id: i64,
}

impl ConfigKey {
    pub fn new(uid: i32, id: i64) -> Self {
        Self { uid, id }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.uid, self.id)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Unsupported config format: '{0}'")]
    UnsupportedFormat(String),
}
