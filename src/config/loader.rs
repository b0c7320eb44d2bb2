//! Loading configuration documents from disk or strings

use super::{ConfigError, TelemetryConfig};
use std::path::Path;
use tokio::fs;

/// Serialization format of a configuration document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Ok(Self::Yaml),
            Some("json") => Ok(Self::Json),
            Some("toml") => Ok(Self::Toml),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or_default().to_string(),
            )),
        }
    }
}

pub fn parse_config(content: &str, format: ConfigFormat) -> Result<TelemetryConfig, ConfigError> {
    let config = match format {
        ConfigFormat::Yaml => serde_yaml::from_str(content)?,
        ConfigFormat::Json => serde_json::from_str(content)?,
        ConfigFormat::Toml => toml::from_str(content)?,
    };
    Ok(config)
}

pub fn load_config_sync(path: &Path) -> Result<TelemetryConfig, ConfigError> {
    let format = ConfigFormat::from_path(path)?;
    let content = std::fs::read_to_string(path)?;
    parse_config(&content, format)
}

pub async fn load_config(path: &Path) -> Result<TelemetryConfig, ConfigError> {
    let format = ConfigFormat::from_path(path)?;
    let content = fs::read_to_string(path).await?;
    let config = parse_config(&content, format)?;
    tracing::debug!(
        "Loaded config {} from {} ({} metrics)",
        config.id,
        path.display(),
        config.metric_count()
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_by_extension() {
        let temp_dir = TempDir::new().unwrap();

        let yaml_path = temp_dir.path().join("config.yaml");
        std::fs::write(&yaml_path, "id: 7\nalarms:\n  - id: 1\n    offset_millis: 10\n    period_millis: 20\n").unwrap();
        let config = load_config(&yaml_path).await.unwrap();
        assert_eq!(config.id, 7);
        assert_eq!(config.alarms.len(), 1);

        let json_path = temp_dir.path().join("config.json");
        std::fs::write(&json_path, r#"{"id": 8, "no_report_metrics": [3]}"#).unwrap();
        let config = load_config(&json_path).await.unwrap();
        assert_eq!(config.no_report_metrics, vec![3]);

        let toml_path = temp_dir.path().join("config.toml");
        std::fs::write(
            &toml_path,
            "id = 9\n\n[[event_metrics]]\nid = 4\nwhat = 1\n",
        )
        .unwrap();
        let config = load_config(&toml_path).await.unwrap();
        assert_eq!(config.event_metrics[0].what, Some(1));
    }

    #[test]
    fn test_unsupported_extension() {
        let result = load_config_sync(Path::new("config.ini"));
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(ext)) if ext == "ini"));
    }

    #[test]
    fn test_parse_error_is_reported() {
        let result = parse_config("id: [", ConfigFormat::Yaml);
        assert!(matches!(result, Err(ConfigError::Yaml(_))));
    }
}
