//! Server configuration

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use httpmeter_core::{ExporterConfig, LoggingConfig};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub exporter: ExporterConfig,
    pub multiprocess: MultiprocessConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

/// Snapshot flushing when `PROMETHEUS_MULTIPROC_DIR` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiprocessConfig {
    pub flush_interval_seconds: u64,
}

impl Default for MultiprocessConfig {
    fn default() -> Self {
        Self {
            flush_interval_seconds: 5,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // HTTPMETER_SERVER__PORT, HTTPMETER_EXPORTER__SKIP_PATHS=/health,/ready, ...
        builder = builder.add_source(
            Environment::with_prefix("HTTPMETER")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("exporter.skip_paths")
                .with_list_parse_key("exporter.skip_methods")
                .with_list_parse_key("exporter.optional_metrics")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if httpmeter_core::logging::parse_log_level(&self.logging.level).is_err() {
            errors.push(format!("logging.level '{}' is not a valid level", self.logging.level));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format '{}' must be 'json' or 'pretty'",
                self.logging.format
            ));
        }
        if self.multiprocess.flush_interval_seconds == 0 {
            errors.push("multiprocess.flush_interval_seconds must be non-zero".to_string());
        }
        if let Err(exporter_errors) = self.exporter.validate() {
            errors.extend(exporter_errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Resolve the config file path and load it.
///
/// Search order: the explicit path (`--config` / `HTTPMETER_CONFIG_PATH`),
/// then `./config.yaml`, then environment variables only.
pub fn load_config(explicit: Option<&str>) -> anyhow::Result<Config> {
    let config_path = explicit
        .map(str::to_string)
        .or_else(|| Path::new("config.yaml").exists().then(|| "config.yaml".to_string()));

    let config = match config_path {
        Some(path) => {
            eprintln!("Loading config from {path}");
            Config::from_file(&path)?
        }
        None => Config::from_env()?,
    };

    if let Err(errors) = config.validate() {
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.http_address(), "0.0.0.0:8000");
        assert_eq!(config.exporter.prefix, "starlette");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "server:\n  port: 9100\nexporter:\n  prefix: demo\n  skip_paths: ['/health']\n  optional_metrics: [response_body_size]\n",
        )
        .unwrap();

        let config = Config::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.exporter.prefix, "demo");
        assert_eq!(config.exporter.skip_paths, vec!["/health".to_string()]);
        assert!(config.exporter.group_paths);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validate_reports_every_error() {
        let mut config = Config::default();
        config.server.port = 0;
        config.logging.format = "xml".to_string();
        config.exporter.prefix = String::new();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }
}
