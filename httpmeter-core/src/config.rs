use serde::{Deserialize, Serialize};

/// Metrics that are only created and recorded when requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionalMetric {
    /// `{prefix}_response_body_bytes_total`
    ResponseBodySize,
    /// `{prefix}_request_body_bytes_total`
    RequestBodySize,
}

/// Declarative part of the metrics layer configuration.
///
/// Label resolvers, exemplar generators, route trees and registries are not
/// serializable and are set on the layer builder instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    /// Replace concrete paths with their route template.
    pub group_paths: bool,
    pub app_name: String,
    /// Metric name prefix.
    pub prefix: String,
    /// Histogram bucket boundaries; `None` uses the prometheus defaults.
    pub buckets: Option<Vec<f64>>,
    /// Drop requests that match no route.
    pub filter_unhandled_paths: bool,
    /// Record requests that match no route under `__unknown__`.
    pub group_unhandled_paths: bool,
    /// Regular expressions, full-matched against the request path.
    pub skip_paths: Vec<String>,
    /// Methods never recorded, e.g. `OPTIONS`.
    pub skip_methods: Vec<String>,
    pub optional_metrics: Vec<OptionalMetric>,
    /// Deprecated and ignored: status codes are always rendered as
    /// three-digit integers. Kept so existing config files still load.
    #[doc(hidden)]
    pub always_use_int_status: bool,
    /// Prefix stripped from request paths before matching and labelling.
    pub root_path: Option<String>,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            group_paths: true,
            app_name: "starlette".to_string(),
            prefix: "starlette".to_string(),
            buckets: None,
            filter_unhandled_paths: true,
            group_unhandled_paths: false,
            skip_paths: Vec::new(),
            skip_methods: Vec::new(),
            optional_metrics: Vec::new(),
            always_use_int_status: false,
            root_path: None,
        }
    }
}

impl ExporterConfig {
    pub fn is_enabled(&self, metric: OptionalMetric) -> bool {
        self.optional_metrics.contains(&metric)
    }

    /// Check values the layer cannot work with. Returns every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.prefix.is_empty() {
            errors.push("exporter.prefix must not be empty".to_string());
        } else if !self
            .prefix
            .chars()
            .enumerate()
            .all(|(i, c)| c == '_' || c == ':' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit()))
        {
            errors.push(format!("exporter.prefix '{}' is not a valid metric name", self.prefix));
        }

        if let Some(buckets) = &self.buckets {
            if buckets.is_empty() {
                errors.push("exporter.buckets must not be empty when set".to_string());
            }
            if buckets.windows(2).any(|w| w[0] >= w[1]) {
                errors.push("exporter.buckets must be strictly increasing".to_string());
            }
        }

        for pattern in &self.skip_paths {
            if let Err(e) = regex::Regex::new(pattern) {
                errors.push(format!("exporter.skip_paths entry '{pattern}' is invalid: {e}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `json` or `pretty`.
    pub format: String,
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ExporterConfig::default();
        assert!(config.group_paths);
        assert!(config.filter_unhandled_paths);
        assert!(!config.group_unhandled_paths);
        assert_eq!(config.prefix, "starlette");
        assert_eq!(config.app_name, "starlette");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: ExporterConfig = serde_json::from_str(
            r#"{"prefix": "myapp", "optional_metrics": ["response_body_size"], "skip_paths": ["/health"]}"#,
        )
        .unwrap();
        assert_eq!(config.prefix, "myapp");
        assert!(config.is_enabled(OptionalMetric::ResponseBodySize));
        assert!(!config.is_enabled(OptionalMetric::RequestBodySize));
        assert_eq!(config.skip_paths, vec!["/health".to_string()]);
        assert!(config.group_paths);
    }

    #[test]
    fn test_legacy_int_status_key_still_loads() {
        let config: ExporterConfig =
            serde_json::from_str(r#"{"always_use_int_status": true, "app_name": "legacy"}"#).unwrap();
        assert_eq!(config.app_name, "legacy");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_collects_errors() {
        let config = ExporterConfig {
            prefix: "9bad".to_string(),
            buckets: Some(vec![1.0, 0.5]),
            skip_paths: vec!["(".to_string()],
            ..ExporterConfig::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }
}
