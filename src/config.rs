//! Configuration management for the admission service.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::admission::{PolicyTable, RateLimits};
use crate::error::{AdmissionError, Result};

/// Prefix of environment variables overriding the configuration file,
/// e.g. `ADMISSION__LOGGING__LEVEL=debug`.
pub const ENV_PREFIX: &str = "ADMISSION";

/// Main configuration for the admission service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Rate limits per principal
    #[serde(default)]
    pub rate_limits: RateLimits,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log filter, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AdmissionConfig {
    /// Load configuration from an optional file layered with environment
    /// overrides. The file format is taken from its extension.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }

        let config = builder
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| AdmissionError::Config(e.to_string()))
    }

    /// Validate the rate limits and build the policy table.
    pub fn policy_table(&self) -> Result<PolicyTable> {
        self.rate_limits.clone().into_table()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{RateLimitPolicy, Resolution};

    #[test]
    fn test_defaults() {
        let config = AdmissionConfig::default();
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert!(config.rate_limits.limits.is_empty());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
logging:
  json: true
rate_limits:
  limits:
    - principal: framework1
      qps: 1
      capacity: 2
  aggregate_default_qps: 0.5
"#;
        let config = AdmissionConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.json);

        let table = config.policy_table().unwrap();
        assert_eq!(
            table.resolve(Some("framework1")),
            Resolution::Explicit(RateLimitPolicy::new(Some(1.0), Some(2)))
        );
        assert_eq!(
            table.resolve(Some("other")),
            Resolution::AggregateDefault(RateLimitPolicy::with_qps(0.5))
        );
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("admission-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"{"logging": {"level": "debug"}, "rate_limits": {"limits": [{"principal": "p", "qps": 2}]}}"#,
        )
        .unwrap();

        let config = AdmissionConfig::load(Some(&path));
        std::fs::remove_file(&path).unwrap();

        let config = config.unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.rate_limits.limits[0].qps, Some(2.0));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let path = std::env::temp_dir().join("admission-does-not-exist.yaml");
        let err = AdmissionConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, AdmissionError::Config(_)));
    }
}
