//! Controller configuration
//!
//! A YAML document selecting the worker pool size and the plugins to
//! load. Plugin blocks stay raw until each plugin parses its own typed
//! configuration; a block naming an unknown plugin is a startup-fatal
//! error (enforced when the engine is built).

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::Error;

fn default_workers() -> usize {
    1
}

/// Top-level controller configuration document
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Parallel reconcile workers; distinct policies reconcile
    /// concurrently, one policy never does
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Plugin configuration blocks keyed by plugin name
    #[serde(default)]
    pub plugins: BTreeMap<String, serde_yaml::Value>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            plugins: BTreeMap::new(),
        }
    }
}

impl ControllerConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            Error::config(format!("unable to read config {}: {err}", path.display()))
        })?;
        let config: Self = serde_yaml::from_str(&raw).map_err(|err| {
            Error::config(format!("unable to parse config {}: {err}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_document_gets_defaults() {
        let config: ControllerConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.workers, 1);
        assert!(config.plugins.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn full_document_parses() {
        let config: ControllerConfig = serde_yaml::from_str(
            r#"
workers: 4
plugins:
  cpu:
    utilizationToleration: 0.1
  prometheus:
    toleration: 0.05
    defaultTimeoutSeconds: 10
    defaultServer:
      serverAddress: http://prometheus.monitoring:9090
  simple: {}
"#,
        )
        .unwrap();

        assert_eq!(config.workers, 4);
        assert_eq!(config.plugins.len(), 3);
        assert!(config.plugins.contains_key("cpu"));
        assert!(config.plugins.contains_key("prometheus"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config: ControllerConfig = serde_yaml::from_str("workers: 0").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = ControllerConfig::load(Path::new("/nonexistent/updraft.yaml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
