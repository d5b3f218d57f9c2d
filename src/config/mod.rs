//! Application configuration.
//!
//! Aggregates the store, limit and postprocessor settings into a single
//! [`Config`] that can be loaded from YAML files or environment variables.

mod limits;
mod postprocessor;
mod store;

pub use limits::{Limits, DEFAULT_BATCH_WRITE_SIZE, DEFAULT_MAX_TRANSACT_ITEMS};
pub use postprocessor::{PostprocessorConfig, DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKERS};
pub use store::{StoreConfig, StoreType, DEFAULT_FEED_TABLE, DEFAULT_MAIN_TABLE};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "SOCIALGRAPH_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "SOCIALGRAPH";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "SOCIALGRAPH_LOG";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Store backend and table names.
    pub store: StoreConfig,
    /// Transaction and batch limits.
    pub limits: Limits,
    /// Change-stream worker pool.
    pub postprocessor: PostprocessorConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings no backend can honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_transact_items == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_transact_items must be positive".to_string(),
            ));
        }
        if self.limits.batch_write_size == 0 {
            return Err(ConfigError::Invalid(
                "limits.batch_write_size must be positive".to_string(),
            ));
        }
        if self.postprocessor.workers == 0 || self.postprocessor.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "postprocessor.workers and postprocessor.queue_capacity must be positive"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serial_test::serial;

    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.store.store_type, StoreType::Memory);
        assert_eq!(config.store.table_name, "main");
        assert_eq!(config.store.feed_table_name, "feed");
        assert_eq!(config.limits.max_transact_items, 25);
        assert_eq!(config.postprocessor.workers, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "store:\n  type: dynamo\n  table_name: social\n  endpoint_url: http://localhost:8000\nlimits:\n  batch_write_size: 10\n"
        )
        .unwrap();

        let config = Config::load(file.path().to_str()).unwrap();
        assert_eq!(config.store.store_type, StoreType::Dynamo);
        assert_eq!(config.store.table_name, "social");
        assert_eq!(config.store.feed_table_name, "feed");
        assert_eq!(
            config.store.endpoint_url.as_deref(),
            Some("http://localhost:8000")
        );
        assert_eq!(config.limits.batch_write_size, 10);
        assert_eq!(config.limits.max_transact_items, 25);
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_fails() {
        assert!(matches!(
            Config::load(Some("/nonexistent/socialgraph.yaml")),
            Err(ConfigError::Load(_))
        ));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("SOCIALGRAPH__POSTPROCESSOR__WORKERS", "9");
        let config = Config::load(None);
        std::env::remove_var("SOCIALGRAPH__POSTPROCESSOR__WORKERS");

        let config = config.unwrap();
        assert_eq!(config.postprocessor.workers, 9);
        assert_eq!(config.store.store_type, StoreType::Memory);
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
store:
  type: dynamo
  timeout_ms: 250
postprocessor:
  workers: 2
  queue_capacity: 16
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.store.store_type, StoreType::Dynamo);
        assert_eq!(config.store.timeout_ms, 250);
        assert_eq!(config.postprocessor.queue_capacity, 16);
        assert_eq!(config.limits.batch_write_size, DEFAULT_BATCH_WRITE_SIZE);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = Config::for_test();
        config.postprocessor.workers = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
