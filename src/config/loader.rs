//! Configuration Loader
//!
//! Environment-aware configuration loading. Sources are merged in order,
//! later sources overriding earlier ones:
//!
//! 1. [`PubSubConfig::default`]
//! 2. `{config_dir}/fanout.{toml,yaml,json}` (optional)
//! 3. `{config_dir}/fanout-{environment}.{toml,yaml,json}` (optional)
//! 4. `FANOUT_*` environment variables, e.g. `FANOUT_RETRY_BACKOFF_MS=250`

use config::{Config, Environment, File};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::PubSubConfig;
use crate::error::PubSubResult;

const CONFIG_FILE_STEM: &str = "fanout";
const ENV_PREFIX: &str = "FANOUT";

/// Loaded, validated configuration plus the context it was loaded in
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: PubSubConfig,
    environment: String,
    config_directory: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> PubSubResult<Arc<ConfigManager>> {
        Self::load_from_directory(Some(PathBuf::from("config")))
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> PubSubResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment
    /// This is useful for testing without modifying global environment variables
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> PubSubResult<Arc<ConfigManager>> {
        debug!(
            environment = %environment,
            config_dir = ?config_dir,
            "Loading fan-out configuration"
        );

        let mut builder = Config::builder().add_source(Config::try_from(&PubSubConfig::default())?);

        if let Some(dir) = &config_dir {
            builder = builder
                .add_source(File::from(dir.join(CONFIG_FILE_STEM)).required(false))
                .add_source(
                    File::from(dir.join(format!("{CONFIG_FILE_STEM}-{environment}")))
                        .required(false),
                );
        }

        let config: PubSubConfig = builder
            .add_source(Self::environment_source())
            .build()?
            .try_deserialize()?;

        Self::finish(config, environment.to_string(), config_dir)
    }

    /// Load a single, required configuration file (plus environment overrides)
    pub fn load_from_file(path: &Path) -> PubSubResult<Arc<ConfigManager>> {
        let config: PubSubConfig = Config::builder()
            .add_source(Config::try_from(&PubSubConfig::default())?)
            .add_source(File::from(path).required(true))
            .add_source(Self::environment_source())
            .build()?
            .try_deserialize()?;

        Self::finish(
            config,
            Self::detect_environment(),
            path.parent().map(Path::to_path_buf),
        )
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &PubSubConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> Option<&Path> {
        self.config_directory.as_deref()
    }

    fn finish(
        config: PubSubConfig,
        environment: String,
        config_directory: Option<PathBuf>,
    ) -> PubSubResult<Arc<ConfigManager>> {
        config.validate()?;

        debug!(config = %config.debug_config(), "Configuration loaded successfully");
        info!(
            environment = %environment,
            cache_ttl_ms = config.topology_cache_ttl_ms,
            retry_backoff_ms = config.retry_backoff_ms,
            max_retry_attempts = ?config.max_retry_attempts,
            "⚙️ Fan-out configuration loaded"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment,
            config_directory,
        }))
    }

    fn environment_source() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    /// Detect current environment
    pub fn detect_environment() -> String {
        env::var("FANOUT_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_missing_directory_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test")
                .unwrap();
        assert_eq!(
            manager.config().topology_cache_ttl_ms,
            PubSubConfig::default().topology_cache_ttl_ms
        );
        assert_eq!(manager.environment(), "test");
    }

    #[test]
    fn test_environment_file_overrides_base_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("fanout.toml"),
            "retry_backoff_ms = 250\nreceive_batch_size = 5\n",
        )
        .unwrap();
        fs::write(dir.path().join("fanout-test.toml"), "receive_batch_size = 2\n").unwrap();

        let manager =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test")
                .unwrap();
        assert_eq!(manager.config().retry_backoff_ms, 250);
        assert_eq!(manager.config().receive_batch_size, 2);
        assert_eq!(
            manager.config().visibility_timeout_seconds,
            PubSubConfig::default().visibility_timeout_seconds
        );
    }

    #[test]
    fn test_invalid_file_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "receive_batch_size = 0\n").unwrap();

        assert!(ConfigManager::load_from_file(&path).is_err());
    }

    #[test]
    fn test_yaml_file_is_supported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fanout.yaml");
        fs::write(&path, "grant_external_publish: false\nshutdown_timeout_ms: 100\n").unwrap();

        let manager = ConfigManager::load_from_file(&path).unwrap();
        assert!(!manager.config().grant_external_publish);
        assert_eq!(manager.config().shutdown_timeout_ms, 100);
        assert_eq!(manager.config_directory(), Some(dir.path()));
    }
}
