//! Configuration Loader
//!
//! Environment-aware loading: a base TOML file, an optional
//! `<stem>.<environment>.toml` overlay next to it, then `DBMGR__SECTION__KEY`
//! environment variables. Later sources win.

use super::error::{ConfigResult, ConfigurationError};
use super::DbmgrConfig;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const ENV_PREFIX: &str = "DBMGR";

/// Loaded, validated configuration plus where it came from
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: DbmgrConfig,
    environment: String,
    source_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Wrap an already built configuration (embedding and tests)
    pub fn from_config(config: DbmgrConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: Self::detect_environment(),
            source_path: None,
        }))
    }

    /// Load configuration from a TOML file with environment auto-detection
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_file(path, &environment)
    }

    /// Load configuration from a TOML file with an explicit environment
    /// This is useful for testing without modifying global environment variables
    pub fn load_from_file(
        path: impl AsRef<Path>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigurationError::ConfigFileNotFound {
                path: path.to_path_buf(),
            });
        }

        let overlay = Self::environment_overlay_path(path, environment);
        debug!(
            base = %path.display(),
            overlay = %overlay.display(),
            environment = %environment,
            "Loading configuration"
        );

        let built = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(
                config::File::from(overlay.as_path())
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigurationError::InvalidToml {
                file_path: path.display().to_string(),
                error: e.to_string(),
            })?;

        let config: DbmgrConfig =
            built
                .try_deserialize()
                .map_err(|e| ConfigurationError::InvalidToml {
                    file_path: path.display().to_string(),
                    error: e.to_string(),
                })?;

        config.validate()?;

        info!(
            environment = %environment,
            worker_count = config.dispatcher.worker_count,
            inbound_queue_capacity = config.dispatcher.inbound_queue_capacity,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            source_path: Some(path.to_path_buf()),
        }))
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &DbmgrConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    /// Detect the deployment environment from environment variables
    pub fn detect_environment() -> String {
        env::var("DBMGR_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    fn environment_overlay_path(path: &Path, environment: &str) -> PathBuf {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dbmgr".to_string());
        path.with_file_name(format!("{stem}.{environment}.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_base_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dbmgr.toml");
        fs::write(
            &path,
            "[dispatcher]\nworker_count = 8\n\n[retry]\nreconnect_base_delay_ms = 50\n",
        )
        .unwrap();

        let manager = ConfigManager::load_from_file(&path, "test").unwrap();
        assert_eq!(manager.config().dispatcher.worker_count, 8);
        assert_eq!(manager.config().retry.reconnect_base_delay_ms, 50);
        // untouched sections keep their defaults
        assert_eq!(manager.config().dispatcher.inbound_queue_capacity, 1024);
        assert_eq!(manager.environment(), "test");
        assert_eq!(manager.source_path(), Some(path.as_path()));
    }

    #[test]
    fn test_environment_overlay_wins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dbmgr.toml");
        fs::write(&path, "[dispatcher]\nworker_count = 2\n").unwrap();
        fs::write(
            dir.path().join("dbmgr.production.toml"),
            "[dispatcher]\nworker_count = 16\n",
        )
        .unwrap();

        let production = ConfigManager::load_from_file(&path, "production").unwrap();
        assert_eq!(production.config().dispatcher.worker_count, 16);

        let staging = ConfigManager::load_from_file(&path, "staging").unwrap();
        assert_eq!(staging.config().dispatcher.worker_count, 2);
    }

    #[test]
    fn test_environment_variable_override() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dbmgr.toml");
        fs::write(&path, "[accounts]\ndefault_deadline_secs = 60\n").unwrap();

        env::set_var("DBMGR__ACCOUNTS__DEFAULT_DEADLINE_SECS", "3600");
        let manager = ConfigManager::load_from_file(&path, "test");
        env::remove_var("DBMGR__ACCOUNTS__DEFAULT_DEADLINE_SECS");

        assert_eq!(manager.unwrap().config().accounts.default_deadline_secs, 3600);
    }

    #[test]
    fn test_missing_file_reported() {
        let err = ConfigManager::load_from_file("/nonexistent/dbmgr.toml", "test").unwrap_err();
        assert!(matches!(err, ConfigurationError::ConfigFileNotFound { .. }));
    }

    #[test]
    fn test_invalid_values_rejected_after_merge() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dbmgr.toml");
        fs::write(&path, "[dispatcher]\nworker_count = 0\n").unwrap();

        let err = ConfigManager::load_from_file(&path, "test").unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidValue { .. }));
    }
}
