use anyhow::{Context, Result};
use deployplan_core::coordinator::{CoordinatorConfig, LATEST_ATTEMPTS_WINDOW};
use deployplan_core::plan::CompilerOptions;
use deployplan_core::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub compiler: CompilerOptions,

    #[serde(default)]
    pub coordinator: CoordinatorSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_records_file")]
    pub records_file: String,
}

fn default_records_file() -> String {
    "records.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            records_file: default_records_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_attempt_timeout_ms() -> u64 {
    30_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            backoff_multiplier: settings.backoff_multiplier,
            attempt_timeout: Duration::from_millis(settings.attempt_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    #[serde(default = "default_latest_attempts_window")]
    pub latest_attempts_window: usize,
}

fn default_latest_attempts_window() -> usize {
    LATEST_ATTEMPTS_WINDOW
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            latest_attempts_window: default_latest_attempts_window(),
        }
    }
}

impl AppConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self {
                data_dir: data_dir.clone(),
                storage: Default::default(),
                retry: Default::default(),
                compiler: Default::default(),
                coordinator: Default::default(),
            }
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Get the deployment record store path
    pub fn records_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.records_file)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::from(&self.retry)
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            latest_attempts_window: self.coordinator.latest_attempts_window,
            retry: self.retry_config(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("data");
        let config = AppConfig::load(&dir.path().join("absent.toml"), data_dir.clone()).unwrap();

        assert!(data_dir.is_dir());
        assert_eq!(config.records_path(), data_dir.join("records.redb"));
        assert_eq!(config.compiler.merge_type, "AttiniMergeOutput");
        assert_eq!(config.coordinator_config(), CoordinatorConfig::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("deployplan.toml");
        std::fs::write(
            &config_path,
            r#"
[storage]
records_file = "attempts.redb"

[retry]
max_retries = 7
attempt_timeout_ms = 500

[compiler]
merge_type = "JoinOutputs"
"#,
        )
        .unwrap();

        let config = AppConfig::load(&config_path, dir.path().to_path_buf()).unwrap();
        assert_eq!(config.records_path(), dir.path().join("attempts.redb"));
        assert_eq!(config.compiler.merge_type, "JoinOutputs");
        assert_eq!(config.coordinator.latest_attempts_window, 5);

        let retry = config.retry_config();
        assert_eq!(retry.max_retries, 7);
        assert_eq!(retry.attempt_timeout, Duration::from_millis(500));
        assert_eq!(retry.initial_backoff, Duration::from_millis(100));
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("deployplan.toml");
        std::fs::write(&config_path, "[retry]\nmax_retries = \"lots\"\n").unwrap();

        assert!(AppConfig::load(&config_path, dir.path().to_path_buf()).is_err());
    }
}
