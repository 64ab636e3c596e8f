use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::engine::EngineConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP API binds to.
    pub bind_address: String,
    /// Path of the registry snapshot file.
    pub data_file: PathBuf,
    /// Root directory for completed files.
    pub storage_dir: PathBuf,
    /// Staging directory for in-flight uploads.
    pub tmp_dir: PathBuf,
    /// Cadence of the sweep-and-persist tick.
    pub update_interval: Duration,
    /// Cadence of the persist-only tick.
    pub autosave_interval: Duration,
    /// Uploads quiet for longer than this get cancelled.
    pub stall_timeout: Duration,
    /// Maximum HTTP request body size in bytes.
    pub max_upload_size: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "127.0.0.1:9090".to_string());

        let data_file = std::env::var("DATA_FILE").unwrap_or_else(|_| "db.json".to_string());
        let storage_dir = std::env::var("STORAGE_DIR").unwrap_or_else(|_| "data".to_string());
        let tmp_dir = std::env::var("TMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());

        let update_interval = env_secs("UPDATE_INTERVAL_SECS", 60);
        let autosave_interval = env_secs("AUTOSAVE_INTERVAL_SECS", 120);
        let stall_timeout = env_secs("STALL_TIMEOUT_SECS", 15 * 60);

        let max_upload_size = std::env::var("MAX_UPLOAD_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(50 * 1024 * 1024); // 50MB

        let config = Config {
            bind_address,
            data_file: PathBuf::from(data_file),
            storage_dir: PathBuf::from(storage_dir),
            tmp_dir,
            update_interval,
            autosave_interval,
            stall_timeout,
            max_upload_size,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_address.is_empty() {
            return Err(ConfigError::ValidationError(
                "BIND_ADDRESS cannot be empty".to_string(),
            ));
        }
        if self.storage_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "STORAGE_DIR cannot be empty".to_string(),
            ));
        }
        if self.data_file.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "DATA_FILE cannot be empty".to_string(),
            ));
        }
        if self.update_interval.is_zero() || self.autosave_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "tick intervals must be at least one second".to_string(),
            ));
        }
        if self.max_upload_size == 0 {
            return Err(ConfigError::ValidationError(
                "MAX_UPLOAD_SIZE must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// The engine's slice of the configuration.
    pub fn engine_config(&self) -> EngineConfig {
        let mut engine = EngineConfig::new(&self.data_file, &self.storage_dir, &self.tmp_dir);
        engine.update_interval = self.update_interval;
        engine.autosave_interval = self.autosave_interval;
        engine.stall_timeout = self.stall_timeout;
        engine
    }
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(key)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default),
    )
}
