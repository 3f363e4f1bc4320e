//! Service configuration
//!
//! Loaded through figment: defaults, then a YAML file, then `TELSRV_`
//! environment overrides (nested keys separated by `__`).

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TelSrvError};
use crate::model::FrameMode;

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub service: ServiceSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub modbus: ModbusSettings,
    #[serde(default)]
    pub command: CommandSettings,
    #[serde(default)]
    pub directory: DirectorySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    pub name: String,
    pub log_dir: String,
    pub log_level: String,
    /// Log to console instead of rolling files
    pub console: bool,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: "telsrv".to_string(),
            log_dir: "logs".to_string(),
            log_level: "info".to_string(),
            console: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// SQLite database path for history rows and directory tables
    pub db_path: String,
    /// Redis URL for the latest-value cache; `None` disables the cache
    pub redis_url: Option<String>,
    /// Flush when this many results have accumulated
    pub batch_size: usize,
    /// Flush this long after the first unflushed insertion
    pub flush_interval_ms: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            db_path: "telsrv.db".to_string(),
            redis_url: None,
            batch_size: 100,
            flush_interval_ms: 200,
        }
    }
}

impl StorageSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusSettings {
    /// Seconds before an unanswered request is swept
    pub response_timeout_secs: u64,
    /// Maximum address gap bridged when merging registers into one read
    pub merge_gap: u16,
    /// Default frame mode for listen links without an explicit setting
    pub listen_frame_mode: FrameMode,
    /// Poll scheduler tick in milliseconds
    pub poll_tick_ms: u64,
}

impl Default for ModbusSettings {
    fn default() -> Self {
        Self {
            response_timeout_secs: 10,
            merge_gap: 1,
            listen_frame_mode: FrameMode::Checksum,
            poll_tick_ms: 1000,
        }
    }
}

impl ModbusSettings {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn poll_tick(&self) -> Duration {
        Duration::from_millis(self.poll_tick_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSettings {
    /// Default wait for a device acknowledgement
    pub default_timeout_ms: u64,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 10_000,
        }
    }
}

impl CommandSettings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectorySettings {
    /// Minimum seconds between snapshot reload attempts
    pub reload_cooldown_secs: u64,
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self {
            reload_cooldown_secs: 5,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service: ServiceSettings::default(),
            storage: StorageSettings::default(),
            modbus: ModbusSettings::default(),
            command: CommandSettings::default(),
            directory: DirectorySettings::default(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration: defaults <- YAML file <- `TELSRV_` env vars
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: ServiceConfig = Figment::from(Serialized::defaults(ServiceConfig::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("TELSRV_").split("__"))
            .extract()
            .map_err(|e| TelSrvError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would stall or spin the pipeline
    pub fn validate(&self) -> Result<()> {
        if self.storage.batch_size == 0 {
            return Err(TelSrvError::ConfigError(
                "storage.batch_size must be at least 1".to_string(),
            ));
        }
        if self.storage.flush_interval_ms == 0 {
            return Err(TelSrvError::ConfigError(
                "storage.flush_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.modbus.response_timeout_secs == 0 {
            return Err(TelSrvError::ConfigError(
                "modbus.response_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.modbus.poll_tick_ms == 0 {
            return Err(TelSrvError::ConfigError(
                "modbus.poll_tick_ms must be at least 1".to_string(),
            ));
        }
        if self.command.default_timeout_ms == 0 {
            return Err(TelSrvError::ConfigError(
                "command.default_timeout_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
