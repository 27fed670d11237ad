//! Devmap Configuration
//!
//! Handles parsing and management of devmap.toml configuration files.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// File name searched for by [`DevmapConfig::find_and_load`]
pub const CONFIG_FILE: &str = "devmap.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration structure matching devmap.toml.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DevmapConfig {
    /// Simulated device queue
    #[serde(default)]
    pub queue: QueueConfig,

    /// Buffer used by the demo
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Log output
    #[serde(default)]
    pub log: LogConfig,
}

impl DevmapConfig {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: DevmapConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from the current directory or parents.
    pub fn load_from_cwd() -> ConfigResult<Self> {
        let cwd = std::env::current_dir()?;
        Self::find_and_load(&cwd)
    }

    /// Find and load configuration by searching up from the given directory.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let config_path = dir.join(CONFIG_FILE);
            if config_path.exists() {
                return Self::load(&config_path);
            }
            if !dir.pop() {
                return Ok(Self::default());
            }
        }
    }

    pub fn to_toml(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }
}

/// Simulated device queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Name of the queue, also used for the worker thread
    #[serde(default = "default_label")]
    pub label: String,

    /// Time the device takes to complete a map command, in microseconds
    #[serde(default)]
    pub map_latency_us: u64,

    /// Time the device takes to complete an unmap command, in microseconds
    #[serde(default)]
    pub unmap_latency_us: u64,
}

fn default_label() -> String {
    "host-queue".to_string()
}

impl QueueConfig {
    pub fn map_latency(&self) -> Duration {
        Duration::from_micros(self.map_latency_us)
    }

    pub fn unmap_latency(&self) -> Duration {
        Duration::from_micros(self.unmap_latency_us)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            label: default_label(),
            map_latency_us: 0,
            unmap_latency_us: 0,
        }
    }
}

/// Demo buffer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Number of `f32` elements
    #[serde(default = "default_elements")]
    pub elements: usize,

    /// Wait for the map to complete before returning
    #[serde(default = "default_true")]
    pub blocking: bool,
}

fn default_elements() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            elements: default_elements(),
            blocking: true,
        }
    }
}

/// Log settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing` filter directive, overridden by `DEVMAP_LOG`
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_filter() -> String {
    "warn".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}
