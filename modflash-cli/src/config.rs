//! Configuration file support for modflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (MODFLASH_*)
//! 3. Local config file (./modflash.toml)
//! 4. Global config file (~/.config/modflash/config.toml)
//!
//! Arguments and environment variables are resolved by clap; this module
//! only merges the two files and fills in whatever the command line left open.

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the per-project config file.
pub const LOCAL_CONFIG: &str = "modflash.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub port: Option<String>,
}

/// Upload configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Retries after the first failed attempt.
    pub retries: Option<u32>,
    /// Delay between attempts in milliseconds.
    pub retry_delay_ms: Option<u64>,
    /// Wait after flashing the loader, in milliseconds.
    pub settle_ms: Option<u64>,
    /// Reset the board with a 1200bps touch before uploading.
    #[serde(default)]
    pub touch: bool,
    /// Wait for the board to re-enumerate after the touch.
    pub touch_wait: Option<bool>,
}

/// Loader programmer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgrammerConfig {
    /// Command template (`{serial.port.file}`, `{loader.sketch}`, `{tool_dir}`).
    pub command: Option<String>,
    /// Directory substituted for `{tool_dir}`.
    pub tool_dir: Option<PathBuf>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Upload settings.
    #[serde(default)]
    pub upload: UploadConfig,
    /// Programmer settings.
    #[serde(default)]
    pub programmer: ProgrammerConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "modflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set values in `other` win.
    fn merge(&mut self, other: Self) {
        if other.connection.port.is_some() {
            self.connection.port = other.connection.port;
        }

        if other.upload.retries.is_some() {
            self.upload.retries = other.upload.retries;
        }
        if other.upload.retry_delay_ms.is_some() {
            self.upload.retry_delay_ms = other.upload.retry_delay_ms;
        }
        if other.upload.settle_ms.is_some() {
            self.upload.settle_ms = other.upload.settle_ms;
        }
        if other.upload.touch {
            self.upload.touch = true;
        }
        if other.upload.touch_wait.is_some() {
            self.upload.touch_wait = other.upload.touch_wait;
        }

        if other.programmer.command.is_some() {
            self.programmer.command = other.programmer.command;
        }
        if other.programmer.tool_dir.is_some() {
            self.programmer.tool_dir = other.programmer.tool_dir;
        }
    }

    /// Delay between attempts, when configured.
    pub fn retry_delay(&self) -> Option<Duration> {
        self.upload.retry_delay_ms.map(Duration::from_millis)
    }

    /// Loader settle delay, when configured.
    pub fn settle_delay(&self) -> Option<Duration> {
        self.upload.settle_ms.map(Duration::from_millis)
    }
}
