//! Configuration file support for replflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (REPLFLASH_*)
//! 3. Local config file (./replflash.toml)
//! 4. Global config file (~/.config/replflash/config.toml)
//!
//! `--config PATH` replaces both files.

use directories::ProjectDirs;
use log::{debug, warn};
use replflash::TransferConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the per-project config file.
pub const LOCAL_CONFIG_FILE: &str = "replflash.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
    /// Board family (esp8266, esp32, microbit).
    pub board: Option<String>,
}

/// Code execution configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Time allowed for a `run` before giving up, in milliseconds.
    pub timeout_ms: Option<u64>,
}

/// File transfer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferSection {
    /// Bytes per generated write statement.
    pub chunk_size: Option<usize>,
    /// Overall read-back timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Skip read-back verification by default.
    #[serde(default)]
    pub skip_verify: bool,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection configuration.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Execution configuration.
    #[serde(default)]
    pub exec: ExecConfig,
    /// Transfer configuration.
    #[serde(default)]
    pub transfer: TransferSection,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
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

    /// Load configuration from a specific file.
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
        ProjectDirs::from("", "", "replflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another configuration into this one. Set values in `other` win.
    fn merge(&mut self, other: Self) {
        if other.connection.serial.is_some() {
            self.connection.serial = other.connection.serial;
        }
        if other.connection.board.is_some() {
            self.connection.board = other.connection.board;
        }
        if other.exec.timeout_ms.is_some() {
            self.exec.timeout_ms = other.exec.timeout_ms;
        }
        if other.transfer.chunk_size.is_some() {
            self.transfer.chunk_size = other.transfer.chunk_size;
        }
        if other.transfer.timeout_ms.is_some() {
            self.transfer.timeout_ms = other.transfer.timeout_ms;
        }
        if other.transfer.skip_verify {
            self.transfer.skip_verify = true;
        }
    }

    /// Timeout for `run`, if configured.
    pub fn exec_timeout(&self) -> Option<Duration> {
        self.exec
            .timeout_ms
            .map(Duration::from_millis)
    }

    /// Transfer settings with configured values applied over the defaults.
    pub fn transfer_config(&self) -> TransferConfig {
        let mut config = TransferConfig::default();
        if let Some(chunk_size) = self.transfer.chunk_size {
            config = config.with_chunk_size(chunk_size);
        }
        if let Some(timeout_ms) = self.transfer.timeout_ms {
            config = config.with_timeout(Duration::from_millis(timeout_ms));
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.connection.serial.is_none());
        assert!(config.connection.board.is_none());
        assert!(config.exec.timeout_ms.is_none());
        assert!(!config.transfer.skip_verify);
    }

    #[test]
    fn test_config_merge_serial_and_board() {
        let mut base = Config::default();
        let mut other = Config::default();
        other.connection.serial = Some("/dev/ttyUSB0".to_string());
        other.connection.board = Some("esp32".to_string());

        base.merge(other);

        assert_eq!(base.connection.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(base.connection.board.as_deref(), Some("esp32"));
    }

    #[test]
    fn test_config_merge_does_not_overwrite_with_none() {
        let mut base = Config::default();
        base.connection.serial = Some("/dev/ttyUSB0".to_string());
        base.transfer.chunk_size = Some(64);

        let other = Config::default(); // all None
        base.merge(other);

        assert_eq!(base.connection.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(base.transfer.chunk_size, Some(64));
    }

    #[test]
    fn test_config_merge_skip_verify() {
        let mut base = Config::default();
        let mut other = Config::default();
        other.transfer.skip_verify = true;
        base.merge(other);
        assert!(base.transfer.skip_verify);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[connection]
serial = "/dev/ttyUSB0"
board = "microbit"

[exec]
timeout_ms = 30000

[transfer]
chunk_size = 64
timeout_ms = 20000
skip_verify = true
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.connection.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.connection.board.as_deref(), Some("microbit"));
        assert_eq!(config.exec_timeout(), Some(Duration::from_secs(30)));

        let transfer = config.transfer_config();
        assert_eq!(transfer.chunk_size, 64);
        assert_eq!(transfer.timeout, Duration::from_secs(20));
        assert!(config.transfer.skip_verify);
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.connection.serial.is_none());
        assert_eq!(config.transfer_config(), TransferConfig::default());
    }

    #[test]
    fn test_config_roundtrip_toml() {
        let mut config = Config::default();
        config.connection.serial = Some("COM3".to_string());
        config.transfer.chunk_size = Some(16);

        let text = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.connection.serial.as_deref(), Some("COM3"));
        assert_eq!(parsed.transfer.chunk_size, Some(16));
    }

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[connection]\nserial = \"/dev/ttyACM0\"\n").unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.connection.serial.as_deref(), Some("/dev/ttyACM0"));
    }

    #[test]
    fn test_load_from_path_nonexistent() {
        let config = Config::load_from_path(Path::new("/nonexistent/replflash.toml"));
        assert!(config.connection.serial.is_none());
    }

    #[test]
    fn test_load_from_path_invalid_toml_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[connection\nserial = ").unwrap();

        let config = Config::load_from_path(&path);
        assert!(config.connection.serial.is_none());
    }

    #[test]
    fn test_global_config_path_is_some() {
        if let Some(path) = Config::global_config_path() {
            assert!(path.ends_with("config.toml"));
        }
    }
}
