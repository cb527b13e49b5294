//! Bridge configuration.
//!
//! Uses RON (Rust Object Notation) so the file stays human-readable and
//! version-control-friendly. A single process-wide configuration is used by
//! the DSP thread pool, the plugin bridge and the watchdog; install it once
//! at startup with [`BridgeConfig::install`] before any of them is created.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Environment variable pointing at a RON configuration file
pub const CONFIG_ENV_VAR: &str = "PLUGBRIDGE_CONFIG";

static GLOBAL_CONFIG: OnceLock<BridgeConfig> = OnceLock::new();

/// Tunables for the bridge and the threaded plugin wrapper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Format version for future compatibility
    pub version: u32,

    /// Number of DSP worker threads (and RT channels of a shared bridge).
    /// `None` means "number of logical CPUs".
    pub dsp_threads: Option<usize>,

    /// Capacity of the UI queue channels in bytes
    pub queue_size: usize,

    /// Capacity of each real-time request channel in bytes
    pub rt_request_size: usize,

    /// Capacity of the non-real-time request channel in bytes
    pub nrt_request_size: usize,

    /// Watchdog poll interval in milliseconds
    pub watchdog_interval_ms: u64,

    /// Explicit path of the `plugin-host` executable
    pub host_path: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            version: 1,
            dsp_threads: None,
            queue_size: 1024,
            rt_request_size: 65536,
            nrt_request_size: 65536,
            watchdog_interval_ms: 5,
            host_path: None,
        }
    }
}

impl BridgeConfig {
    /// Load a configuration from a RON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let ron_string = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Self = ron::from_str(&ron_string)
            .map_err(|e| ConfigError::DeserializationFailed(e.to_string()))?;

        if config.version > 1 {
            return Err(ConfigError::UnsupportedVersion(config.version));
        }

        config.validate()?;
        Ok(config)
    }

    /// Save the configuration to a RON file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let ron_string = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| ConfigError::SerializationFailed(e.to_string()))?;

        std::fs::write(path.as_ref(), ron_string)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.dsp_threads == Some(0) {
            return Err(ConfigError::InvalidValue(
                "dsp_threads must be at least 1".to_string(),
            ));
        }
        // the header and one message must fit
        for (name, size) in [
            ("queue_size", self.queue_size),
            ("rt_request_size", self.rt_request_size),
            ("nrt_request_size", self.nrt_request_size),
        ] {
            if size < 64 {
                return Err(ConfigError::InvalidValue(format!(
                    "{name} must be at least 64 bytes, got {size}"
                )));
            }
        }
        Ok(())
    }

    /// Number of DSP threads actually used
    pub fn num_dsp_threads(&self) -> usize {
        self.dsp_threads.unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        })
    }

    /// Install the process-wide configuration.
    ///
    /// Fails if a configuration is already in use.
    pub fn install(config: Self) -> Result<(), ConfigError> {
        config.validate()?;
        GLOBAL_CONFIG
            .set(config)
            .map_err(|_| ConfigError::AlreadyInstalled)
    }

    /// Get the process-wide configuration.
    ///
    /// On first use without [`install`](Self::install), the file named by
    /// `PLUGBRIDGE_CONFIG` is loaded if present; otherwise defaults are used.
    pub fn global() -> &'static Self {
        GLOBAL_CONFIG.get_or_init(|| match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => Self::load(&path).unwrap_or_else(|e| {
                tracing::warn!(
                    "Ignoring config file {}: {}",
                    Path::new(&path).display(),
                    e
                );
                Self::default()
            }),
            None => Self::default(),
        })
    }
}

/// Errors that can occur while loading or installing a configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Unsupported config version: {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid config value: {0}")]
    InvalidValue(String),

    #[error("Configuration already installed")]
    AlreadyInstalled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.queue_size, 1024);
        assert_eq!(config.rt_request_size, 65536);
        assert_eq!(config.nrt_request_size, 65536);
        assert_eq!(config.watchdog_interval_ms, 5);
        assert!(config.num_dsp_threads() >= 1);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.ron");

        let config = BridgeConfig {
            dsp_threads: Some(3),
            host_path: Some(PathBuf::from("/opt/plugbridge/plugin-host")),
            ..BridgeConfig::default()
        };
        config.save(&path).unwrap();

        let loaded = BridgeConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.num_dsp_threads(), 3);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.ron");
        std::fs::write(&path, "(dsp_threads: Some(2))").unwrap();

        let loaded = BridgeConfig::load(&path).unwrap();
        assert_eq!(loaded.dsp_threads, Some(2));
        assert_eq!(loaded.queue_size, 1024);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.ron");

        std::fs::write(&path, "(dsp_threads: Some(0))").unwrap();
        assert!(matches!(
            BridgeConfig::load(&path),
            Err(ConfigError::InvalidValue(_))
        ));

        std::fs::write(&path, "(version: 7)").unwrap();
        assert!(matches!(
            BridgeConfig::load(&path),
            Err(ConfigError::UnsupportedVersion(7))
        ));
    }

    #[test]
    fn test_missing_file() {
        let result = BridgeConfig::load("/nonexistent/bridge.ron");
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }
}
