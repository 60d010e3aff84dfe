//! Pipeline configuration
//!
//! Loaded from TOML. Every field is optional; anything left out falls back
//! to what the hardware recommends or to the defaults below.
//!
//! ```toml
//! [driver]
//! wake_interval_ms = 100
//! drain_timeout_ms = 5000
//!
//! [input]
//! encoding = "H264"
//!
//! [output]
//! encoding = "I420"
//! width = 1920
//! height = 1080
//! buffer_num = 4
//!
//! [capture]
//! directory = "/home/pi/videos"
//! extension = "raw"
//! ```

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::DEFAULT_WAKE_INTERVAL_MS;
use crate::error::ConfigError;
use crate::port::PortConfig;

/// Driver loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Longest single wait for a trigger before cancellation is rechecked
    pub wake_interval_ms: u64,
    /// Cap on draining a port; absent means wait for every buffer
    pub drain_timeout_ms: Option<u64>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            wake_interval_ms: DEFAULT_WAKE_INTERVAL_MS,
            drain_timeout_ms: None,
        }
    }
}

impl DriverConfig {
    pub fn wake_interval(&self) -> Duration {
        Duration::from_millis(self.wake_interval_ms.max(1))
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_ms.map(Duration::from_millis)
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// Where file sinks write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub directory: PathBuf,
    pub extension: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("captures"),
            extension: "raw".to_string(),
        }
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub driver: DriverConfig,
    pub input: PortConfig,
    pub output: PortConfig,
    pub capture: CaptureConfig,
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.input.validate()?;
        config.output.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text = self.to_toml_string()?;
        let write_error = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_error)?;
        }
        fs::write(path, text).map_err(write_error)?;
        tracing::info!("Saved configuration to {}", path.display());
        Ok(())
    }

    /// Per-user configuration file location
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        ProjectDirs::from("org", "mmal", "mmal-pipeline")
            .map(|dirs| dirs.config_dir().join("pipeline.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load from [`PipelineConfig::default_path`], or fall back to defaults
    pub fn load_or_default() -> Self {
        let path = match Self::default_path() {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!("{}, using defaults", e);
                return Self::default();
            }
        };
        if !path.exists() {
            tracing::debug!("No configuration at {}, using defaults", path.display());
            return Self::default();
        }
        Self::load(&path).unwrap_or_else(|e| {
            tracing::warn!("{}, using defaults", e);
            Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::Encoding;
    use tempfile::tempdir;

    #[test]
    fn test_empty_config_is_default() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.driver.wake_interval(), Duration::from_millis(DEFAULT_WAKE_INTERVAL_MS));
        assert!(config.driver.drain_timeout().is_none());
    }

    #[test]
    fn test_parse_port_fields() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [driver]
            drain_timeout_ms = 250

            [input]
            encoding = "H264"

            [output]
            encoding = "I420"
            width = 1920
            height = 1080
            buffer_num = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.driver.drain_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.input.encoding, Some(Encoding::H264));
        assert_eq!(config.output.encoding, Some(Encoding::I420));
        assert_eq!(config.output.width, Some(1920));
        assert_eq!(config.output.buffer_num, Some(4));
        assert_eq!(config.output.buffer_size, None);
    }

    #[test]
    fn test_invalid_encoding_rejected() {
        let err = PipelineConfig::from_toml_str("[output]\nencoding = \"TOOLONG\"\n");
        assert!(matches!(err, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_unpaddable_resolution_rejected() {
        let err = PipelineConfig::from_toml_str("[output]\nwidth = 4294967294\nheight = 16\n");
        assert!(matches!(
            err,
            Err(ConfigError::InvalidResolution { width: 4294967294, height: 16 })
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("pipeline.toml");

        let mut config = PipelineConfig::default();
        config.output = PortConfig::new(Encoding::MJPEG).with_resolution(640, 480);
        config.capture.extension = "mjpeg".to_string();
        config.save(&path).unwrap();

        assert_eq!(PipelineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let err = PipelineConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
