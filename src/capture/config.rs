//! Capture and relay configuration.
//!
//! The TOML file has one section per subsystem; every section falls back
//! to its defaults when omitted.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use super::CaptureBackend;

/// Configuration for the camera device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Camera device index. Overridden by the settings store at startup.
    pub device_index: u32,
    /// Target frame width in pixels.
    pub width: u32,
    /// Target frame height in pixels.
    pub height: u32,
    /// Target frames per second.
    pub fps: u32,
    /// JPEG quality (1-100).
    pub jpeg_quality: u8,
    /// Internal device buffer depth; 1 keeps latency minimal.
    pub buffer_depth: u32,
    /// Backends tried in order when opening the device.
    pub backends: Vec<CaptureBackend>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            width: 640,
            height: 480,
            fps: 30,
            jpeg_quality: 80,
            buffer_depth: 1,
            backends: vec![CaptureBackend::V4l2, CaptureBackend::Auto],
        }
    }
}

impl CaptureConfig {
    /// Creates a new configuration with the specified dimensions.
    pub fn with_dimensions(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    /// Validates the configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidDimensions);
        }
        if self.fps == 0 || self.fps > 120 {
            return Err(ConfigError::InvalidFrameRate);
        }
        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err(ConfigError::InvalidQuality);
        }
        if self.backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }
        Ok(())
    }
}

/// Timing and capacity knobs for the relay loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Hard cap on active subscribers per channel.
    pub max_connections: usize,
    /// How long a connection may stay pending before it is reaped (ms).
    pub connection_timeout_ms: u64,
    /// Reaper sweep period (ms).
    pub reaper_period_ms: u64,
    /// Per-attempt wait for an inbound message while admitting (ms).
    pub receive_timeout_ms: u64,
    /// Budget for one socket write to a subscriber (ms). A subscriber whose
    /// write does not finish in time is dropped. At most `video_interval_ms`.
    pub send_timeout_ms: u64,
    /// Video broadcast cadence (ms).
    pub video_interval_ms: u64,
    /// Metadata broadcast cadence (ms).
    pub meta_interval_ms: u64,
    /// Sleep while the streaming flag is off (ms).
    pub paused_idle_ms: u64,
    /// Sleep while a channel has no active subscribers (ms).
    pub no_viewer_idle_ms: u64,
    /// Consecutive read failures before a reinit is considered.
    pub failure_threshold: u32,
    /// Minimum time between reinit attempts (ms).
    pub reconnect_interval_ms: u64,
    /// Backoff added per consecutive failure (ms).
    pub backoff_step_ms: u64,
    /// Upper bound on the failure backoff (ms).
    pub max_backoff_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            connection_timeout_ms: 10_000,
            reaper_period_ms: 5_000,
            receive_timeout_ms: 5_000,
            send_timeout_ms: 33,
            video_interval_ms: 33,
            meta_interval_ms: 100,
            paused_idle_ms: 100,
            no_viewer_idle_ms: 500,
            failure_threshold: 5,
            reconnect_interval_ms: 10_000,
            backoff_step_ms: 100,
            max_backoff_ms: 2_000,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidCapacity);
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidFailureThreshold);
        }
        if self.send_timeout_ms == 0
            || self.receive_timeout_ms == 0
            || self.reaper_period_ms == 0
            || self.video_interval_ms == 0
            || self.meta_interval_ms == 0
        {
            return Err(ConfigError::InvalidInterval);
        }
        if self.send_timeout_ms > self.video_interval_ms {
            return Err(ConfigError::SendBudgetTooLong);
        }
        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn reaper_period(&self) -> Duration {
        Duration::from_millis(self.reaper_period_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn video_interval(&self) -> Duration {
        Duration::from_millis(self.video_interval_ms)
    }

    pub fn meta_interval(&self) -> Duration {
        Duration::from_millis(self.meta_interval_ms)
    }

    pub fn paused_idle(&self) -> Duration {
        Duration::from_millis(self.paused_idle_ms)
    }

    pub fn no_viewer_idle(&self) -> Duration {
        Duration::from_millis(self.no_viewer_idle_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn backoff_step(&self) -> Duration {
        Duration::from_millis(self.backoff_step_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP/WebSocket server binds to.
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: ([127, 0, 0, 1], 8000).into(),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid frame dimensions")]
    InvalidDimensions,
    #[error("invalid frame rate (must be 1-120 fps)")]
    InvalidFrameRate,
    #[error("invalid jpeg quality (must be 1-100)")]
    InvalidQuality,
    #[error("at least one capture backend is required")]
    NoBackends,
    #[error("max_connections must be at least 1")]
    InvalidCapacity,
    #[error("failure_threshold must be at least 1")]
    InvalidFailureThreshold,
    #[error("relay intervals and timeouts must be non-zero")]
    InvalidInterval,
    #[error("send_timeout_ms must not exceed video_interval_ms")]
    SendBudgetTooLong,
    #[error("failed to read config file: {0}")]
    FileReadError(String),
    #[error("failed to parse config file: {0}")]
    ParseError(String),
}

/// Full configuration file format.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl FileConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileReadError(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Parses and validates configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: FileConfig =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.capture.validate()?;
        config.relay.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(CaptureConfig::default().validate().is_ok());
        assert!(RelayConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_dimensions_invalid() {
        let mut config = CaptureConfig::default();
        config.width = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDimensions)
        ));
    }

    #[test]
    fn test_zero_capacity_invalid() {
        let config = RelayConfig {
            max_connections: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCapacity)
        ));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = FileConfig::from_toml(
            r#"
            [capture]
            width = 1280
            height = 720
            backends = ["auto"]

            [relay]
            max_connections = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.capture.width, 1280);
        assert_eq!(config.capture.jpeg_quality, 80);
        assert_eq!(config.capture.backends, vec![CaptureBackend::Auto]);
        assert_eq!(config.relay.max_connections, 3);
        assert_eq!(config.relay.failure_threshold, 5);
        assert_eq!(config.server.bind_addr.port(), 8000);
    }

    #[test]
    fn test_invalid_file_rejected() {
        assert!(matches!(
            FileConfig::from_toml("[relay]\nmax_connections = 0\n"),
            Err(ConfigError::InvalidCapacity)
        ));
        assert!(matches!(
            FileConfig::from_toml("[relay]\nsend_timeout_ms = 1000\n"),
            Err(ConfigError::SendBudgetTooLong)
        ));
        assert!(FileConfig::from_toml("[relay]\nsend_timeout_ms = 20\n").is_ok());
        assert!(matches!(
            FileConfig::from_toml("[capture\n"),
            Err(ConfigError::ParseError(_))
        ));
    }
}
