//! Configuration management for the streaming service

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::capture::PixelFormat;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config patch: {0}")]
    Patch(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

/// Camera device identifier: a V4L2 index or a device path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceId {
    Index(u32),
    Path(String),
}

impl DeviceId {
    /// Prefix that selects the built-in test-pattern source
    pub const SYNTHETIC_PREFIX: &'static str = "stub://";

    /// Filesystem path of the device node
    pub fn path(&self) -> String {
        match self {
            DeviceId::Index(index) => format!("/dev/video{}", index),
            DeviceId::Path(path) => path.clone(),
        }
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self, DeviceId::Path(path) if path.starts_with(Self::SYNTHETIC_PREFIX))
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        DeviceId::Index(0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Capture configuration, replaced wholesale on reconfiguration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Device index (`0` -> `/dev/video0`) or path.
    /// `stub://<name>` selects the synthetic test-pattern source.
    #[serde(default)]
    pub device: DeviceId,

    /// Frame width in pixels
    #[serde(default = "default_width")]
    pub width: u32,

    /// Frame height in pixels
    #[serde(default = "default_height")]
    pub height: u32,

    /// Frames per second
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Pixel format requested from the device
    #[serde(default)]
    pub pixel_format: PixelFormat,

    /// Frames retained for consumers before the oldest is overwritten
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// JPEG quality (0-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Fixed wait between reconnect attempts
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: f64,

    /// 0 = unlimited
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Frames older than this are never served; 0 disables the check
    #[serde(default = "default_max_frame_age")]
    pub max_frame_age_secs: f64,

    /// Driver-level wait for one frame before the read is treated as failed;
    /// 0 waits until the session is closed
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: f64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: DeviceId::default(),
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            pixel_format: PixelFormat::default(),
            buffer_size: default_buffer_size(),
            jpeg_quality: default_jpeg_quality(),
            auto_reconnect: true,
            reconnect_interval_secs: default_reconnect_interval(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            max_frame_age_secs: default_max_frame_age(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

impl CameraConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs_f64(self.reconnect_interval_secs.max(0.0))
    }

    pub fn max_frame_age(&self) -> Option<Duration> {
        (self.max_frame_age_secs > 0.0).then(|| Duration::from_secs_f64(self.max_frame_age_secs))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.read_timeout_secs.max(0.0))
    }

    /// Whether switching to `other` only takes effect after the device is reopened.
    ///
    /// Quality, frame age, buffer size and reconnect policy apply on the
    /// next frame or the next failure.
    pub fn requires_reopen(&self, other: &CameraConfig) -> bool {
        self.device != other.device
            || self.width != other.width
            || self.height != other.height
            || self.fps != other.fps
            || self.pixel_format != other.pixel_format
            || self.read_timeout_secs != other.read_timeout_secs
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Invalid(
                "camera: width and height must be > 0".to_string(),
            ));
        }

        if self.fps == 0 {
            return Err(ConfigError::Invalid("camera: fps must be > 0".to_string()));
        }

        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "camera: buffer_size must be > 0".to_string(),
            ));
        }

        if self.jpeg_quality > 100 {
            return Err(ConfigError::Invalid(format!(
                "camera: jpeg_quality must be between 0 and 100, got {}",
                self.jpeg_quality
            )));
        }

        for (name, value) in [
            ("reconnect_interval_secs", self.reconnect_interval_secs),
            ("max_frame_age_secs", self.max_frame_age_secs),
            ("read_timeout_secs", self.read_timeout_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "camera: {} must be a finite value >= 0, got {}",
                    name, value
                )));
            }
        }

        if let DeviceId::Path(path) = &self.device {
            if path.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "camera: device path cannot be empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// trace, debug, info, warn/warning, error/critical
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional log file written next to console output
    #[serde(default = "default_log_file")]
    pub log_file: Option<String>,

    /// `["*"]` allows any origin
    #[serde(default = "default_wildcard")]
    pub cors_origins: Vec<String>,

    /// `["*"]` accepts any Host header
    #[serde(default = "default_wildcard")]
    pub trusted_hosts: Vec<String>,

    /// How often a streaming client polls the frame buffer
    #[serde(default = "default_stream_poll_ms")]
    pub stream_poll_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            log_file: default_log_file(),
            cors_origins: default_wildcard(),
            trusted_hosts: default_wildcard(),
            stream_poll_ms: default_stream_poll_ms(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn stream_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stream_poll_ms.max(1))
    }

    /// Log level normalised to a `tracing` filter directive
    pub fn tracing_level(&self) -> Option<&'static str> {
        match self.log_level.to_ascii_lowercase().as_str() {
            "trace" => Some("trace"),
            "debug" => Some("debug"),
            "info" => Some("info"),
            "warn" | "warning" => Some("warn"),
            "error" | "critical" => Some("error"),
            _ => None,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("server: port must be > 0".to_string()));
        }

        if self.tracing_level().is_none() {
            return Err(ConfigError::Invalid(format!(
                "server: unknown log_level '{}'",
                self.log_level
            )));
        }

        if self.stream_poll_ms == 0 {
            return Err(ConfigError::Invalid(
                "server: stream_poll_ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

// Default value functions
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_fps() -> u32 {
    30
}
fn default_buffer_size() -> usize {
    2
}
fn default_jpeg_quality() -> u8 {
    80
}
fn default_true() -> bool {
    true
}
fn default_reconnect_interval() -> f64 {
    5.0
}
fn default_max_reconnect_attempts() -> u32 {
    10
}
fn default_max_frame_age() -> f64 {
    5.0
}
fn default_read_timeout() -> f64 {
    5.0
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_file() -> Option<String> {
    Some("camera_stream.log".to_string())
}
fn default_wildcard() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_stream_poll_ms() -> u64 {
    33
}

impl Config {
    /// Loads configuration from TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Loads configuration from TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.camera.validate()?;
        self.server.validate()
    }

    /// Saves configuration to TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns a copy with `patch` deep-merged over the current values.
    ///
    /// Objects merge key by key; any other JSON value replaces the target.
    pub fn merged(&self, patch: &serde_json::Value) -> Result<Self, ConfigError> {
        if !patch.is_object() {
            return Err(ConfigError::Invalid(
                "config patch must be a JSON object".to_string(),
            ));
        }

        let mut current = serde_json::to_value(self)?;
        merge_json(&mut current, patch);

        let merged: Config = serde_json::from_value(current)?;
        merged.validate()?;
        Ok(merged)
    }
}

fn merge_json(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match (target, patch) {
        (serde_json::Value::Object(target), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_json(existing, value)
                    }
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Result of re-reading the config file
#[derive(Debug, Clone)]
pub struct ReloadOutcome {
    pub config: Config,
    pub changed: bool,
}

/// File-backed configuration holder shared by the HTTP and signal layers
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<Config>,
}

impl ConfigStore {
    /// Loads `path`, writing the defaults there when the file does not exist.
    ///
    /// An unreadable or invalid file falls back to defaults without
    /// overwriting it.
    pub fn open<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();

        let config = if path.exists() {
            match Config::load(&path) {
                Ok(config) => config,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to load config, using defaults");
                    Config::default()
                }
            }
        } else {
            let config = Config::default();
            match config.save(&path) {
                Ok(()) => info!(path = %path.display(), "Wrote default configuration"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to write default config"),
            }
            config
        };

        Self {
            path,
            current: RwLock::new(config),
        }
    }

    /// In-memory store, never touches the filesystem until `update`
    pub fn with_config<P: Into<PathBuf>>(path: P, config: Config) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(config),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> Config {
        self.current.read().clone()
    }

    /// Re-reads the file. On failure the previous configuration stays active.
    pub fn reload(&self) -> Result<ReloadOutcome, ConfigError> {
        let config = Config::load(&self.path)?;

        let mut current = self.current.write();
        let changed = *current != config;
        *current = config.clone();

        if changed {
            info!(path = %self.path.display(), "Configuration updated");
        } else {
            info!(path = %self.path.display(), "No configuration changes detected");
        }

        Ok(ReloadOutcome { config, changed })
    }

    /// Merges `patch` into the active config, persists it, and makes it current.
    pub fn update(&self, patch: &serde_json::Value) -> Result<Config, ConfigError> {
        let mut current = self.current.write();
        let updated = current.merged(patch)?;
        updated.save(&self.path)?;
        *current = updated.clone();

        info!(path = %self.path.display(), "Configuration saved");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_example_file_matches_defaults() {
        let config = Config::from_str(include_str!("../config.example.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.camera.device, DeviceId::Index(0));
        assert_eq!(config.camera.buffer_size, 2);
        assert_eq!(config.camera.jpeg_quality, 80);
        assert_eq!(config.camera.max_reconnect_attempts, 10);
        assert_eq!(config.server.port, 8000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
[camera]
device = "/dev/video2"
width = 1280
height = 720
fps = 15
pixel_format = "mjpeg"
buffer_size = 4
jpeg_quality = 95
auto_reconnect = false
reconnect_interval_secs = 0.5
max_reconnect_attempts = 0

[server]
host = "127.0.0.1"
port = 9000
log_level = "WARNING"
log_file = "stream.log"
        "#;

        let config = Config::from_str(toml).unwrap();

        assert_eq!(config.camera.device, DeviceId::Path("/dev/video2".into()));
        assert_eq!(config.camera.width, 1280);
        assert_eq!(config.camera.pixel_format, PixelFormat::Mjpeg);
        assert_eq!(config.camera.buffer_size, 4);
        assert!(!config.camera.auto_reconnect);
        assert_eq!(config.camera.reconnect_interval(), Duration::from_millis(500));
        assert_eq!(config.server.bind_addr(), "127.0.0.1:9000");
        assert_eq!(config.server.tracing_level(), Some("warn"));
        // untouched fields keep their defaults
        assert_eq!(config.camera.max_frame_age_secs, 5.0);
    }

    #[test]
    fn test_device_index_from_toml() {
        let config = Config::from_str("[camera]\ndevice = 3\n").unwrap();
        assert_eq!(config.camera.device, DeviceId::Index(3));
        assert_eq!(config.camera.device.path(), "/dev/video3");
        assert!(!config.camera.device.is_synthetic());
    }

    #[test]
    fn test_invalid_quality() {
        let result = Config::from_str("[camera]\njpeg_quality = 101\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_dimensions() {
        assert!(Config::from_str("[camera]\nwidth = 0\n").is_err());
        assert!(Config::from_str("[camera]\nbuffer_size = 0\n").is_err());
        assert!(Config::from_str("[camera]\nreconnect_interval_secs = -1.0\n").is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        assert!(Config::from_str("[server]\nlog_level = \"loud\"\n").is_err());
    }

    #[test]
    fn test_max_frame_age_zero_disables_check() {
        let camera = CameraConfig {
            max_frame_age_secs: 0.0,
            ..Default::default()
        };
        assert_eq!(camera.max_frame_age(), None);
        assert_eq!(
            CameraConfig::default().max_frame_age(),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_requires_reopen() {
        let base = CameraConfig::default();

        let quality_only = CameraConfig {
            jpeg_quality: 40,
            max_frame_age_secs: 1.0,
            buffer_size: 8,
            ..base.clone()
        };
        assert!(!base.requires_reopen(&quality_only));

        let new_mode = CameraConfig {
            width: 1280,
            ..base.clone()
        };
        assert!(base.requires_reopen(&new_mode));

        let new_device = CameraConfig {
            device: DeviceId::Path("/dev/video1".into()),
            ..base.clone()
        };
        assert!(base.requires_reopen(&new_device));
    }

    #[test]
    fn test_merged_patch_is_deep() {
        let config = Config::default();
        let merged = config
            .merged(&json!({ "camera": { "jpeg_quality": 50 }, "server": { "port": 8081 } }))
            .unwrap();

        assert_eq!(merged.camera.jpeg_quality, 50);
        assert_eq!(merged.camera.width, 640);
        assert_eq!(merged.server.port, 8081);
        assert_eq!(merged.server.host, "0.0.0.0");
    }

    #[test]
    fn test_merged_rejects_invalid_values() {
        let config = Config::default();
        assert!(config.merged(&json!({ "camera": { "fps": 0 } })).is_err());
        assert!(config.merged(&json!({ "camera": { "width": "wide" } })).is_err());
        assert!(config.merged(&json!([1, 2, 3])).is_err());
    }

    #[test]
    fn test_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed = Config::from_str(&toml_str).unwrap();

        assert_eq!(config, parsed);
    }

    #[test]
    fn test_store_writes_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let store = ConfigStore::open(&path);
        assert!(path.exists());
        assert_eq!(store.current(), Config::default());
    }

    #[test]
    fn test_store_keeps_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[camera]\nfps = 0\n").unwrap();

        let store = ConfigStore::open(&path);
        assert_eq!(store.current(), Config::default());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "[camera]\nfps = 0\n"
        );
    }

    #[test]
    fn test_store_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let store = ConfigStore::open(&path);

        let outcome = store.reload().unwrap();
        assert!(!outcome.changed);

        std::fs::write(&path, "[camera]\njpeg_quality = 30\n").unwrap();
        let outcome = store.reload().unwrap();
        assert!(outcome.changed);
        assert_eq!(store.current().camera.jpeg_quality, 30);

        std::fs::write(&path, "[camera]\njpeg_quality = 300\n").unwrap();
        assert!(store.reload().is_err());
        assert_eq!(store.current().camera.jpeg_quality, 30);
    }

    #[test]
    fn test_store_update_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let store = ConfigStore::open(&path);

        let updated = store
            .update(&json!({ "camera": { "buffer_size": 5 } }))
            .unwrap();
        assert_eq!(updated.camera.buffer_size, 5);

        let on_disk = Config::load(&path).unwrap();
        assert_eq!(on_disk.camera.buffer_size, 5);
    }
}
