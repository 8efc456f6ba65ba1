// Configuration system for the Minori client

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Inference backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base address of the inference service (http or https)
    pub base_url: String,
    /// Connect the realtime channel when the camera starts
    pub realtime_enabled: bool,
    pub realtime_path: String,
    pub discrete_path: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// How long a realtime submission waits for its result message
    pub response_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            realtime_enabled: true,
            realtime_path: "/ws/real-time-detection".to_string(),
            discrete_path: "/process-frame".to_string(),
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            response_timeout_ms: 30_000,
        }
    }
}

impl BackendConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Realtime channel address for one session: the base URL with its scheme
    /// switched to ws/wss and `<realtime_path>/<session_id>` appended.
    pub fn realtime_url(&self, session_id: &str) -> Result<String, ConfigError> {
        let mut url = self.parsed_base()?;
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "unsupported backend scheme '{}'",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| ConfigError::ValidationError(format!("cannot switch scheme to {}", scheme)))?;
        let path = format!(
            "{}{}/{}",
            url.path().trim_end_matches('/'),
            self.realtime_path,
            session_id
        );
        url.set_path(&path);
        Ok(url.to_string())
    }

    /// Address of the one-shot request endpoint.
    pub fn discrete_url(&self) -> Result<String, ConfigError> {
        let mut url = self.parsed_base()?;
        let path = format!("{}{}", url.path().trim_end_matches('/'), self.discrete_path);
        url.set_path(&path);
        Ok(url.to_string())
    }

    fn parsed_base(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.base_url)
            .map_err(|e| ConfigError::ValidationError(format!("invalid backend.base_url '{}': {}", self.base_url, e)))
    }
}

/// Camera device configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Device indices tried in order until one opens
    pub device_ids: Vec<u32>,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// JPEG quality used when encoding captured frames (1-100)
    pub jpeg_quality: u8,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_ids: vec![0],
            width: 640,
            height: 480,
            frame_rate: 30,
            jpeg_quality: 80,
        }
    }
}

/// Capture scheduling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Periodic trigger interval in realtime mode
    pub interval_ms: u64,
    pub max_upload_bytes: usize,
    /// Capacity of the session event bus
    pub event_buffer: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            max_upload_bytes: 10 * 1024 * 1024,
            event_buffer: 64,
        }
    }
}

impl CaptureConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Complete client configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinoriConfig {
    pub backend: BackendConfig,
    pub camera: CameraConfig,
    pub capture: CaptureConfig,
    pub logging: LoggingConfig,
}

impl MinoriConfig {
    /// Default location of the configuration file (`~/.minori/config.toml`)
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|mut p| {
                p.push(".minori");
                p.push("config.toml");
                p
            })
            .unwrap_or_else(|| PathBuf::from("./minori.toml"))
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();

        // Reject traversal sequences; configuration never lives above the given root.
        if path.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(ConfigError::IoError(format!(
                "Path traversal detected: '{}'",
                display
            )));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", display, e)))?;
        Self::from_str(&content)
    }

    /// Load configuration from string (JSON, TOML or YAML)
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let json_err = match serde_json::from_str::<MinoriConfig>(content) {
            Ok(config) => return Ok(config),
            Err(e) => e,
        };

        let toml_err = match toml::from_str::<MinoriConfig>(content) {
            Ok(config) => return Ok(config),
            Err(e) => e,
        };

        if let Ok(config) = serde_yaml::from_str::<MinoriConfig>(content) {
            return Ok(config);
        }

        Err(ConfigError::ParseError(format!(
            "Unknown format (json: {}; toml: {})",
            json_err,
            toml_err.message()
        )))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Override fields from `MINORI_*` environment variables
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("MINORI_BACKEND_URL") {
            self.backend.base_url = url;
        }

        if let Ok(flag) = std::env::var("MINORI_REALTIME") {
            match flag.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.backend.realtime_enabled = true,
                "0" | "false" | "no" | "off" => self.backend.realtime_enabled = false,
                _ => {}
            }
        }

        if let Ok(id) = std::env::var("MINORI_CAMERA_ID") {
            if let Ok(id) = id.parse::<u32>() {
                self.camera.device_ids = vec![id];
            }
        }

        if let Ok(interval) = std::env::var("MINORI_CAPTURE_INTERVAL_MS") {
            if let Ok(ms) = interval.parse::<u64>() {
                self.capture.interval_ms = ms;
            }
        }

        if let Ok(level) = std::env::var("MINORI_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Merge with another configuration (other takes precedence)
    pub fn merge(&mut self, other: MinoriConfig) {
        self.backend = other.backend;
        self.camera = other.camera;
        self.capture = other.capture;
        self.logging = other.logging;
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = Url::parse(&self.backend.base_url).map_err(|e| {
            ConfigError::ValidationError(format!("backend.base_url is not a valid URL: {}", e))
        })?;
        if base.scheme() != "http" && base.scheme() != "https" {
            return Err(ConfigError::ValidationError(
                "backend.base_url must use http or https".to_string(),
            ));
        }

        for (name, path) in [
            ("backend.realtime_path", &self.backend.realtime_path),
            ("backend.discrete_path", &self.backend.discrete_path),
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::ValidationError(format!("{} must start with '/'", name)));
            }
        }

        if self.backend.connect_timeout_ms == 0
            || self.backend.request_timeout_ms == 0
            || self.backend.response_timeout_ms == 0
        {
            return Err(ConfigError::ValidationError(
                "backend timeouts must be greater than 0".to_string(),
            ));
        }

        if !(100..=60_000).contains(&self.capture.interval_ms) {
            return Err(ConfigError::ValidationError(
                "capture.interval_ms must be between 100 and 60000".to_string(),
            ));
        }

        if self.capture.event_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "capture.event_buffer must be > 0".to_string(),
            ));
        }

        if self.capture.max_upload_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "capture.max_upload_bytes must be > 0".to_string(),
            ));
        }

        if self.camera.device_ids.is_empty() {
            return Err(ConfigError::ValidationError(
                "camera.device_ids must list at least one device".to_string(),
            ));
        }

        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(ConfigError::ValidationError("Resolution must be non-zero".to_string()));
        }

        if self.camera.width > 7680 || self.camera.height > 4320 {
            return Err(ConfigError::ValidationError("Resolution too large (max 8K)".to_string()));
        }

        if self.camera.frame_rate == 0 || self.camera.frame_rate > 120 {
            return Err(ConfigError::ValidationError(
                "Frame rate must be between 1 and 120".to_string(),
            ));
        }

        if self.camera.jpeg_quality == 0 || self.camera.jpeg_quality > 100 {
            return Err(ConfigError::ValidationError(
                "camera.jpeg_quality must be between 1 and 100".to_string(),
            ));
        }

        Ok(())
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::ParseError(e) => write!(f, "Parse error: {}", e),
            ConfigError::ValidationError(e) => write!(f, "Validation error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
