//! Camera and server configuration
//!
//! Two on-disk layouts are supported: a single TOML file (`[server]`,
//! `[[camera]]`, `active = [...]`) and the legacy pair of JSON files
//! (`all_cameras.json` + `active_cameras.json`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown camera type '{kind}' for camera '{camera}'")]
    UnknownCameraType { camera: String, kind: String },

    #[error("invalid resolution '{0}', expected WIDTHxHEIGHT")]
    InvalidResolution(String),

    #[error("invalid rotation {0}, expected 0, 90, 180 or 270")]
    InvalidRotation(u16),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete streamer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Names of the cameras to stream
    #[serde(default)]
    pub active: Vec<String>,

    #[serde(default)]
    pub server: ServerConfig,

    /// Every known camera
    #[serde(default, rename = "camera")]
    pub cameras: Vec<CameraConfig>,
}

/// Settings shared by every stream unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address each camera's HTTP server binds to
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,

    /// External device indices `0..max_device_index` are probed
    #[serde(default = "default_max_device_index")]
    pub max_device_index: u32,

    /// JPEG quality used when a rotated frame is re-encoded (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            max_device_index: default_max_device_index(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

/// Per-camera configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: CameraKind,

    #[serde(default)]
    pub resolution: Resolution,

    #[serde(default)]
    pub rotation: Rotation,

    pub port: u16,

    /// Capture cadence in frames per second
    #[serde(default = "default_fps")]
    pub fps: u32,
}

/// Camera flavour
///
/// Unrecognised type strings are kept as [`CameraKind::Unknown`] so the
/// supervisor can reject the whole batch instead of failing at parse time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CameraKind {
    /// The board's own camera (CSI ribbon on a Pi)
    BuiltIn,
    /// USB camera addressed by device index
    External,
    Unknown(String),
}

impl CameraKind {
    pub fn is_builtin(&self) -> bool {
        matches!(self, CameraKind::BuiltIn)
    }
}

impl From<String> for CameraKind {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "picamera" | "built-in" | "builtin" => CameraKind::BuiltIn,
            "usbcamera" | "external" | "usb" => CameraKind::External,
            _ => CameraKind::Unknown(value),
        }
    }
}

impl From<CameraKind> for String {
    fn from(kind: CameraKind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for CameraKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraKind::BuiltIn => f.write_str("picamera"),
            CameraKind::External => f.write_str("usbcamera"),
            CameraKind::Unknown(other) => f.write_str(other),
        }
    }
}

/// Capture resolution, serialized as `"640x480"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

impl FromStr for Resolution {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidResolution(s.to_string());
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width: u32 = w.trim().parse().map_err(|_| invalid())?;
        let height: u32 = h.trim().parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

impl TryFrom<String> for Resolution {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Resolution> for String {
    fn from(res: Resolution) -> Self {
        res.to_string()
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Clockwise rotation applied to every captured frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    pub fn degrees(self) -> u16 {
        match self {
            Rotation::None => 0,
            Rotation::Cw90 => 90,
            Rotation::Cw180 => 180,
            Rotation::Cw270 => 270,
        }
    }
}

impl TryFrom<u16> for Rotation {
    type Error = ConfigError;

    fn try_from(degrees: u16) -> Result<Self, Self::Error> {
        match degrees {
            0 => Ok(Rotation::None),
            90 => Ok(Rotation::Cw90),
            180 => Ok(Rotation::Cw180),
            270 => Ok(Rotation::Cw270),
            other => Err(ConfigError::InvalidRotation(other)),
        }
    }
}

impl From<Rotation> for u16 {
    fn from(rotation: Rotation) -> Self {
        rotation.degrees()
    }
}

// Default value functions
fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_max_device_index() -> u32 {
    19
}
fn default_jpeg_quality() -> u8 {
    85
}
fn default_fps() -> u32 {
    CameraConfig::DEFAULT_FPS
}

/// Legacy `active_cameras.json` document
#[derive(Debug, Deserialize)]
struct ActiveCameras {
    #[serde(default)]
    active_cameras: Vec<String>,
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

    /// Loads the two-file JSON layout: a camera list plus `{"active_cameras": [...]}`
    pub fn from_json_files<P: AsRef<Path>, Q: AsRef<Path>>(
        cameras_path: P,
        active_path: Q,
    ) -> Result<Self, ConfigError> {
        let cameras: Vec<CameraConfig> =
            serde_json::from_str(&std::fs::read_to_string(cameras_path)?)?;
        let active: ActiveCameras = serde_json::from_str(&std::fs::read_to_string(active_path)?)?;

        let config = Config {
            server: ServerConfig::default(),
            cameras,
            active: active.active_cameras,
        };
        config.validate()?;
        Ok(config)
    }

    /// Builds a single-camera configuration (command-line mode)
    pub fn single(camera: CameraConfig) -> Self {
        Config {
            server: ServerConfig::default(),
            active: vec![camera.name.clone()],
            cameras: vec![camera],
        }
    }

    /// Cameras named in `active`, in `[[camera]]` order
    ///
    /// The order of `active` itself does not matter; the camera list decides
    /// which built-in camera comes first. Unknown names are ignored.
    pub fn active_cameras(&self) -> Vec<CameraConfig> {
        self.cameras
            .iter()
            .filter(|c| self.active.contains(&c.name))
            .cloned()
            .collect()
    }

    /// Validates configuration
    ///
    /// Camera types are deliberately not checked here; an unknown type is a
    /// startup error raised by the supervisor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.jpeg_quality == 0 || self.server.jpeg_quality > 100 {
            return Err(ConfigError::Invalid(format!(
                "jpeg_quality must be between 1 and 100, got {}",
                self.server.jpeg_quality
            )));
        }

        for camera in &self.cameras {
            camera.validate()?;
        }

        Ok(())
    }

    /// Saves configuration to TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

impl CameraConfig {
    pub const DEFAULT_FPS: u32 = 10;

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("camera name must not be empty".into()));
        }

        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(ConfigError::InvalidResolution(self.resolution.to_string()));
        }

        if self.port == 0 {
            return Err(ConfigError::Invalid(format!(
                "{}: port must be between 1 and 65535",
                self.name
            )));
        }

        if self.fps == 0 || self.fps > 120 {
            return Err(ConfigError::Invalid(format!(
                "{}: FPS must be between 1 and 120, got {}",
                self.name, self.fps
            )));
        }

        Ok(())
    }
}
