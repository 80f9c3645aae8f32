use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::common::error::{FaceAuthError, Result};
use directories::ProjectDirs;

/// Distance below which a login face is accepted. Lower means more similar.
pub const FACE_DISTANCE_THRESHOLD: f64 = 70.0;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub recognizer: RecognizerConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_accept_poll")]
    pub accept_poll_ms: u64,
}

fn default_bind_address() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_read_timeout() -> u64 { 60 }
fn default_write_timeout() -> u64 { 10 }
fn default_accept_poll() -> u64 { 100 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            accept_poll_ms: default_accept_poll(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Write login images to disk instead of only recording the attempt.
    #[serde(default)]
    pub retain_login_images: bool,
}

fn default_data_dir() -> PathBuf { PathBuf::from("face_auth_data") }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            retain_login_images: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuthConfig {
    #[serde(default = "default_face_threshold")]
    pub face_distance_threshold: f64,
    #[serde(default = "default_detection_confidence")]
    pub detection_confidence: f32,
}

fn default_face_threshold() -> f64 { FACE_DISTANCE_THRESHOLD }
fn default_detection_confidence() -> f32 { 0.5 }

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            face_distance_threshold: default_face_threshold(),
            detection_confidence: default_detection_confidence(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DetectorConfig {
    #[serde(default = "default_detector_path")]
    pub model_path: PathBuf,
    #[serde(default = "default_input_size")]
    pub input_width: u32,
    #[serde(default = "default_input_size")]
    pub input_height: u32,
}

fn default_detector_path() -> PathBuf { PathBuf::from("models/face_detector.onnx") }
fn default_input_size() -> u32 { 640 }

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: default_detector_path(),
            input_width: default_input_size(),
            input_height: default_input_size(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecognizerConfig {
    #[serde(default = "default_sample_size")]
    pub sample_size: u32,
    #[serde(default = "default_radius")]
    pub radius: u32,
    #[serde(default = "default_neighbors")]
    pub neighbors: u32,
    #[serde(default = "default_grid")]
    pub grid_x: u32,
    #[serde(default = "default_grid")]
    pub grid_y: u32,
}

fn default_sample_size() -> u32 { 100 }
fn default_radius() -> u32 { 2 }
fn default_neighbors() -> u32 { 8 }
fn default_grid() -> u32 { 8 }

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            sample_size: default_sample_size(),
            radius: default_radius(),
            neighbors: default_neighbors(),
            grid_x: default_grid(),
            grid_y: default_grid(),
        }
    }
}

impl Config {
    /// `facegate.toml` in the working directory if present, otherwise the
    /// per-user config directory.
    pub fn default_path() -> PathBuf {
        let local = PathBuf::from("facegate.toml");
        if local.exists() {
            return local;
        }
        ProjectDirs::from("com", "facegate", "FaceGate")
            .map(|dirs| dirs.config_dir().join("facegate.toml"))
            .unwrap_or(local)
    }

    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            let config = Config::default();
            config.validate()?;
            return Ok(config);
        }
        Self::load_from_path(path)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(FaceAuthError::Config(format!(
                "Config file not found: {}", path.display()
            )));
        }

        tracing::info!("Loading config from: {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| FaceAuthError::Config(format!("Config parse error: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.read_timeout_secs == 0 || self.server.read_timeout_secs > 600 {
            return Err(FaceAuthError::Config(format!(
                "Read timeout must be between 1 and 600 seconds, got {}",
                self.server.read_timeout_secs
            )));
        }
        if self.server.accept_poll_ms == 0 || self.server.accept_poll_ms > 1000 {
            return Err(FaceAuthError::Config(format!(
                "Accept poll interval must be between 1 and 1000 ms, got {}",
                self.server.accept_poll_ms
            )));
        }

        if !(self.auth.face_distance_threshold > 0.0) {
            return Err(FaceAuthError::Config(format!(
                "Face distance threshold must be positive, got {}",
                self.auth.face_distance_threshold
            )));
        }
        if self.auth.detection_confidence < 0.0 || self.auth.detection_confidence > 1.0 {
            return Err(FaceAuthError::Config(format!(
                "Detection confidence must be between 0.0 and 1.0, got {}",
                self.auth.detection_confidence
            )));
        }

        if self.detector.input_width == 0 || self.detector.input_width > 4096 {
            return Err(FaceAuthError::Config(format!(
                "Detector input width must be between 1 and 4096, got {}",
                self.detector.input_width
            )));
        }
        if self.detector.input_height == 0 || self.detector.input_height > 4096 {
            return Err(FaceAuthError::Config(format!(
                "Detector input height must be between 1 and 4096, got {}",
                self.detector.input_height
            )));
        }

        let rec = &self.recognizer;
        if rec.sample_size < 16 || rec.sample_size > 1024 {
            return Err(FaceAuthError::Config(format!(
                "Recognizer sample size must be between 16 and 1024, got {}",
                rec.sample_size
            )));
        }
        if rec.radius == 0 || rec.radius * 2 >= rec.sample_size {
            return Err(FaceAuthError::Config(format!(
                "LBP radius {} does not fit a {}px sample", rec.radius, rec.sample_size
            )));
        }
        if rec.neighbors == 0 || rec.neighbors > 16 {
            return Err(FaceAuthError::Config(format!(
                "LBP neighbors must be between 1 and 16, got {}", rec.neighbors
            )));
        }
        if rec.grid_x == 0 || rec.grid_y == 0 {
            return Err(FaceAuthError::Config("LBP grid must be at least 1x1".into()));
        }

        Ok(())
    }
}
