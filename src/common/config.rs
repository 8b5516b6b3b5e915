use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::common::error::{GateError, Result};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub camera: CameraConfig,
    pub models: ModelConfig,
    pub detector: DetectorConfig,
    pub recognizer: RecognizerConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub matcher: MatcherConfig,
    pub gate: GateConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CameraConfig {
    pub device_index: u32,
    pub width: u32,
    pub height: u32,
    pub warmup_frames: u32,
    #[serde(default = "default_warmup_delay")]
    pub warmup_delay_ms: u64,
}

fn default_warmup_delay() -> u64 {
    50
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModelConfig {
    pub detector_path: PathBuf,
    pub recognizer_path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DetectorConfig {
    pub input_width: u32,
    pub input_height: u32,
    /// Loose acceptance threshold for detections shown on the overlay.
    #[serde(default = "default_display_threshold")]
    pub display_threshold: f32,
    #[serde(default = "default_nms_iou")]
    pub nms_iou_threshold: f32,
}

fn default_display_threshold() -> f32 { 0.5 }
fn default_nms_iou() -> f32 { 0.45 }

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecognizerConfig {
    pub input_size: u32,
    pub normalization_value: f32,
    #[serde(default)]
    pub grayscale: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TriggerConfig {
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_center_tolerance")]
    pub center_tolerance: f32,
    #[serde(default = "default_min_face_ratio")]
    pub min_face_ratio: f32,
    #[serde(default = "default_max_face_ratio")]
    pub max_face_ratio: f32,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
}

fn default_cooldown_ms() -> u64 { 3000 }
fn default_center_tolerance() -> f32 { 0.2 }
fn default_min_face_ratio() -> f32 { 0.3 }
fn default_max_face_ratio() -> f32 { 0.7 }
fn default_min_score() -> f32 { 0.7 }

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: default_cooldown_ms(),
            center_tolerance: default_center_tolerance(),
            min_face_ratio: default_min_face_ratio(),
            max_face_ratio: default_max_face_ratio(),
            min_score: default_min_score(),
        }
    }
}

impl TriggerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MatcherConfig {
    #[serde(default = "default_distance_threshold")]
    pub distance_threshold: f32,
}

fn default_distance_threshold() -> f32 { 0.6 }

impl Default for MatcherConfig {
    fn default() -> Self {
        Self { distance_threshold: default_distance_threshold() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GateConfig {
    /// Name the paired controller advertises.
    pub device_name: String,
    pub shared_secret: String,
    #[serde(default)]
    pub paired_devices: Vec<PairedDevice>,
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_ms: u64,
}

fn default_auth_timeout() -> u64 { 5000 }

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PairedDevice {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct StorageConfig {
    /// Overrides the platform data directory when set.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PerformanceConfig {
    #[serde(default = "default_optimization_level")]
    pub optimization_level: u32,
}

fn default_optimization_level() -> u32 { 3 }

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self { optimization_level: default_optimization_level() }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = "configs/shuttle-gate.toml";
        Self::load_from_path(Path::new(config_path))
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(GateError::Config(format!(
                "Config file not found: {}. Please create it from the example.", path.display()
            )));
        }

        tracing::info!("Loading config from: {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)
            .map_err(|e| GateError::Config(format!("Config parse error: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.camera.width == 0 || self.camera.width > 4096 {
            return Err(GateError::Config(format!(
                "Camera width must be between 1 and 4096, got {}", self.camera.width
            )));
        }
        if self.camera.height == 0 || self.camera.height > 4096 {
            return Err(GateError::Config(format!(
                "Camera height must be between 1 and 4096, got {}", self.camera.height
            )));
        }

        if self.detector.input_width == 0 || self.detector.input_width > 4096 {
            return Err(GateError::Config(format!(
                "Detector input width must be between 1 and 4096, got {}",
                self.detector.input_width
            )));
        }
        if self.detector.input_height == 0 || self.detector.input_height > 4096 {
            return Err(GateError::Config(format!(
                "Detector input height must be between 1 and 4096, got {}",
                self.detector.input_height
            )));
        }
        if !(0.0..=1.0).contains(&self.detector.display_threshold) {
            return Err(GateError::Config(format!(
                "Display threshold must be between 0.0 and 1.0, got {}",
                self.detector.display_threshold
            )));
        }

        if self.recognizer.input_size == 0 || self.recognizer.input_size > 1024 {
            return Err(GateError::Config(format!(
                "Recognizer input size must be between 1 and 1024, got {}",
                self.recognizer.input_size
            )));
        }
        if self.recognizer.normalization_value <= 0.0 {
            return Err(GateError::Config(format!(
                "Normalization value must be positive, got {}",
                self.recognizer.normalization_value
            )));
        }

        let t = &self.trigger;
        if !(0.0..=0.5).contains(&t.center_tolerance) {
            return Err(GateError::Config(format!(
                "Center tolerance must be between 0.0 and 0.5, got {}", t.center_tolerance
            )));
        }
        if t.min_face_ratio <= 0.0 || t.min_face_ratio > t.max_face_ratio || t.max_face_ratio > 1.0 {
            return Err(GateError::Config(format!(
                "Face ratio bounds must satisfy 0 < min <= max <= 1, got [{}, {}]",
                t.min_face_ratio, t.max_face_ratio
            )));
        }
        if !(0.0..=1.0).contains(&t.min_score) || t.min_score < self.detector.display_threshold {
            return Err(GateError::Config(format!(
                "Trigger score {} must be within [display_threshold, 1.0]", t.min_score
            )));
        }

        if self.matcher.distance_threshold <= 0.0 || !self.matcher.distance_threshold.is_finite() {
            return Err(GateError::Config(format!(
                "Distance threshold must be a positive number, got {}",
                self.matcher.distance_threshold
            )));
        }

        if self.gate.device_name.trim().is_empty() {
            return Err(GateError::Config("Gate device name must not be empty".into()));
        }
        if self.gate.shared_secret.is_empty()
            || !self.gate.shared_secret.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(GateError::Config(
                "Gate shared secret must be non-empty ASCII alphanumerics".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) const SAMPLE_CONFIG: &str = r#"
[camera]
device_index = 0
width = 640
height = 480
warmup_frames = 2

[models]
detector_path = "models/face_detector.onnx"
recognizer_path = "models/face_embedder.onnx"

[detector]
input_width = 640
input_height = 640

[recognizer]
input_size = 160
normalization_value = 127.5

[gate]
device_name = "SHUTTLE_GATE"
shared_secret = "Secret123"

[[gate.paired_devices]]
name = "SHUTTLE_GATE"
path = "/dev/rfcomm0"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_optional_sections() {
        let config = Config::from_toml(SAMPLE_CONFIG).unwrap();
        assert_eq!(config.trigger.cooldown(), Duration::from_millis(3000));
        assert_eq!(config.trigger.min_score, 0.7);
        assert_eq!(config.detector.display_threshold, 0.5);
        assert_eq!(config.matcher.distance_threshold, 0.6);
        assert_eq!(config.gate.paired_devices.len(), 1);
        assert_eq!(config.gate.auth_timeout_ms, 5000);
    }

    #[test]
    fn test_rejects_non_alphanumeric_secret() {
        let raw = SAMPLE_CONFIG.replace("Secret123", "bad secret!");
        assert!(matches!(Config::from_toml(&raw), Err(GateError::Config(_))));
    }

    #[test]
    fn test_rejects_inverted_face_ratio() {
        let raw = format!("{}\n[trigger]\nmin_face_ratio = 0.8\nmax_face_ratio = 0.4\n", SAMPLE_CONFIG);
        assert!(Config::from_toml(&raw).is_err());
    }

    #[test]
    fn test_trigger_score_below_display_threshold_rejected() {
        let raw = format!("{}\n[trigger]\nmin_score = 0.3\n", SAMPLE_CONFIG);
        assert!(Config::from_toml(&raw).is_err());
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let config = Config::from_toml(include_str!("../../configs/shuttle-gate.toml")).unwrap();
        assert_eq!(config.gate.device_name, "SHUTTLE_GATE");
        assert_eq!(config.trigger.cooldown_ms, 3000);
    }
}
