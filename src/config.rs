use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PresenceConfig {
    pub server: ServerConfig,
    pub detector: DetectorConfig,
    pub fallback: FallbackConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// IP address to bind to
    #[serde(default = "default_server_ip")]
    pub ip: String,

    /// Port to listen on
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Largest accepted upload body in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

/// Which detector family a deployment plugs into the pipeline
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    /// Face cascade classifier exported to a single-score model
    Cascade,
    /// Pose-landmark model with a pose-presence head
    Pose,
    /// Darknet-style YOLOv3 (rows of box, objectness, class scores)
    Yolov3,
    /// Ultralytics-style YOLOv8 (channels-first box + class scores)
    Yolov8,
    /// Fixed answer, no model; used by fallback-only deployments
    Static,
}

impl DetectorKind {
    /// Method label written to the event log when none is configured
    pub fn default_label(&self) -> &'static str {
        match self {
            DetectorKind::Cascade => "cv2",
            DetectorKind::Pose => "mediapipe",
            DetectorKind::Yolov3 => "YOLO3+SSIM",
            DetectorKind::Yolov8 => "YOLOv8",
            DetectorKind::Static => "static",
        }
    }

    /// Square model input edge in pixels
    pub fn default_input_size(&self) -> u32 {
        match self {
            DetectorKind::Yolov3 => 416,
            DetectorKind::Cascade | DetectorKind::Pose => 256,
            DetectorKind::Yolov8 | DetectorKind::Static => 640,
        }
    }

    pub fn needs_model(&self) -> bool {
        !matches!(self, DetectorKind::Static)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DetectorConfig {
    /// Detector family
    #[serde(default = "default_detector_kind")]
    pub kind: DetectorKind,

    /// Method label; defaults to the family's label
    pub label: Option<String>,

    /// ONNX model file for the neural detector families
    pub model_path: Option<String>,

    /// Minimum person-class score for a detection to count
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    /// Square model input edge; defaults per family
    pub input_size: Option<u32>,

    /// Class index of "person" in the model's label set
    #[serde(default = "default_person_class")]
    pub person_class: usize,

    /// Answer given by the static detector
    #[serde(default)]
    pub static_presence: bool,

    /// Inference deadline; exceeding it counts as "no presence"
    #[serde(default = "default_detector_timeout_ms")]
    pub timeout_ms: u64,

    /// Concurrent inference slots
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl DetectorConfig {
    pub fn label(&self) -> String {
        self.label
            .clone()
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| self.kind.default_label().to_string())
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
            .unwrap_or_else(|| self.kind.default_input_size())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FallbackConfig {
    /// Consult the similarity comparator when the detector abstains
    #[serde(default = "default_fallback_enabled")]
    pub enabled: bool,

    /// SSIM below this value implies presence
    #[serde(default = "default_similarity_threshold")]
    pub threshold: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Primary artifact store
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,

    /// Sub-directory of the upload dir that receives fallback frames
    #[serde(default = "default_fallback_subdir")]
    pub fallback_subdir: String,

    /// Reference baseline image, relative to the upload dir
    #[serde(default = "default_reference_image")]
    pub reference_image: String,

    /// Latest-verdict status file, relative to the upload dir
    #[serde(default = "default_status_file")]
    pub status_file: String,

    /// SQLite event log
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Keep `presence_0` frames; when false they are deleted but still logged
    #[serde(default = "default_retain_negative_frames")]
    pub retain_negative_frames: bool,
}

impl StorageConfig {
    pub fn upload_dir(&self) -> PathBuf {
        PathBuf::from(&self.upload_dir)
    }

    pub fn fallback_dir(&self) -> PathBuf {
        self.upload_dir().join(&self.fallback_subdir)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.upload_dir().join(".staging")
    }

    pub fn reference_image_path(&self) -> PathBuf {
        self.upload_dir().join(&self.reference_image)
    }

    pub fn status_file_path(&self) -> PathBuf {
        self.upload_dir().join(&self.status_file)
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.database_path)
    }

    /// Storage rooted at `root`, used by tests and the admin tool
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            upload_dir: root.join("uploads").to_string_lossy().to_string(),
            database_path: root.join("presence.db").to_string_lossy().to_string(),
            ..Self::default()
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            fallback_subdir: default_fallback_subdir(),
            reference_image: default_reference_image(),
            status_file: default_status_file(),
            database_path: default_database_path(),
            retain_negative_frames: default_retain_negative_frames(),
        }
    }
}

impl PresenceConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("presencecam.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("server.ip", default_server_ip())?
            .set_default("server.port", default_server_port())?
            .set_default("server.max_upload_bytes", default_max_upload_bytes() as i64)?
            .set_default("detector.kind", "yolov8")?
            .set_default(
                "detector.confidence_threshold",
                default_confidence_threshold() as f64,
            )?
            .set_default("detector.person_class", default_person_class() as i64)?
            .set_default("detector.static_presence", false)?
            .set_default("detector.timeout_ms", default_detector_timeout_ms() as i64)?
            .set_default("detector.max_concurrent", default_max_concurrent() as i64)?
            .set_default("fallback.enabled", default_fallback_enabled())?
            .set_default("fallback.threshold", default_similarity_threshold())?
            .set_default("storage.upload_dir", default_upload_dir())?
            .set_default("storage.fallback_subdir", default_fallback_subdir())?
            .set_default("storage.reference_image", default_reference_image())?
            .set_default("storage.status_file", default_status_file())?
            .set_default("storage.database_path", default_database_path())?
            .set_default(
                "storage.retain_negative_frames",
                default_retain_negative_frames(),
            )?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // PRESENCE_DETECTOR__KIND=yolov3, PRESENCE_STORAGE__UPLOAD_DIR=...
            .add_source(
                Environment::with_prefix("PRESENCE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: PresenceConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Message(
                "Server port must be greater than 0".to_string(),
            ));
        }

        if self.server.max_upload_bytes == 0 {
            return Err(ConfigError::Message(
                "Server max_upload_bytes must be greater than 0".to_string(),
            ));
        }

        if self.detector.label().contains(['/', '\\']) {
            return Err(ConfigError::Message(
                "Detector label must not contain path separators".to_string(),
            ));
        }

        let confidence = self.detector.confidence_threshold;
        if !(confidence > 0.0 && confidence <= 1.0) {
            return Err(ConfigError::Message(format!(
                "Detector confidence_threshold must be in (0, 1], got {}",
                confidence
            )));
        }

        if self.detector.timeout_ms == 0 {
            return Err(ConfigError::Message(
                "Detector timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.detector.max_concurrent == 0 {
            return Err(ConfigError::Message(
                "Detector max_concurrent must be greater than 0".to_string(),
            ));
        }

        if self.detector.input_size() == 0 {
            return Err(ConfigError::Message(
                "Detector input_size must be greater than 0".to_string(),
            ));
        }

        if self.detector.kind.needs_model() && self.detector.model_path.is_none() {
            return Err(ConfigError::Message(format!(
                "Detector kind {:?} requires model_path",
                self.detector.kind
            )));
        }

        if !(-1.0..=1.0).contains(&self.fallback.threshold) {
            return Err(ConfigError::Message(format!(
                "Fallback threshold must be in [-1, 1], got {}",
                self.fallback.threshold
            )));
        }

        if self.storage.upload_dir.trim().is_empty() {
            return Err(ConfigError::Message(
                "Storage upload_dir must not be empty".to_string(),
            ));
        }

        if self.storage.fallback_subdir.trim().is_empty()
            || self.storage.fallback_subdir.starts_with('.')
        {
            return Err(ConfigError::Message(
                "Storage fallback_subdir must be a plain directory name".to_string(),
            ));
        }

        Ok(())
    }

    /// Render as TOML, as accepted by [`PresenceConfig::load_from_file`]
    pub fn to_toml(&self) -> crate::error::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                ip: default_server_ip(),
                port: default_server_port(),
                max_upload_bytes: default_max_upload_bytes(),
            },
            detector: DetectorConfig {
                kind: default_detector_kind(),
                label: None,
                model_path: None,
                confidence_threshold: default_confidence_threshold(),
                input_size: None,
                person_class: default_person_class(),
                static_presence: false,
                timeout_ms: default_detector_timeout_ms(),
                max_concurrent: default_max_concurrent(),
            },
            fallback: FallbackConfig {
                enabled: default_fallback_enabled(),
                threshold: default_similarity_threshold(),
            },
            storage: StorageConfig::default(),
        }
    }
}

// Default value functions
fn default_server_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_server_port() -> u16 {
    5000
}
fn default_max_upload_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_detector_kind() -> DetectorKind {
    DetectorKind::Yolov8
}
fn default_confidence_threshold() -> f32 {
    0.3
}
fn default_person_class() -> usize {
    0
}
fn default_detector_timeout_ms() -> u64 {
    10_000
}
fn default_max_concurrent() -> usize {
    2
}

fn default_fallback_enabled() -> bool {
    false
}
fn default_similarity_threshold() -> f64 {
    0.9
}

fn default_upload_dir() -> String {
    "uploads".to_string()
}
fn default_fallback_subdir() -> String {
    "fallback_images".to_string()
}
fn default_reference_image() -> String {
    "reference_image.jpg".to_string()
}
fn default_status_file() -> String {
    "status.txt".to_string()
}
fn default_database_path() -> String {
    "presence.db".to_string()
}
fn default_retain_negative_frames() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn static_config() -> PresenceConfig {
        let mut config = PresenceConfig::default();
        config.detector.kind = DetectorKind::Static;
        config
    }

    #[test]
    fn test_default_config_needs_model() {
        // yolov8 by default, which cannot run without weights
        let config = PresenceConfig::default();
        assert!(config.validate().is_err());

        let mut config = PresenceConfig::default();
        config.detector.model_path = Some("yolov8n.onnx".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_labels_default_per_kind() {
        let mut config = static_config();
        assert_eq!(config.detector.label(), "static");

        config.detector.kind = DetectorKind::Cascade;
        assert_eq!(config.detector.label(), "cv2");

        config.detector.label = Some("YOLO8+SSIM".to_string());
        assert_eq!(config.detector.label(), "YOLO8+SSIM");

        config.detector.label = Some("   ".to_string());
        assert_eq!(config.detector.label(), "cv2");
    }

    #[test]
    fn test_input_size_defaults() {
        let mut config = static_config();
        config.detector.kind = DetectorKind::Yolov3;
        assert_eq!(config.detector.input_size(), 416);

        config.detector.input_size = Some(320);
        assert_eq!(config.detector.input_size(), 320);
    }

    #[test]
    fn test_config_validation() {
        let mut config = static_config();
        assert!(config.validate().is_ok());

        config.fallback.threshold = 1.5;
        assert!(config.validate().is_err());
        config.fallback.threshold = 0.9;

        config.detector.confidence_threshold = 0.0;
        assert!(config.validate().is_err());
        config.detector.confidence_threshold = 0.3;

        config.detector.max_concurrent = 0;
        assert!(config.validate().is_err());
        config.detector.max_concurrent = 1;

        config.detector.label = Some("bad/label".to_string());
        assert!(config.validate().is_err());
        config.detector.label = None;

        config.storage.fallback_subdir = ".staging".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_storage_paths() {
        let storage = StorageConfig::default();
        assert_eq!(storage.fallback_dir(), PathBuf::from("uploads/fallback_images"));
        assert_eq!(
            storage.reference_image_path(),
            PathBuf::from("uploads/reference_image.jpg")
        );
        assert_eq!(storage.status_file_path(), PathBuf::from("uploads/status.txt"));
    }

    #[test]
    fn test_default_toml_loads_back() {
        let rendered = static_config().to_toml().unwrap();
        assert!(rendered.contains("[storage]"));

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(rendered.as_bytes()).unwrap();
        let loaded = PresenceConfig::load_from_file(file.path()).unwrap();
        assert_eq!(loaded.detector.kind, DetectorKind::Static);
        assert_eq!(loaded.server.port, 5000);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[detector]
kind = "yolov3"
model_path = "yolo/yolov3.onnx"

[fallback]
enabled = true
threshold = 0.85

[storage]
upload_dir = "uploads_yolov3_ssim"
retain_negative_frames = false
"#
        )
        .unwrap();

        let config = PresenceConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.detector.kind, DetectorKind::Yolov3);
        assert_eq!(config.detector.label(), "YOLO3+SSIM");
        assert!(config.fallback.enabled);
        assert_eq!(config.fallback.threshold, 0.85);
        assert!(!config.storage.retain_negative_frames);
        assert_eq!(config.server.port, 5000);
        assert!(config.validate().is_ok());
    }
}
