//! Person detectors.
//!
//! A [`Detector`] is an opaque, read-only capability: it is built once at
//! startup from [`DetectorConfig`] and shared by every request. Failures never
//! reach the pipeline; [`Detector::classify`] reports them as "no presence".

mod decode;
#[cfg(feature = "backend-tract")]
mod onnx;

pub use decode::{person_confidence, OutputLayout};
#[cfg(feature = "backend-tract")]
pub use onnx::OnnxDetector;

use crate::config::{DetectorConfig, DetectorKind};
use crate::error::{PresenceError, Result};
use crate::frame::Frame;
use std::sync::Arc;
use tracing::{info, warn};

/// Output of one detector invocation on one frame
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    /// At least one person-class detection cleared the threshold
    pub presence: bool,
    /// Best person-class score seen, in [0, 1]
    pub confidence: f32,
    /// Method label of the detector that produced this result
    pub detector_label: String,
}

impl DetectionResult {
    pub fn new<S: Into<String>>(presence: bool, confidence: f32, detector_label: S) -> Self {
        Self {
            presence,
            confidence: confidence.clamp(0.0, 1.0),
            detector_label: detector_label.into(),
        }
    }

    /// The answer given when a detector could not run
    pub fn absent<S: Into<String>>(detector_label: S) -> Self {
        Self::new(false, 0.0, detector_label)
    }
}

pub trait Detector: Send + Sync {
    /// Method label recorded for verdicts this detector reaches
    fn label(&self) -> &str;

    /// Run inference; may fail on malformed input or a broken model
    fn detect(&self, frame: &Frame) -> Result<DetectionResult>;

    /// Infallible entry point used by the pipeline
    fn classify(&self, frame: &Frame) -> DetectionResult {
        match self.detect(frame) {
            Ok(result) => result,
            Err(e) => {
                warn!("Detector {} failed, treating as no presence: {}", self.label(), e);
                DetectionResult::absent(self.label())
            }
        }
    }
}

/// Detector with a fixed answer
#[derive(Debug, Clone)]
pub struct StaticDetector {
    label: String,
    presence: bool,
}

impl StaticDetector {
    pub fn new<S: Into<String>>(label: S, presence: bool) -> Self {
        Self {
            label: label.into(),
            presence,
        }
    }

    /// A detector that never finds anyone
    pub fn never<S: Into<String>>(label: S) -> Self {
        Self::new(label, false)
    }
}

impl Detector for StaticDetector {
    fn label(&self) -> &str {
        &self.label
    }

    fn detect(&self, _frame: &Frame) -> Result<DetectionResult> {
        let confidence = if self.presence { 1.0 } else { 0.0 };
        Ok(DetectionResult::new(self.presence, confidence, &self.label))
    }
}

/// Build the deployment's detector. Model weights are loaded here, once.
pub fn build_detector(config: &DetectorConfig) -> Result<Arc<dyn Detector>> {
    let label = config.label();

    match config.kind {
        DetectorKind::Static => {
            info!(
                "Using static detector '{}' (presence = {})",
                label, config.static_presence
            );
            Ok(Arc::new(StaticDetector::new(label, config.static_presence)))
        }
        kind => build_model_detector(kind, label, config),
    }
}

#[cfg(feature = "backend-tract")]
fn build_model_detector(
    kind: DetectorKind,
    label: String,
    config: &DetectorConfig,
) -> Result<Arc<dyn Detector>> {
    let model_path = config.model_path.as_deref().ok_or_else(|| {
        PresenceError::system(format!("detector kind {:?} requires model_path", kind))
    })?;

    let detector = OnnxDetector::load(
        model_path,
        label,
        OutputLayout::for_kind(kind),
        config.input_size(),
    )?
    .with_threshold(config.confidence_threshold)
    .with_person_class(config.person_class);

    info!(
        "Loaded {:?} detector '{}' from {} (threshold {:.2})",
        kind,
        detector.label(),
        model_path,
        config.confidence_threshold
    );
    Ok(Arc::new(detector))
}

#[cfg(not(feature = "backend-tract"))]
fn build_model_detector(
    kind: DetectorKind,
    _label: String,
    _config: &DetectorConfig,
) -> Result<Arc<dyn Detector>> {
    Err(PresenceError::system(format!(
        "detector kind {:?} needs the backend-tract feature",
        kind
    )))
}
