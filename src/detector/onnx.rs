use std::path::Path;

use image::imageops::{self, FilterType};
use tract_onnx::prelude::*;
use tracing::debug;

use super::decode::{person_confidence, OutputLayout};
use super::{DetectionResult, Detector};
use crate::error::{PresenceError, Result};
use crate::frame::Frame;

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Tract-based ONNX detector.
///
/// The optimized plan is immutable after loading, so one instance serves
/// concurrent requests. Frames are stretched to a square input (no
/// letterboxing), scaled to [0, 1], RGB, NCHW.
pub struct OnnxDetector {
    model: Plan,
    label: String,
    layout: OutputLayout,
    input_size: u32,
    confidence_threshold: f32,
    person_class: usize,
}

impl OnnxDetector {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn load<P: AsRef<Path>>(
        model_path: P,
        label: String,
        layout: OutputLayout,
        input_size: u32,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let size = input_size as usize;

        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .and_then(|m| {
                m.with_input_fact(
                    0,
                    InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
                )
            })
            .and_then(|m| m.into_optimized())
            .and_then(|m| m.into_runnable())
            .map_err(|e| {
                PresenceError::detector(
                    label.clone(),
                    format!("failed to load {}: {}", model_path.display(), e),
                )
            })?;

        Ok(Self {
            model,
            label,
            layout,
            input_size,
            confidence_threshold: 0.3,
            person_class: 0,
        })
    }

    /// Override the default confidence threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_person_class(mut self, person_class: usize) -> Self {
        self.person_class = person_class;
        self
    }

    fn build_input(&self, frame: &Frame) -> Tensor {
        let size = self.input_size;
        let resized = imageops::resize(frame.pixels.as_ref(), size, size, FilterType::Triangle);

        tract_ndarray::Array4::from_shape_fn(
            (1, 3, size as usize, size as usize),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        )
        .into_tensor()
    }

    fn fail(&self, message: String) -> PresenceError {
        PresenceError::detector(self.label.clone(), message)
    }
}

impl Detector for OnnxDetector {
    fn label(&self) -> &str {
        &self.label
    }

    fn detect(&self, frame: &Frame) -> Result<DetectionResult> {
        let input = self.build_input(frame);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .map_err(|e| self.fail(format!("inference failed: {}", e)))?;

        let mut confidence = 0.0f32;
        for output in outputs.iter() {
            let data = output
                .as_slice::<f32>()
                .map_err(|e| self.fail(format!("output tensor was not f32: {}", e)))?;
            let score = person_confidence(self.layout, data, output.shape(), self.person_class)?;
            confidence = confidence.max(score);
        }

        let presence = confidence > self.confidence_threshold;
        debug!(
            "{}: best person score {:.3} (threshold {:.2}) -> presence={}",
            self.label, confidence, self.confidence_threshold, presence
        );

        Ok(DetectionResult::new(presence, confidence, &self.label))
    }
}
