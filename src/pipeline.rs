use crate::config::PresenceConfig;
use crate::detector::{DetectionResult, Detector};
use crate::frame::Frame;
use crate::similarity::{Comparison, FallbackComparator};
use chrono::{DateTime, Local};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Final decision for one frame.
///
/// Computed once and handed by reference to both the file lifecycle and the
/// event store, so the artifact name and the logged row always agree.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub presence: bool,
    pub fallback_used: bool,
    pub method: String,
    pub timestamp: DateTime<Local>,
    /// Primary detector confidence
    pub confidence: f32,
    /// SSIM score, when the fallback compared against a baseline
    pub similarity: Option<f64>,
}

impl Verdict {
    /// Text returned to the uploader
    pub fn message(&self) -> &'static str {
        if self.presence {
            "Presence Detected"
        } else {
            "No Presence Detected"
        }
    }
}

/// Method label recorded when the fallback decided presence
pub fn fallback_method(detector_label: &str) -> String {
    format!("Fallback ({})", detector_label)
}

/// Where a frame currently is in the decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Detecting,
    Deciding,
    Finalized,
}

/// Detector followed by the optional scene-drift fallback.
///
/// Stateless across frames apart from the baseline the comparator owns.
/// Inference runs on the blocking pool, bounded by a semaphore and a timeout;
/// a timed out or panicked detector counts as "no presence".
pub struct DecisionPipeline {
    detector: Arc<dyn Detector>,
    fallback: Option<Arc<FallbackComparator>>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl DecisionPipeline {
    pub fn new(
        detector: Arc<dyn Detector>,
        fallback: Option<FallbackComparator>,
        max_concurrent: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            detector,
            fallback: fallback.map(Arc::new),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            timeout,
        }
    }

    pub fn from_config(
        config: &PresenceConfig,
        detector: Arc<dyn Detector>,
        fallback: Option<FallbackComparator>,
    ) -> Self {
        Self::new(
            detector,
            fallback,
            config.detector.max_concurrent,
            config.detector.timeout(),
        )
    }

    pub fn detector_label(&self) -> &str {
        self.detector.label()
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    /// Run one frame through the state machine
    pub async fn decide(&self, frame: Arc<Frame>) -> Verdict {
        let label = self.detector.label().to_string();
        debug!("{:?}: {}x{} frame", Stage::Received, frame.width(), frame.height());

        debug!("{:?}: running {}", Stage::Detecting, label);
        let detection = self.detect(Arc::clone(&frame)).await;
        if detection.presence {
            return finalize(true, false, label, detection.confidence, None);
        }

        let Some(comparator) = self.fallback.as_ref() else {
            return finalize(false, false, label, detection.confidence, None);
        };

        debug!("{:?}: consulting similarity fallback", Stage::Deciding);
        let comparison = self.compare(Arc::clone(comparator), frame).await;
        let similarity = comparison.score();

        if comparison.changed() {
            finalize(true, true, fallback_method(&label), detection.confidence, similarity)
        } else {
            finalize(false, false, label, detection.confidence, similarity)
        }
    }

    /// Same decision without a runtime, for tools and synchronous callers
    pub fn decide_blocking(&self, frame: &Frame) -> Verdict {
        let label = self.detector.label().to_string();
        let detection = self.detector.classify(frame);
        if detection.presence {
            return finalize(true, false, label, detection.confidence, None);
        }

        match self.fallback.as_ref().map(|c| compare_or_unchanged(c, frame)) {
            Some(comparison) if comparison.changed() => finalize(
                true,
                true,
                fallback_method(&label),
                detection.confidence,
                comparison.score(),
            ),
            Some(comparison) => finalize(false, false, label, detection.confidence, comparison.score()),
            None => finalize(false, false, label, detection.confidence, None),
        }
    }

    async fn detect(&self, frame: Arc<Frame>) -> DetectionResult {
        let label = self.detector.label().to_string();
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                warn!("Inference permits unavailable, treating as no presence: {}", e);
                return DetectionResult::absent(label);
            }
        };

        let detector = Arc::clone(&self.detector);
        let result = tokio::time::timeout(
            self.timeout,
            // the permit lives as long as the inference, not the timed-out future
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                detector.classify(&frame)
            }),
        )
        .await;

        match result {
            Ok(Ok(detection)) => {
                debug!(
                    "{} -> presence={} confidence={:.3}",
                    label, detection.presence, detection.confidence
                );
                detection
            }
            Ok(Err(e)) => {
                warn!("Detector {} task failed: {}", label, e);
                DetectionResult::absent(label)
            }
            Err(_) => {
                warn!(
                    "Detector {} timed out after {:?}, treating as no presence",
                    label, self.timeout
                );
                DetectionResult::absent(label)
            }
        }
    }

    async fn compare(&self, comparator: Arc<FallbackComparator>, frame: Arc<Frame>) -> Comparison {
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                warn!("Comparison permits unavailable, assuming no change: {}", e);
                return Comparison::Scored {
                    score: 1.0,
                    changed: false,
                };
            }
        };

        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            compare_or_unchanged(&comparator, &frame)
        });

        match task.await {
            Ok(comparison) => comparison,
            Err(e) => {
                warn!("Similarity task failed, assuming no change: {}", e);
                Comparison::Scored {
                    score: 1.0,
                    changed: false,
                }
            }
        }
    }
}

fn compare_or_unchanged(comparator: &FallbackComparator, frame: &Frame) -> Comparison {
    comparator.compare(frame).unwrap_or_else(|e| {
        warn!("Similarity fallback failed, assuming no change: {}", e);
        Comparison::Scored {
            score: 1.0,
            changed: false,
        }
    })
}

fn finalize(
    presence: bool,
    fallback_used: bool,
    method: String,
    confidence: f32,
    similarity: Option<f64>,
) -> Verdict {
    let verdict = Verdict {
        presence,
        fallback_used,
        method,
        timestamp: Local::now(),
        confidence,
        similarity,
    };
    info!(
        "{:?}: presence={} fallback_used={} method={}",
        Stage::Finalized,
        verdict.presence,
        verdict.fallback_used,
        verdict.method
    );
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::BaselineStore;
    use crate::detector::StaticDetector;
    use crate::error::Result;
    use image::{Rgb, RgbImage};
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn scene() -> RgbImage {
        RgbImage::from_fn(64, 48, |x, y| {
            let v = ((x * 5 + y * 9) % 180 + 40) as u8;
            Rgb([v, 255 - v, v / 3])
        })
    }

    fn occluded() -> RgbImage {
        let mut img = scene();
        draw_filled_rect_mut(&mut img, Rect::at(10, 6).of_size(40, 36), Rgb([250, 250, 250]));
        img
    }

    fn frame(img: RgbImage) -> Arc<Frame> {
        Arc::new(Frame::from_rgb(img).unwrap())
    }

    fn pipeline(detector: StaticDetector, dir: Option<&TempDir>) -> DecisionPipeline {
        let fallback = dir.map(|dir| {
            let store = BaselineStore::open(dir.path().join("reference_image.jpg")).unwrap();
            FallbackComparator::new(Arc::new(store), 0.9)
        });
        DecisionPipeline::new(Arc::new(detector), fallback, 2, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_detector_presence_skips_fallback() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(StaticDetector::new("YOLOv8", true), Some(&dir));

        let verdict = pipeline.decide(frame(scene())).await;
        assert!(verdict.presence);
        assert!(!verdict.fallback_used);
        assert_eq!(verdict.method, "YOLOv8");
        assert_eq!(verdict.similarity, None);
        // the comparator never ran, so no baseline was taken
        assert!(!dir.path().join("reference_image.jpg").exists());
    }

    #[tokio::test]
    async fn test_no_fallback_configured() {
        let pipeline = pipeline(StaticDetector::never("cv2"), None);
        assert!(!pipeline.has_fallback());

        let verdict = pipeline.decide(frame(occluded())).await;
        assert!(!verdict.presence);
        assert!(!verdict.fallback_used);
        assert_eq!(verdict.method, "cv2");
    }

    #[tokio::test]
    async fn test_fallback_sequence() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(StaticDetector::never("YOLOv8"), Some(&dir));

        let first = pipeline.decide(frame(scene())).await;
        assert!(!first.presence);
        assert_eq!(first.similarity, None);

        let second = pipeline.decide(frame(scene())).await;
        assert!(!second.presence);
        assert!(second.similarity.unwrap() > 0.99);

        let third = pipeline.decide(frame(occluded())).await;
        assert!(third.presence);
        assert!(third.fallback_used);
        assert_eq!(third.method, "Fallback (YOLOv8)");
        assert!(third.similarity.unwrap() < 0.9);
    }

    struct SlowDetector;

    impl Detector for SlowDetector {
        fn label(&self) -> &str {
            "slow"
        }

        fn detect(&self, _frame: &Frame) -> Result<DetectionResult> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(DetectionResult::new(true, 0.99, "slow"))
        }
    }

    #[tokio::test]
    async fn test_timeout_counts_as_no_presence() {
        let pipeline =
            DecisionPipeline::new(Arc::new(SlowDetector), None, 1, Duration::from_millis(20));
        let verdict = pipeline.decide(frame(scene())).await;
        assert!(!verdict.presence);
        assert_eq!(verdict.method, "slow");
    }

    /// Tracks how many `detect` calls overlap
    struct CountingDetector {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Detector for CountingDetector {
        fn label(&self) -> &str {
            "counting"
        }

        fn detect(&self, _frame: &Frame) -> Result<DetectionResult> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(100));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(DetectionResult::new(true, 0.99, "counting"))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_out_inference_keeps_its_permit() {
        let detector = Arc::new(CountingDetector {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let pipeline = DecisionPipeline::new(
            Arc::clone(&detector) as Arc<dyn Detector>,
            None,
            1,
            Duration::from_millis(20),
        );

        for _ in 0..5 {
            let verdict = pipeline.decide(frame(scene())).await;
            assert!(!verdict.presence);
        }

        assert_eq!(detector.peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_blocking_path_matches() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(StaticDetector::never("YOLO3+SSIM"), Some(&dir));

        assert!(!pipeline.decide_blocking(&frame(scene())).presence);
        let verdict = pipeline.decide_blocking(&frame(occluded()));
        assert!(verdict.fallback_used);
        assert_eq!(verdict.method, fallback_method("YOLO3+SSIM"));
        assert_eq!(verdict.message(), "Presence Detected");
    }
}
