use crate::baseline::{Baseline, BaselineStore, Establishment};
use crate::error::{PresenceError, Result};
use crate::frame::{luma_bt601, Frame};
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use std::sync::Arc;
use tracing::{debug, info};

/// Side of the square SSIM window
const WINDOW: u32 = 7;
const K1: f64 = 0.01;
const K2: f64 = 0.03;
const DATA_RANGE: f64 = 255.0;

/// Mean structural similarity of two equally sized 8-bit images, or `None`
/// when their dimensions differ.
///
/// Uniform 7x7 windows with sample covariance, averaged over every window
/// that fits entirely inside the image. Images smaller than the window use
/// the largest odd window that fits.
pub fn ssim(a: &GrayImage, b: &GrayImage) -> Option<f64> {
    if a.dimensions() != b.dimensions() {
        return None;
    }
    let (width, height) = a.dimensions();
    if width == 0 || height == 0 {
        return Some(1.0);
    }

    let mut win = WINDOW.min(width).min(height);
    if win % 2 == 0 {
        win -= 1;
    }

    let tables = SummedTables::new(a, b);
    let np = (win * win) as f64;
    let cov_norm = if np > 1.0 { np / (np - 1.0) } else { 1.0 };
    let c1 = (K1 * DATA_RANGE).powi(2);
    let c2 = (K2 * DATA_RANGE).powi(2);

    let mut total = 0.0;
    let mut windows = 0usize;
    for y in 0..=(height - win) {
        for x in 0..=(width - win) {
            let [sx, sy, sxx, syy, sxy] = tables.window(x, y, win);
            let ux = sx / np;
            let uy = sy / np;
            let vx = cov_norm * (sxx / np - ux * ux);
            let vy = cov_norm * (syy / np - uy * uy);
            let vxy = cov_norm * (sxy / np - ux * uy);

            let numerator = (2.0 * ux * uy + c1) * (2.0 * vxy + c2);
            let denominator = (ux * ux + uy * uy + c1) * (vx + vy + c2);
            total += numerator / denominator;
            windows += 1;
        }
    }

    Some(total / windows as f64)
}

/// Summed-area tables of x, y, x², y² and xy
struct SummedTables {
    stride: usize,
    sums: Vec<[f64; 5]>,
}

impl SummedTables {
    fn new(a: &GrayImage, b: &GrayImage) -> Self {
        let (width, height) = a.dimensions();
        let stride = width as usize + 1;
        let mut sums = vec![[0.0f64; 5]; stride * (height as usize + 1)];

        for y in 0..height as usize {
            let mut row = [0.0f64; 5];
            for x in 0..width as usize {
                let p = a.get_pixel(x as u32, y as u32)[0] as f64;
                let q = b.get_pixel(x as u32, y as u32)[0] as f64;
                let values = [p, q, p * p, q * q, p * q];
                let above = sums[y * stride + x + 1];
                let cell = &mut sums[(y + 1) * stride + x + 1];
                for k in 0..5 {
                    row[k] += values[k];
                    cell[k] = above[k] + row[k];
                }
            }
        }

        Self { stride, sums }
    }

    fn window(&self, x: u32, y: u32, win: u32) -> [f64; 5] {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + win as usize, y0 + win as usize);
        let at = |x: usize, y: usize| self.sums[y * self.stride + x];

        let (br, bl, tr, tl) = (at(x1, y1), at(x0, y1), at(x1, y0), at(x0, y0));
        let mut out = [0.0; 5];
        for k in 0..5 {
            out[k] = br[k] - bl[k] - tr[k] + tl[k];
        }
        out
    }
}

/// SSIM of `frame` against `baseline` after resizing the frame to the
/// baseline's dimensions and reducing both to luma
pub fn baseline_similarity(frame: &RgbImage, baseline: &Baseline) -> Result<f64> {
    let (width, height) = baseline.pixels.dimensions();
    let reference = luma_bt601(&baseline.pixels);

    let current = if frame.dimensions() == (width, height) {
        luma_bt601(frame)
    } else {
        luma_bt601(&imageops::resize(frame, width, height, FilterType::Triangle))
    };

    ssim(&reference, &current).ok_or_else(|| {
        PresenceError::system(format!(
            "resized frame is {:?}, baseline is {:?}",
            current.dimensions(),
            reference.dimensions()
        ))
    })
}

/// What the fallback comparator concluded for one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Comparison {
    /// No baseline existed; this frame became (or lost the race to become) it
    BaselineEstablished,
    /// Compared against the stored baseline
    Scored { score: f64, changed: bool },
}

impl Comparison {
    /// True when the scene drifted enough to imply presence
    pub fn changed(&self) -> bool {
        matches!(self, Comparison::Scored { changed: true, .. })
    }

    pub fn score(&self) -> Option<f64> {
        match self {
            Comparison::Scored { score, .. } => Some(*score),
            Comparison::BaselineEstablished => None,
        }
    }
}

/// Scene-drift fallback consulted when the primary detector abstains
pub struct FallbackComparator {
    baselines: Arc<BaselineStore>,
    threshold: f64,
}

impl FallbackComparator {
    pub fn new(baselines: Arc<BaselineStore>, threshold: f64) -> Self {
        Self {
            baselines,
            threshold,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn baselines(&self) -> &Arc<BaselineStore> {
        &self.baselines
    }

    /// Compare against the baseline, establishing it from `frame` when none
    /// exists. The first frame can never show change.
    pub fn compare(&self, frame: &Frame) -> Result<Comparison> {
        let baseline = match self.baselines.get() {
            Some(baseline) => baseline,
            None => {
                let outcome = self.baselines.establish(frame)?;
                match outcome {
                    Establishment::Established(_) => {
                        info!("Reference image not found; saved current frame as reference");
                        return Ok(Comparison::BaselineEstablished);
                    }
                    // lost the race: this frame is not the baseline, score it
                    Establishment::AlreadyPresent(existing) => existing,
                }
            }
        };

        let score = baseline_similarity(&frame.pixels, &baseline)?;
        let changed = score < self.threshold;
        debug!(
            "SSIM score {:.4} against baseline (threshold {:.2}) -> changed={}",
            score, self.threshold, changed
        );

        Ok(Comparison::Scored { score, changed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect;
    use tempfile::TempDir;

    fn textured(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            let v = ((x * 7 + y * 13) % 200 + 30) as u8;
            Rgb([v, v / 2 + 40, 255 - v])
        })
    }

    fn comparator(dir: &TempDir) -> FallbackComparator {
        let store = BaselineStore::open(dir.path().join("reference_image.jpg")).unwrap();
        FallbackComparator::new(Arc::new(store), 0.9)
    }

    #[test]
    fn test_identical_images_score_one() {
        let img = GrayImage::from_fn(20, 15, |x, y| Luma([((x * 11 + y * 5) % 256) as u8]));
        assert!((ssim(&img, &img).unwrap() - 1.0).abs() < 1e-9);

        let flat = GrayImage::from_pixel(10, 10, Luma([128]));
        assert!((ssim(&flat, &flat).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_inverted_image_scores_low() {
        let img = GrayImage::from_fn(32, 32, |x, y| Luma([((x * 8 + y * 3) % 256) as u8]));
        let inverted = GrayImage::from_fn(32, 32, |x, y| Luma([255 - img.get_pixel(x, y)[0]]));
        assert!(ssim(&img, &inverted).unwrap() < 0.5);
    }

    #[test]
    fn test_tiny_images_use_smaller_window() {
        let a = GrayImage::from_fn(4, 3, |x, y| Luma([(x * 40 + y * 10) as u8]));
        let score = ssim(&a, &a).unwrap();
        assert!((score - 1.0).abs() < 1e-9);

        let one = GrayImage::from_pixel(1, 1, Luma([9]));
        assert!((ssim(&one, &one).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_mismatched_dimensions_have_no_score() {
        let a = GrayImage::from_pixel(20, 15, Luma([100]));
        let b = GrayImage::from_pixel(15, 20, Luma([100]));
        assert_eq!(ssim(&a, &b), None);
    }

    #[test]
    fn test_first_frame_establishes_baseline() {
        let dir = TempDir::new().unwrap();
        let comparator = comparator(&dir);
        let frame = Frame::from_rgb(textured(64, 48)).unwrap();

        assert_eq!(comparator.compare(&frame).unwrap(), Comparison::BaselineEstablished);
        assert!(comparator.baselines().get().is_some());
        assert!(dir.path().join("reference_image.jpg").exists());

        let again = comparator.compare(&frame).unwrap();
        assert!(!again.changed());
        assert!(again.score().unwrap() > 0.99);
    }

    #[test]
    fn test_occluder_is_a_change() {
        let dir = TempDir::new().unwrap();
        let comparator = comparator(&dir);
        comparator
            .compare(&Frame::from_rgb(textured(64, 48)).unwrap())
            .unwrap();

        let mut occluded = textured(64, 48);
        draw_filled_rect_mut(&mut occluded, Rect::at(8, 4).of_size(40, 36), Rgb([0, 0, 0]));

        let result = comparator.compare(&Frame::from_rgb(occluded).unwrap()).unwrap();
        assert!(result.changed(), "score was {:?}", result.score());
    }

    #[test]
    fn test_resizes_to_baseline_dimensions() {
        let dir = TempDir::new().unwrap();
        let comparator = comparator(&dir);
        let flat = RgbImage::from_pixel(40, 30, Rgb([90, 90, 90]));
        comparator.compare(&Frame::from_rgb(flat).unwrap()).unwrap();

        let bigger = RgbImage::from_pixel(80, 60, Rgb([90, 90, 90]));
        let result = comparator.compare(&Frame::from_rgb(bigger).unwrap()).unwrap();
        assert!(!result.changed());
        assert!((result.score().unwrap() - 1.0).abs() < 1e-6);
    }
}
