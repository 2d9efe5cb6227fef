use crate::error::{PresenceError, Result};
use bytes::Bytes;
use chrono::{DateTime, Local};
use image::{GrayImage, ImageBuffer, Luma, RgbImage};
use std::sync::Arc;

/// One uploaded camera frame: the bytes as received plus the decoded pixels.
///
/// Owned by the request that received it until it is committed or discarded.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Encoded image exactly as uploaded
    pub raw: Bytes,
    /// Decoded RGB pixels (shared so blocking workers can hold them)
    pub pixels: Arc<RgbImage>,
    /// When the server accepted the upload
    pub received_at: DateTime<Local>,
}

impl Frame {
    /// Decode an upload. Empty or undecodable bytes are an input error.
    pub fn decode(raw: Bytes) -> Result<Self> {
        if raw.is_empty() {
            return Err(PresenceError::input("empty upload"));
        }

        let decoded = image::load_from_memory(&raw)
            .map_err(|e| PresenceError::input(format!("undecodable image: {}", e)))?;

        Ok(Self {
            raw,
            pixels: Arc::new(decoded.to_rgb8()),
            received_at: Local::now(),
        })
    }

    /// Wrap already-decoded pixels, re-encoding them as PNG for storage
    pub fn from_rgb(pixels: RgbImage) -> Result<Self> {
        let mut encoded = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(pixels.clone())
            .write_to(&mut encoded, image::ImageOutputFormat::Png)?;

        Ok(Self {
            raw: Bytes::from(encoded.into_inner()),
            pixels: Arc::new(pixels),
            received_at: Local::now(),
        })
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }
}

/// Single-channel luma with BT.601 weights (0.299, 0.587, 0.114), the
/// conversion camera-side tooling uses for grayscale comparisons.
pub fn luma_bt601(rgb: &RgbImage) -> GrayImage {
    let (width, height) = rgb.dimensions();
    ImageBuffer::from_fn(width, height, |x, y| {
        let p = rgb.get_pixel(x, y);
        let y = 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32;
        Luma([y.round().clamp(0.0, 255.0) as u8])
    })
}
