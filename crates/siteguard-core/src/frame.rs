//! Captured camera frame.

use image::RgbImage;
use std::sync::Arc;
use std::time::Instant;

/// An RGB8 frame as produced by a frame source.
///
/// Pixel data is shared behind an `Arc` and never mutated after capture;
/// cloning a `Frame` is cheap. Annotation works on a copy obtained from
/// [`Frame::to_image`].
#[derive(Clone, Debug)]
pub struct Frame {
    image: Arc<RgbImage>,
    timestamp: Instant,
    sequence: u32,
}

impl Frame {
    /// Wrap an image captured now.
    pub fn new(image: RgbImage, sequence: u32) -> Self {
        Self::with_timestamp(image, sequence, Instant::now())
    }

    pub fn with_timestamp(image: RgbImage, sequence: u32, timestamp: Instant) -> Self {
        Self {
            image: Arc::new(image),
            timestamp,
            sequence,
        }
    }

    /// Build a frame from packed RGB bytes. Returns `None` if the buffer
    /// length does not match `width * height * 3`.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Option<Self> {
        RgbImage::from_raw(width, height, data).map(|image| Self::new(image, sequence))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Owned, mutable copy of the pixel data.
    pub fn to_image(&self) -> RgbImage {
        self.image.as_ref().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Average luma (0.0–255.0), BT.601 weights.
    pub fn avg_brightness(&self) -> f32 {
        let pixels = self.width() as usize * self.height() as usize;
        if pixels == 0 {
            return 0.0;
        }
        let sum: f32 = self
            .image
            .pixels()
            .map(|p| 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32)
            .sum();
        sum / pixels as f32
    }
}
