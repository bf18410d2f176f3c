//! Rectangles, letterbox mapping and non-maximum suppression shared by
//! the PPE and face detectors.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in source-frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Clip to `[0, width) × [0, height)`.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        let x1 = self.x.clamp(0.0, w);
        let y1 = self.y.clamp(0.0, h);
        let x2 = self.right().clamp(0.0, w);
        let y2 = self.bottom().clamp(0.0, h);
        Self::from_corners(x1, y1, x2, y2)
    }

    /// Intersection-over-union; 0.0 for degenerate boxes.
    pub fn iou(&self, other: &Rect) -> f32 {
        let inter_w = (self.right().min(other.right()) - self.x.max(other.x)).max(0.0);
        let inter_h = (self.bottom().min(other.bottom()) - self.y.max(other.y)).max(0.0);
        let inter = inter_w * inter_h;
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Scale and padding applied when fitting a frame into a square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub new_width: u32,
    pub new_height: u32,
}

impl Letterbox {
    pub fn fit(src_width: u32, src_height: u32, target: u32) -> Self {
        let scale = (target as f32 / src_width.max(1) as f32)
            .min(target as f32 / src_height.max(1) as f32);
        let new_width = ((src_width as f32 * scale).round() as u32).clamp(1, target);
        let new_height = ((src_height as f32 * scale).round() as u32).clamp(1, target);
        Self {
            scale,
            pad_x: ((target - new_width) / 2) as f32,
            pad_y: ((target - new_height) / 2) as f32,
            new_width,
            new_height,
        }
    }

    /// Map a point in model-input space back to the source frame.
    pub fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Resize `image` into a `target × target` NCHW tensor, padding with `pad`
/// and mapping each channel value through `normalize`.
pub fn letterbox_tensor(
    image: &RgbImage,
    target: u32,
    pad: u8,
    filter: FilterType,
    normalize: impl Fn(f32) -> f32,
) -> (Array4<f32>, Letterbox) {
    let lb = Letterbox::fit(image.width(), image.height(), target);
    let resized = imageops::resize(image, lb.new_width, lb.new_height, filter);

    let size = target as usize;
    let mut tensor = Array4::<f32>::from_elem((1, 3, size, size), normalize(pad as f32));
    let (ox, oy) = (lb.pad_x as usize, lb.pad_y as usize);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = (ox + x as usize, oy + y as usize);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = normalize(pixel[c] as f32);
        }
    }
    (tensor, lb)
}

/// Greedy non-maximum suppression. Keeps the highest-scoring item of each
/// overlapping cluster; output is sorted by descending score.
pub fn nms<T>(
    mut items: Vec<T>,
    iou_threshold: f32,
    rect_of: impl Fn(&T) -> Rect,
    score_of: impl Fn(&T) -> f32,
) -> Vec<T> {
    items.sort_by(|a, b| {
        score_of(b)
            .partial_cmp(&score_of(a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        let rect = rect_of(&item);
        if keep.iter().all(|k| rect_of(k).iou(&rect) <= iou_threshold) {
            keep.push(item);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_iou_identical() {
        let a = Rect::new(0.0, 0.0, 100.0, 100.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(20.0, 20.0, 10.0, 10.0);
        assert!(a.iou(&b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(5.0, 0.0, 10.0, 10.0);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_clamp_to_frame() {
        let r = Rect::from_corners(-5.0, 10.0, 700.0, 500.0).clamp_to(640, 480);
        assert_eq!(r, Rect::from_corners(0.0, 10.0, 640.0, 480.0));
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let items = vec![
            (Rect::new(5.0, 5.0, 100.0, 100.0), 0.8),
            (Rect::new(0.0, 0.0, 100.0, 100.0), 0.9),
            (Rect::new(200.0, 200.0, 50.0, 50.0), 0.7),
        ];
        let kept = nms(items, 0.45, |i| i.0, |i| i.1);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].1 - 0.9).abs() < 1e-6);
        assert!((kept[1].1 - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        let kept: Vec<(Rect, f32)> = nms(vec![], 0.45, |i| i.0, |i| i.1);
        assert!(kept.is_empty());
    }

    #[test]
    fn test_letterbox_roundtrip() {
        let lb = Letterbox::fit(640, 480, 640);
        assert_eq!(lb.new_width, 640);
        assert_eq!(lb.new_height, 480);
        assert_eq!(lb.pad_y, 80.0);
        let (x, y) = lb.to_source(100.0 * lb.scale + lb.pad_x, 50.0 * lb.scale + lb.pad_y);
        assert!((x - 100.0).abs() < 0.01 && (y - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_letterbox_tensor_pads_and_normalizes() {
        let image = RgbImage::from_pixel(64, 32, Rgb([255, 0, 255]));
        let (tensor, lb) =
            letterbox_tensor(&image, 64, 114, FilterType::Nearest, |v| v / 255.0);
        assert_eq!(tensor.shape(), &[1, 3, 64, 64]);
        assert_eq!(lb.pad_y, 16.0);
        // Padding row.
        assert!((tensor[[0, 0, 0, 0]] - 114.0 / 255.0).abs() < 1e-6);
        // Image content.
        assert!((tensor[[0, 0, 32, 10]] - 1.0).abs() < 1e-6);
        assert!(tensor[[0, 1, 32, 10]].abs() < 1e-6);
    }
}
