//! Frame annotation: boxes, labels, running counts and the alert banner.
//!
//! Rendering is a pure function of its inputs; the source frame is never
//! modified and the same inputs always produce the same pixels.

use crate::frame::Frame;
use crate::geometry::Rect;
use crate::glyphs::{self, GLYPH_SPACING, GLYPH_WIDTH};
use crate::types::{ComplianceTally, DetectionBox, FaceMatch, Label};
use image::{Rgb, RgbImage};

pub const BANNER_TEXT: &str = "ALERT SENT";

const COUNT_ORIGIN: (i64, i64) = (10, 10);
const COUNT_LINE_SPACING: i64 = 30;
const BANNER_MARGIN: i64 = 10;
const TEXT_PADDING: i64 = 5;
const BACKGROUND_ALPHA: f32 = 0.7;
const BOX_THICKNESS: i64 = 2;

const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const BANNER_COLOR: Rgb<u8> = Rgb([255, 48, 48]);
const FACE_KNOWN_COLOR: Rgb<u8> = Rgb([255, 215, 0]);
const FACE_UNKNOWN_COLOR: Rgb<u8> = Rgb([200, 200, 200]);

fn label_color(label: Label) -> Rgb<u8> {
    match label {
        Label::Hardhat | Label::SafetyVest | Label::Mask => Rgb([0, 200, 0]),
        Label::NoHardhat | Label::NoSafetyVest | Label::NoMask => Rgb([230, 0, 0]),
        Label::Person => Rgb([0, 120, 255]),
        Label::SafetyCone => Rgb([255, 140, 0]),
        Label::Machinery | Label::Vehicle => Rgb([180, 0, 180]),
        Label::Other => Rgb([128, 128, 128]),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FrameAnnotator {
    /// Integer glyph scale.
    pub text_scale: u32,
}

impl Default for FrameAnnotator {
    fn default() -> Self {
        Self { text_scale: 2 }
    }
}

impl FrameAnnotator {
    pub fn new(text_scale: u32) -> Self {
        Self {
            text_scale: text_scale.max(1),
        }
    }

    /// Render an annotated copy of `frame`.
    pub fn annotate(
        &self,
        frame: &Frame,
        detections: &[DetectionBox],
        faces: &[FaceMatch],
        banner_active: bool,
    ) -> RgbImage {
        let mut canvas = frame.to_image();

        for det in detections {
            let color = label_color(det.label);
            draw_rect(&mut canvas, &det.bbox, color, BOX_THICKNESS);
            let caption = format!("{} {:.2}", det.label.as_str(), det.confidence);
            self.draw_caption(&mut canvas, &det.bbox, &caption, color);
        }

        for face in faces {
            let color = if face.is_known() {
                FACE_KNOWN_COLOR
            } else {
                FACE_UNKNOWN_COLOR
            };
            draw_rect(&mut canvas, &face.bbox, color, BOX_THICKNESS);
            self.draw_caption(&mut canvas, &face.bbox, &face.identity, color);
        }

        self.draw_counts(&mut canvas, &ComplianceTally::from_detections(detections));

        if banner_active {
            self.draw_banner(&mut canvas);
        }
        canvas
    }

    /// Overlay `Hardhats / Vests / Persons` at the fixed top-left position.
    pub fn draw_counts(&self, canvas: &mut RgbImage, tally: &ComplianceTally) {
        for (i, line) in tally.overlay_lines().iter().enumerate() {
            let y = COUNT_ORIGIN.1 + i as i64 * COUNT_LINE_SPACING;
            self.draw_text(canvas, COUNT_ORIGIN.0, y, line, TEXT_COLOR);
        }
    }

    pub fn draw_banner(&self, canvas: &mut RgbImage) {
        let width = glyphs::text_width(BANNER_TEXT, self.text_scale) as i64;
        let x = canvas.width() as i64 - width - BANNER_MARGIN - TEXT_PADDING;
        self.draw_text(canvas, x, BANNER_MARGIN + TEXT_PADDING, BANNER_TEXT, BANNER_COLOR);
    }

    /// Caption above the box, or inside its top edge when there is no room.
    fn draw_caption(&self, canvas: &mut RgbImage, bbox: &Rect, text: &str, color: Rgb<u8>) {
        let h = glyphs::text_height(self.text_scale) as i64;
        let above = bbox.y as i64 - h - TEXT_PADDING * 2;
        let y = if above >= 0 {
            above + TEXT_PADDING
        } else {
            bbox.y as i64 + TEXT_PADDING
        };
        self.draw_text(canvas, bbox.x as i64 + TEXT_PADDING, y, text, color);
    }

    /// Text with its top-left at `(x, y)` on a translucent dark background.
    fn draw_text(&self, canvas: &mut RgbImage, x: i64, y: i64, text: &str, color: Rgb<u8>) {
        let scale = self.text_scale as i64;
        let w = glyphs::text_width(text, self.text_scale) as i64;
        let h = glyphs::text_height(self.text_scale) as i64;
        darken(
            canvas,
            x - TEXT_PADDING,
            y - TEXT_PADDING,
            w + TEXT_PADDING * 2,
            h + TEXT_PADDING * 2,
        );

        let advance = (GLYPH_WIDTH + GLYPH_SPACING) as i64 * scale;
        for (i, c) in text.chars().enumerate() {
            let gx = x + i as i64 * advance;
            for (row, bits) in glyphs::glyph(c).iter().enumerate() {
                for col in 0..GLYPH_WIDTH {
                    if bits & (1 << (GLYPH_WIDTH - 1 - col)) == 0 {
                        continue;
                    }
                    let px = gx + col as i64 * scale;
                    let py = y + row as i64 * scale;
                    fill(canvas, px, py, scale, scale, color);
                }
            }
        }
    }
}

fn put(canvas: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < canvas.width() && (y as u32) < canvas.height() {
        canvas.put_pixel(x as u32, y as u32, color);
    }
}

fn fill(canvas: &mut RgbImage, x: i64, y: i64, w: i64, h: i64, color: Rgb<u8>) {
    for yy in y..y + h {
        for xx in x..x + w {
            put(canvas, xx, yy, color);
        }
    }
}

fn darken(canvas: &mut RgbImage, x: i64, y: i64, w: i64, h: i64) {
    let x0 = x.max(0);
    let y0 = y.max(0);
    let x1 = (x + w).min(canvas.width() as i64);
    let y1 = (y + h).min(canvas.height() as i64);
    for yy in y0..y1 {
        for xx in x0..x1 {
            let px = canvas.get_pixel_mut(xx as u32, yy as u32);
            for c in px.0.iter_mut() {
                *c = (*c as f32 * (1.0 - BACKGROUND_ALPHA)).round() as u8;
            }
        }
    }
}

fn draw_rect(canvas: &mut RgbImage, rect: &Rect, color: Rgb<u8>, thickness: i64) {
    let x1 = rect.x.round() as i64;
    let y1 = rect.y.round() as i64;
    let x2 = rect.right().round() as i64;
    let y2 = rect.bottom().round() as i64;
    if x2 <= x1 || y2 <= y1 {
        return;
    }
    let (w, h) = (x2 - x1, y2 - y1);
    fill(canvas, x1, y1, w, thickness, color);
    fill(canvas, x1, y2 - thickness, w, thickness, color);
    fill(canvas, x1, y1, thickness, h, color);
    fill(canvas, x2 - thickness, y1, thickness, h, color);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_frame() -> Frame {
        Frame::new(RgbImage::from_pixel(320, 240, Rgb([100, 100, 100])), 1)
    }

    #[test]
    fn test_empty_inputs_draw_only_zero_counts() {
        let annotator = FrameAnnotator::default();
        let frame = gray_frame();
        let out = annotator.annotate(&frame, &[], &[], false);

        let mut expected = frame.to_image();
        annotator.draw_counts(&mut expected, &ComplianceTally::default());
        assert_eq!(out, expected);
        assert_ne!(out, frame.to_image());
    }

    #[test]
    fn test_text_scale_clamped_and_applied() {
        assert_eq!(FrameAnnotator::new(0).text_scale, 1);
        let frame = gray_frame();
        let small = FrameAnnotator::new(1).annotate(&frame, &[], &[], false);
        let large = FrameAnnotator::new(3).annotate(&frame, &[], &[], false);
        assert_ne!(small, large);
    }

    #[test]
    fn test_annotate_leaves_source_untouched_outside_overlays() {
        let annotator = FrameAnnotator::default();
        let frame = gray_frame();
        let out = annotator.annotate(&frame, &[], &[], false);
        // Bottom-right quadrant holds no overlay.
        assert_eq!(*out.get_pixel(300, 220), Rgb([100, 100, 100]));
        assert_eq!(*frame.image().get_pixel(12, 12), Rgb([100, 100, 100]));
    }

    #[test]
    fn test_annotate_is_deterministic() {
        let annotator = FrameAnnotator::default();
        let frame = gray_frame();
        let dets = vec![DetectionBox::new("Person", 0.91, Rect::new(50.0, 120.0, 80.0, 100.0))];
        let faces = vec![FaceMatch::unknown(Rect::new(60.0, 125.0, 30.0, 30.0))];
        assert_eq!(
            annotator.annotate(&frame, &dets, &faces, true),
            annotator.annotate(&frame, &dets, &faces, true)
        );
    }

    #[test]
    fn test_banner_drawn_top_right_only_when_active() {
        let annotator = FrameAnnotator::default();
        let frame = gray_frame();
        let off = annotator.annotate(&frame, &[], &[], false);
        let on = annotator.annotate(&frame, &[], &[], true);

        let banner_w = glyphs::text_width(BANNER_TEXT, annotator.text_scale);
        let x = 320 - BANNER_MARGIN as u32 - banner_w;
        assert_eq!(*off.get_pixel(x, 12), Rgb([100, 100, 100]));
        assert_ne!(*on.get_pixel(x, 12), Rgb([100, 100, 100]));
        assert!(on.enumerate_pixels().any(|(_, _, p)| *p == BANNER_COLOR));
        assert!(!off.enumerate_pixels().any(|(_, _, p)| *p == BANNER_COLOR));
    }

    #[test]
    fn test_detection_box_outline_uses_label_color() {
        let annotator = FrameAnnotator::default();
        let frame = gray_frame();
        let dets = vec![DetectionBox::new("NO-Hardhat", 0.8, Rect::new(150.0, 150.0, 60.0, 60.0))];
        let out = annotator.annotate(&frame, &dets, &[], false);
        let red = label_color(Label::NoHardhat);
        assert_eq!(*out.get_pixel(150, 200), red);
        assert_eq!(*out.get_pixel(209, 200), red);
        // Interior untouched.
        assert_eq!(*out.get_pixel(180, 200), Rgb([100, 100, 100]));
    }

    #[test]
    fn test_boxes_past_the_edge_are_clipped() {
        let annotator = FrameAnnotator::default();
        let frame = gray_frame();
        let dets = vec![DetectionBox::new("Person", 0.5, Rect::new(300.0, 230.0, 100.0, 100.0))];
        let out = annotator.annotate(&frame, &dets, &[], false);
        assert_eq!(out.dimensions(), (320, 240));
    }
}
