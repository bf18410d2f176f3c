//! Warps a detected face onto the InsightFace five-point template so the
//! recognizer always sees a 112x112 upright crop.

use image::{Rgb, RgbImage};

pub const ALIGNED_SIZE: u32 = 112;

/// Eye centres, nose tip and mouth corners in a 112x112 crop.
const TEMPLATE_112: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// Rotation + uniform scale + translation:
/// `x' = cos*x - sin*y + tx`, `y' = sin*x + cos*y + ty`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub cos: f32,
    pub sin: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    pub const IDENTITY: Self = Self {
        cos: 1.0,
        sin: 0.0,
        tx: 0.0,
        ty: 0.0,
    };

    /// Least-squares fit mapping `from` onto `to` (closed form on centred points).
    pub fn fit(from: &[(f32, f32)], to: &[(f32, f32)]) -> Self {
        let n = from.len().min(to.len());
        if n == 0 {
            return Self::IDENTITY;
        }
        let centroid = |pts: &[(f32, f32)]| {
            let (sx, sy) = pts[..n]
                .iter()
                .fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n as f32, sy / n as f32)
        };
        let (fx, fy) = centroid(from);
        let (gx, gy) = centroid(to);

        let (mut dot, mut cross, mut energy) = (0.0f32, 0.0f32, 0.0f32);
        for (&(px, py), &(qx, qy)) in from.iter().zip(to).take(n) {
            let (ux, uy) = (px - fx, py - fy);
            let (vx, vy) = (qx - gx, qy - gy);
            dot += ux * vx + uy * vy;
            cross += ux * vy - uy * vx;
            energy += ux * ux + uy * uy;
        }
        if energy < 1e-9 {
            return Self {
                tx: gx - fx,
                ty: gy - fy,
                ..Self::IDENTITY
            };
        }

        let (cos, sin) = (dot / energy, cross / energy);
        Self {
            cos,
            sin,
            tx: gx - (cos * fx - sin * fy),
            ty: gy - (sin * fx + cos * fy),
        }
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.cos * x - self.sin * y + self.tx,
            self.sin * x + self.cos * y + self.ty,
        )
    }

    /// `None` when the transform collapses everything to a point.
    pub fn inverse(&self) -> Option<Self> {
        let det = self.cos * self.cos + self.sin * self.sin;
        if det < 1e-12 {
            return None;
        }
        let (cos, sin) = (self.cos / det, -self.sin / det);
        Some(Self {
            cos,
            sin,
            tx: -(cos * self.tx - sin * self.ty),
            ty: -(sin * self.tx + cos * self.ty),
        })
    }
}

fn bilinear(src: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (w, h) = (src.width() as i64, src.height() as i64);
    let (x0, y0) = (x.floor() as i64, y.floor() as i64);
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);
    let at = |xi: i64, yi: i64| -> [f32; 3] {
        if (0..w).contains(&xi) && (0..h).contains(&yi) {
            let p = src.get_pixel(xi as u32, yi as u32);
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };
    let corners = [
        (at(x0, y0), (1.0 - fx) * (1.0 - fy)),
        (at(x0 + 1, y0), fx * (1.0 - fy)),
        (at(x0, y0 + 1), (1.0 - fx) * fy),
        (at(x0 + 1, y0 + 1), fx * fy),
    ];
    let mut out = [0u8; 3];
    for (c, v) in out.iter_mut().enumerate() {
        let sum: f32 = corners.iter().map(|(px, wgt)| px[c] * wgt).sum();
        *v = sum.round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// Render `size`x`size` output where each pixel is `src` sampled at
/// `to_output⁻¹(pixel)`. Pixels mapping outside `src` are black.
pub fn warp(src: &RgbImage, to_output: &Similarity, size: u32) -> RgbImage {
    let Some(back) = to_output.inverse() else {
        return RgbImage::new(size, size);
    };
    RgbImage::from_fn(size, size, |ox, oy| {
        let (sx, sy) = back.apply((ox as f32, oy as f32));
        bilinear(src, sx, sy)
    })
}

/// Canonical 112x112 crop for the face with the given five landmarks.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let transform = Similarity::fit(landmarks, &TEMPLATE_112);
    warp(image, &transform, ALIGNED_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: (f32, f32), b: (f32, f32), tol: f32) -> bool {
        (a.0 - b.0).abs() < tol && (a.1 - b.1).abs() < tol
    }

    #[test]
    fn test_fit_template_onto_itself_is_identity() {
        let t = Similarity::fit(&TEMPLATE_112, &TEMPLATE_112);
        assert!((t.cos - 1.0).abs() < 1e-4);
        assert!(t.sin.abs() < 1e-4);
        assert!(t.tx.abs() < 1e-3 && t.ty.abs() < 1e-3);
    }

    #[test]
    fn test_fit_recovers_rotation_scale_and_shift() {
        let truth = Similarity {
            cos: 0.5 * 0.3f32.cos(),
            sin: 0.5 * 0.3f32.sin(),
            tx: 12.0,
            ty: -7.0,
        };
        let moved: Vec<_> = TEMPLATE_112.iter().map(|&p| truth.apply(p)).collect();
        let fitted = Similarity::fit(&TEMPLATE_112, &moved);
        for p in TEMPLATE_112 {
            assert!(close(fitted.apply(p), truth.apply(p), 1e-3));
        }
    }

    #[test]
    fn test_inverse_round_trips_points() {
        let t = Similarity {
            cos: 0.8,
            sin: 0.6,
            tx: 3.0,
            ty: 4.0,
        };
        let back = t.inverse().unwrap();
        assert!(close(back.apply(t.apply((10.0, -2.0))), (10.0, -2.0), 1e-4));
        let collapsed = Similarity {
            cos: 0.0,
            sin: 0.0,
            ..t
        };
        assert!(collapsed.inverse().is_none());
    }

    #[test]
    fn test_degenerate_landmarks_translate_only() {
        let from = [(5.0, 5.0); 5];
        let t = Similarity::fit(&from, &TEMPLATE_112);
        assert_eq!((t.cos, t.sin), (1.0, 0.0));
    }

    #[test]
    fn test_align_face_uniform_image() {
        let image = RgbImage::from_pixel(320, 240, Rgb([90, 120, 150]));
        let aligned = align_face(&image, &TEMPLATE_112);
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        assert_eq!(aligned.get_pixel(56, 60), &Rgb([90, 120, 150]));
    }

    #[test]
    fn test_warp_outside_source_is_black() {
        let image = RgbImage::from_pixel(10, 10, Rgb([200, 10, 10]));
        let shift = Similarity {
            tx: 50.0,
            ty: 50.0,
            ..Similarity::IDENTITY
        };
        let out = warp(&image, &shift, 112);
        assert_eq!(out.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(out.get_pixel(55, 55), &Rgb([200, 10, 10]));
    }

    #[test]
    fn test_left_eye_lands_on_template() {
        // Face at twice the template scale, offset by (20, 10).
        let landmarks: [(f32, f32); 5] =
            std::array::from_fn(|i| (TEMPLATE_112[i].0 * 2.0 + 20.0, TEMPLATE_112[i].1 * 2.0 + 10.0));
        let mut image = RgbImage::new(300, 300);
        let (ex, ey) = (landmarks[0].0 as u32, landmarks[0].1 as u32);
        for y in ey - 3..=ey + 3 {
            for x in ex - 3..=ex + 3 {
                image.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }

        let aligned = align_face(&image, &landmarks);
        let (tx, ty) = (TEMPLATE_112[0].0.round() as u32, TEMPLATE_112[0].1.round() as u32);
        assert!(aligned.get_pixel(tx, ty)[0] > 100);
    }
}
