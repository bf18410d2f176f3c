//! Pixel-format conversion from raw V4L2 buffers to RGB8.

use image::{ImageFormat, Rgb, RgbImage};

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("invalid {format} length: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("odd width {0} cannot be packed as YUYV")]
    OddWidth(u32),
    #[error("MJPG decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

/// Convert packed YUYV (4:2:2) to RGB using BT.601 coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share
/// the chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, ConvertError> {
    if width % 2 != 0 {
        return Err(ConvertError::OddWidth(width));
    }
    let expected = width as usize * height as usize * 2;
    if yuyv.len() < expected {
        return Err(ConvertError::InvalidLength {
            format: "YUYV",
            expected,
            actual: yuyv.len(),
        });
    }

    let mut out = Vec::with_capacity(width as usize * height as usize * 3);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0], chunk[2]] {
            out.extend_from_slice(&ycbcr_to_rgb(y as f32, u, v).0);
        }
    }

    RgbImage::from_raw(width, height, out).ok_or(ConvertError::InvalidLength {
        format: "YUYV",
        expected,
        actual: yuyv.len(),
    })
}

fn ycbcr_to_rgb(y: f32, u: f32, v: f32) -> Rgb<u8> {
    let r = y + 1.402 * v;
    let g = y - 0.344_136 * u - 0.714_136 * v;
    let b = y + 1.772 * u;
    Rgb([
        r.round().clamp(0.0, 255.0) as u8,
        g.round().clamp(0.0, 255.0) as u8,
        b.round().clamp(0.0, 255.0) as u8,
    ])
}

/// Decode one MJPG buffer (a complete JPEG image).
pub fn mjpg_to_rgb(data: &[u8]) -> Result<RgbImage, ConvertError> {
    Ok(image::load_from_memory_with_format(data, ImageFormat::Jpeg)?.to_rgb8())
}

/// Copy a packed RGB24 buffer.
pub fn rgb3_to_rgb(data: &[u8], width: u32, height: u32) -> Result<RgbImage, ConvertError> {
    let expected = width as usize * height as usize * 3;
    if data.len() < expected {
        return Err(ConvertError::InvalidLength {
            format: "RGB3",
            expected,
            actual: data.len(),
        });
    }
    RgbImage::from_raw(width, height, data[..expected].to_vec()).ok_or(
        ConvertError::InvalidLength {
            format: "RGB3",
            expected,
            actual: data.len(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_neutral_chroma_is_gray() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128]
        let rgb = yuyv_to_rgb(&[100, 128, 200, 128], 2, 1).unwrap();
        assert_eq!(*rgb.get_pixel(0, 0), Rgb([100, 100, 100]));
        assert_eq!(*rgb.get_pixel(1, 0), Rgb([200, 200, 200]));
    }

    #[test]
    fn test_yuyv_red_chroma() {
        // Pure red in BT.601 full range: Y≈76, U≈85, V≈255.
        let rgb = yuyv_to_rgb(&[76, 85, 76, 255], 2, 1).unwrap();
        let p = rgb.get_pixel(0, 0);
        assert!(p[0] > 240, "{p:?}");
        assert!(p[1] < 15 && p[2] < 15, "{p:?}");
    }

    #[test]
    fn test_yuyv_4x2_dimensions() {
        let yuyv = vec![128u8; 16];
        let rgb = yuyv_to_rgb(&yuyv, 4, 2).unwrap();
        assert_eq!(rgb.dimensions(), (4, 2));
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(matches!(
            yuyv_to_rgb(&[100, 128], 2, 1),
            Err(ConvertError::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_yuyv_odd_width() {
        assert!(matches!(yuyv_to_rgb(&[0; 12], 3, 1), Err(ConvertError::OddWidth(3))));
    }

    #[test]
    fn test_mjpg_roundtrip_dimensions() {
        let src = RgbImage::from_pixel(16, 8, Rgb([10, 200, 30]));
        let mut jpeg = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 90)
            .encode_image(&src)
            .unwrap();
        let decoded = mjpg_to_rgb(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (16, 8));
    }

    #[test]
    fn test_mjpg_garbage_is_error() {
        assert!(matches!(mjpg_to_rgb(b"not a jpeg"), Err(ConvertError::Decode(_))));
    }

    #[test]
    fn test_rgb3_copies_prefix() {
        let data = vec![1, 2, 3, 4, 5, 6, 99];
        let rgb = rgb3_to_rgb(&data, 2, 1).unwrap();
        assert_eq!(rgb.as_raw(), &vec![1, 2, 3, 4, 5, 6]);
    }
}
