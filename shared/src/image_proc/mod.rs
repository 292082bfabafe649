//! Image measurements used while aligning and focusing the sky camera.

use image::ImageError;

/// Contrast-based focus figure for an encoded frame.
///
/// Decodes the image, converts it to 8-bit luma and returns the population
/// standard deviation of the pixel values. Sharper star fields have higher
/// contrast against the sky background and so score higher.
pub fn focus_metric(encoded: &[u8]) -> Result<f64, ImageError> {
    let gray = image::load_from_memory(encoded)?.into_luma8();
    Ok(luma_std_dev(gray.as_raw()))
}

/// Population standard deviation of raw 8-bit samples; zero when empty.
pub fn luma_std_dev(pixels: &[u8]) -> f64 {
    if pixels.is_empty() {
        return 0.0;
    }
    let n = pixels.len() as f64;
    let mean = pixels.iter().map(|&p| p as f64).sum::<f64>() / n;
    let variance = pixels
        .iter()
        .map(|&p| {
            let d = p as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::{GrayImage, Luma};
    use std::io::Cursor;

    fn encode_png(img: &GrayImage) -> Vec<u8> {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn test_flat_image_scores_zero() {
        let img = GrayImage::from_pixel(16, 16, Luma([42]));
        let score = focus_metric(&encode_png(&img)).unwrap();
        assert_relative_eq!(score, 0.0);
    }

    #[test]
    fn test_half_black_half_white() {
        let img = GrayImage::from_fn(10, 4, |x, _| if x < 5 { Luma([0]) } else { Luma([255]) });
        let score = focus_metric(&encode_png(&img)).unwrap();
        assert_relative_eq!(score, 127.5, epsilon = 1e-9);
    }

    #[test]
    fn test_sharper_pattern_scores_higher() {
        let soft = GrayImage::from_fn(32, 32, |x, _| Luma([100 + (x as u8 % 4)]));
        let sharp = GrayImage::from_fn(32, 32, |x, y| {
            if (x + y) % 7 == 0 {
                Luma([250])
            } else {
                Luma([10])
            }
        });
        let soft_score = focus_metric(&encode_png(&soft)).unwrap();
        let sharp_score = focus_metric(&encode_png(&sharp)).unwrap();
        assert!(sharp_score > soft_score);
    }

    #[test]
    fn test_garbage_is_error() {
        assert!(focus_metric(b"not an image").is_err());
    }

    #[test]
    fn test_luma_std_dev_empty() {
        assert_eq!(luma_std_dev(&[]), 0.0);
    }
}
