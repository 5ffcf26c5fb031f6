use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};

/// Laplacian variance that maps to a sharpness component of 1.0.
const SHARPNESS_SCALE: f64 = 1000.0;
/// Luma standard deviation that maps to a contrast component of 1.0.
const CONTRAST_SCALE: f64 = 64.0;
/// Composite weights. Stated once and reused so scores are comparable
/// across a batch; never recalibrated per call.
const W_SHARPNESS: f64 = 0.5;
const W_EXPOSURE: f64 = 0.3;
const W_CONTRAST: f64 = 0.2;
/// Quality analysis runs on a copy bounded to this edge so the metrics
/// are comparable across resolutions.
const ANALYSIS_BOUND: u32 = 512;

/// Per-photo quality metrics plus the composite score used for keeper
/// selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Edge-energy estimate (Laplacian variance over luma), >= 0.
    pub sharpness: f64,
    /// Mean luminance in [0, 255].
    pub brightness: f64,
    /// Luminance standard deviation, >= 0.
    pub contrast: f64,
    /// Weighted composite in [0, 100].
    pub score: f64,
}

/// Score decoded pixels. Deterministic and pure; decode failures are the
/// caller's concern.
pub fn score_image(image: &DynamicImage) -> QualityMetrics {
    let bounded = if image.width().max(image.height()) > ANALYSIS_BOUND {
        image.resize(ANALYSIS_BOUND, ANALYSIS_BOUND, FilterType::Triangle)
    } else {
        image.clone()
    };
    let luma = bounded.to_luma8();

    let (brightness, contrast) = luma_stats(&luma);
    let sharpness = laplacian_variance(&luma);

    let sharpness_component = (sharpness / SHARPNESS_SCALE).min(1.0);
    // Distance from mid-gray; badly over/under-exposed frames score low.
    let exposure_component = (1.0 - (brightness / 255.0 - 0.5).abs() * 2.0).max(0.0);
    let contrast_component = (contrast / CONTRAST_SCALE).min(1.0);

    let score = 100.0
        * (W_SHARPNESS * sharpness_component
            + W_EXPOSURE * exposure_component
            + W_CONTRAST * contrast_component);

    QualityMetrics {
        sharpness,
        brightness,
        contrast,
        score: score.clamp(0.0, 100.0),
    }
}

fn luma_stats(image: &GrayImage) -> (f64, f64) {
    let total = (image.width() * image.height()) as f64;
    if total == 0.0 {
        return (0.0, 0.0);
    }

    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for pixel in image.pixels() {
        let v = f64::from(pixel[0]);
        sum += v;
        sum_sq += v * v;
    }

    let mean = sum / total;
    let variance = (sum_sq / total - mean * mean).max(0.0);
    (mean, variance.sqrt())
}

fn laplacian_variance(image: &GrayImage) -> f64 {
    let (width, height) = image.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }

    // 4-neighbor Laplacian kernel:
    //   0 -1  0
    //  -1  4 -1
    //   0 -1  0
    let mut sum = 0.0;
    let mut count = 0u64;
    for y in 1..(height - 1) {
        for x in 1..(width - 1) {
            let center = f64::from(image.get_pixel(x, y)[0]);
            let response = 4.0 * center
                - f64::from(image.get_pixel(x, y - 1)[0])
                - f64::from(image.get_pixel(x, y + 1)[0])
                - f64::from(image.get_pixel(x - 1, y)[0])
                - f64::from(image.get_pixel(x + 1, y)[0]);
            sum += response * response;
            count += 1;
        }
    }

    if count > 0 {
        sum / count as f64
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma, Rgb};

    fn solid(value: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_pixel(64, 64, Rgb([value, value, value])))
    }

    fn checkerboard(cell: u32) -> DynamicImage {
        let img = ImageBuffer::from_fn(64, 64, |x, y| {
            if (x / cell + y / cell) % 2 == 0 {
                Luma([255u8])
            } else {
                Luma([0u8])
            }
        });
        DynamicImage::ImageLuma8(img)
    }

    #[test]
    fn solid_image_has_no_sharpness_or_contrast() {
        let metrics = score_image(&solid(128));
        assert_eq!(metrics.sharpness, 0.0);
        assert_eq!(metrics.contrast, 0.0);
        assert!((metrics.brightness - 128.0).abs() < 1.0);
    }

    #[test]
    fn busy_image_outranks_flat_image() {
        let flat = score_image(&solid(128));
        let busy = score_image(&checkerboard(2));
        assert!(busy.sharpness > flat.sharpness);
        assert!(busy.contrast > flat.contrast);
        assert!(busy.score > flat.score);
    }

    #[test]
    fn mid_gray_exposure_beats_extremes() {
        let mid = score_image(&solid(128));
        let dark = score_image(&solid(0));
        let bright = score_image(&solid(255));
        assert!(mid.score > dark.score);
        assert!(mid.score > bright.score);
    }

    #[test]
    fn score_stays_in_bounds() {
        for img in [solid(0), solid(255), checkerboard(1), checkerboard(8)] {
            let metrics = score_image(&img);
            assert!((0.0..=100.0).contains(&metrics.score), "{metrics:?}");
            assert!(metrics.sharpness >= 0.0);
            assert!((0.0..=255.0).contains(&metrics.brightness));
            assert!(metrics.contrast >= 0.0);
        }
    }

    #[test]
    fn identical_pixels_score_identically() {
        let img = checkerboard(4);
        assert_eq!(score_image(&img), score_image(&img));
    }
}
