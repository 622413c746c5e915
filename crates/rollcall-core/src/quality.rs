//! Crop sharpness metric used by the enrollment blur gate.

use image::GrayImage;

/// Variance of the 4-neighbour Laplacian over the interior pixels.
///
/// Sharp crops have strong edges and a high variance; blurred crops score
/// near zero. Crops smaller than 3x3 score 0.
pub fn laplacian_variance(image: &GrayImage) -> f64 {
    let (width, height) = image.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }

    let px = |x: u32, y: u32| image.get_pixel(x, y).0[0] as f64;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut n = 0.0;

    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let lap = px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1) - 4.0 * px(x, y);
            sum += lap;
            sum_sq += lap * lap;
            n += 1.0;
        }
    }

    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_flat_image_has_zero_variance() {
        let img = GrayImage::from_pixel(16, 16, Luma([120]));
        assert_eq!(laplacian_variance(&img), 0.0);
    }

    #[test]
    fn test_checkerboard_is_sharp() {
        let img = GrayImage::from_fn(16, 16, |x, y| Luma([if (x + y) % 2 == 0 { 0 } else { 255 }]));
        let smooth = GrayImage::from_fn(16, 16, |x, _| Luma([(x * 4) as u8]));
        assert!(laplacian_variance(&img) > 1000.0);
        assert!(laplacian_variance(&img) > laplacian_variance(&smooth));
    }

    #[test]
    fn test_tiny_image_scores_zero() {
        let img = GrayImage::from_pixel(2, 5, Luma([10]));
        assert_eq!(laplacian_variance(&img), 0.0);
    }
}
