use image::{GrayImage, Luma};

/// 5-tap binomial approximation of a Gaussian, applied along each axis.
const BLUR_KERNEL: [u32; 5] = [1, 4, 6, 4, 1];
const BLUR_RADIUS: i64 = 2;
/// Sum of the 2D kernel weights (16 * 16).
const BLUR_NORM: u32 = 256;

/// Binary change mask for one frame pair.
///
/// Changed pixels are 255, unchanged pixels are 0.
#[derive(Debug, Clone)]
pub struct ChangeMask {
    pub image: GrayImage,
    /// Otsu level that produced this mask. Pixels strictly above it changed.
    pub level: u8,
}

impl ChangeMask {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn changed_count(&self) -> usize {
        self.image.pixels().filter(|p| p.0[0] != 0).count()
    }
}

/// Noise-suppressed frame differencing with a per-pair adaptive threshold.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiffDetector;

impl DiffDetector {
    pub fn new() -> Self {
        Self
    }

    /// Compare an earlier and a later grayscale frame.
    ///
    /// Returns `None` when the frames do not share dimensions.
    pub fn detect(&self, earlier: &GrayImage, later: &GrayImage) -> Option<ChangeMask> {
        if earlier.dimensions() != later.dimensions() {
            return None;
        }

        let diff = abs_diff(&gaussian_blur_5x5(earlier), &gaussian_blur_5x5(later));
        let level = otsu_level(&diff);

        let mut image = diff;
        for pixel in image.pixels_mut() {
            pixel.0[0] = if pixel.0[0] > level { 255 } else { 0 };
        }

        Some(ChangeMask { image, level })
    }
}

/// Mirror an out-of-range coordinate back into `0..len` without repeating
/// the edge pixel (`dcb|abcd|cba`).
fn reflect_101(i: i64, len: i64) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len - 1);
    let mut i = i.rem_euclid(period);
    if i >= len {
        i = period - i;
    }
    i as usize
}

/// Separable 5x5 Gaussian blur with reflect-101 borders and rounded results.
pub fn gaussian_blur_5x5(image: &GrayImage) -> GrayImage {
    let (width, height) = image.dimensions();
    let (w, h) = (width as usize, height as usize);
    if w == 0 || h == 0 {
        return image.clone();
    }
    let src = image.as_raw();

    // Horizontal pass keeps the unnormalized sums to avoid intermediate rounding.
    let mut horizontal = vec![0u32; w * h];
    for y in 0..h {
        let row = &src[y * w..(y + 1) * w];
        for x in 0..w {
            let mut acc = 0u32;
            for (k, weight) in BLUR_KERNEL.iter().enumerate() {
                let sx = reflect_101(x as i64 + k as i64 - BLUR_RADIUS, w as i64);
                acc += weight * row[sx] as u32;
            }
            horizontal[y * w + x] = acc;
        }
    }

    let mut out = GrayImage::new(width, height);
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0u32;
            for (k, weight) in BLUR_KERNEL.iter().enumerate() {
                let sy = reflect_101(y as i64 + k as i64 - BLUR_RADIUS, h as i64);
                acc += weight * horizontal[sy * w + x];
            }
            let value = (acc + BLUR_NORM / 2) / BLUR_NORM;
            out.put_pixel(x as u32, y as u32, Luma([value.min(255) as u8]));
        }
    }
    out
}

/// Per-pixel absolute difference of two equally sized images.
pub fn abs_diff(a: &GrayImage, b: &GrayImage) -> GrayImage {
    let data = a
        .as_raw()
        .iter()
        .zip(b.as_raw().iter())
        .map(|(&pa, &pb)| pa.abs_diff(pb))
        .collect();
    // Same dimensions as `a`, so the buffer length always matches.
    GrayImage::from_raw(a.width(), a.height(), data).unwrap_or_else(|| a.clone())
}

/// Otsu's method: the level maximizing between-class variance.
///
/// Ties keep the lowest level. When no split has positive variance (a
/// single-valued image) the level stays 0, so any nonzero value is marked.
/// An all-zero difference therefore marks nothing, while a uniform nonzero
/// difference marks the whole frame.
pub fn otsu_level(image: &GrayImage) -> u8 {
    let mut histogram = [0u64; 256];
    for pixel in image.pixels() {
        histogram[pixel.0[0] as usize] += 1;
    }

    let total = image.pixels().len() as f64;
    let sum: f64 = histogram
        .iter()
        .enumerate()
        .map(|(i, &count)| i as f64 * count as f64)
        .sum();

    let mut weight_b = 0.0;
    let mut sum_b = 0.0;
    let mut max_variance = 0.0;
    let mut level = 0u8;

    for (i, &count) in histogram.iter().enumerate() {
        weight_b += count as f64;
        if weight_b == 0.0 {
            continue;
        }
        let weight_f = total - weight_b;
        if weight_f == 0.0 {
            break;
        }

        sum_b += i as f64 * count as f64;
        let mean_b = sum_b / weight_b;
        let mean_f = (sum - sum_b) / weight_f;
        let variance = weight_b * weight_f * (mean_b - mean_f).powi(2);

        if variance > max_variance {
            max_variance = variance;
            level = i as u8;
        }
    }

    level
}
