pub mod model;

pub use model::{ClassifierError, SequentialModel};

use image::imageops;
use image::{GrayImage, Rgb, RgbImage};

use crate::detect::Region;
use crate::source::luma_bt601;

/// Scores below this are anomalies.
pub const ANOMALY_CUTOFF: f32 = 0.5;

/// Binary scorer for candidate patches.
///
/// `score` returns a value in `[0, 1]`. Low scores mean "not a known
/// artifact", so a patch scoring below [`ANOMALY_CUTOFF`] is reported.
/// Implementations must be read-only so one instance can serve concurrent
/// frame pairs.
pub trait Classifier: Send + Sync {
    fn score(&self, patch: &GrayImage) -> Result<f32, ClassifierError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

pub fn is_anomalous(score: f32) -> bool {
    score < ANOMALY_CUTOFF
}

/// Cut `region` out of a color frame and turn it into a square grayscale
/// classifier input of side `size`.
///
/// The crop is clamped to the frame, so a region from the same frame size
/// is always taken whole.
pub fn prepare_patch(color: &RgbImage, region: &Region, size: u32) -> GrayImage {
    let crop = imageops::crop_imm(color, region.x, region.y, region.width, region.height).to_image();
    luma_bt601(&resize_bilinear(&crop, size))
}

/// Two-tap bilinear resize to `size x size` with half-pixel centers.
///
/// Unlike `FilterType::Triangle`, the support does not widen when
/// shrinking: every output pixel blends its 2x2 nearest source pixels.
fn resize_bilinear(src: &RgbImage, size: u32) -> RgbImage {
    let (width, height) = src.dimensions();
    if width == 0 || height == 0 {
        return RgbImage::new(size, size);
    }
    let scale_x = width as f32 / size as f32;
    let scale_y = height as f32 / size as f32;

    RgbImage::from_fn(size, size, |x, y| {
        let (x0, x1, fx) = bilinear_taps(x, scale_x, width);
        let (y0, y1, fy) = bilinear_taps(y, scale_y, height);
        let (a, b) = (src.get_pixel(x0, y0).0, src.get_pixel(x1, y0).0);
        let (c, d) = (src.get_pixel(x0, y1).0, src.get_pixel(x1, y1).0);

        let mut out = [0u8; 3];
        for (ch, value) in out.iter_mut().enumerate() {
            let top = a[ch] as f32 * (1.0 - fx) + b[ch] as f32 * fx;
            let bottom = c[ch] as f32 * (1.0 - fx) + d[ch] as f32 * fx;
            *value = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
        }
        Rgb(out)
    })
}

/// Source indices and weight of the second tap for output coordinate `dst`.
fn bilinear_taps(dst: u32, scale: f32, len: u32) -> (u32, u32, f32) {
    let pos = ((dst as f32 + 0.5) * scale - 0.5).max(0.0);
    let i0 = (pos.floor() as u32).min(len - 1);
    let i1 = (i0 + 1).min(len - 1);
    (i0, i1, (pos - i0 as f32).clamp(0.0, 1.0))
}
