//! Image preprocessing for the vision transformer.
//!
//! Decode → RGB → resize the shorter side to the target with bilinear
//! filtering → center crop to a square → scale to [0, 1] → per-channel
//! ImageNet normalization → NCHW tensor of shape (1, 3, S, S).

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;

use crate::error::VisionError;

/// ImageNet channel means (RGB).
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet channel standard deviations (RGB).
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Converts encoded image bytes into a normalized input tensor.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    target_size: u32,
    mean: [f32; 3],
    std: [f32; 3],
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(224)
    }
}

impl Preprocessor {
    pub fn new(target_size: u32) -> Self {
        Self {
            target_size,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }

    pub fn target_size(&self) -> u32 {
        self.target_size
    }

    /// Decode encoded bytes (any format the `image` crate reads) and preprocess.
    pub fn preprocess_bytes(&self, bytes: &[u8]) -> Result<Array4<f32>, VisionError> {
        if bytes.is_empty() {
            return Err(VisionError::InvalidImage("empty image payload".to_string()));
        }
        let img = image::load_from_memory(bytes)
            .map_err(|e| VisionError::InvalidImage(e.to_string()))?;
        self.preprocess_rgb(&img.to_rgb8())
    }

    /// Resize, crop and normalize an already-decoded RGB image.
    pub fn preprocess_rgb(&self, img: &RgbImage) -> Result<Array4<f32>, VisionError> {
        let (w, h) = img.dimensions();
        if w == 0 || h == 0 {
            return Err(VisionError::InvalidImage(format!("bad image size {}x{}", w, h)));
        }

        let target = self.target_size;
        let (new_w, new_h) = scaled_dimensions(w, h, target);
        let resized = imageops::resize(img, new_w, new_h, FilterType::Triangle);

        let left = (new_w - target) / 2;
        let top = (new_h - target) / 2;
        let cropped = imageops::crop_imm(&resized, left, top, target, target).to_image();

        let side = target as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
        for (x, y, pixel) in cropped.enumerate_pixels() {
            for c in 0..3 {
                let v = pixel[c] as f32 / 255.0;
                tensor[[0, c, y as usize, x as usize]] = (v - self.mean[c]) / self.std[c];
            }
        }
        Ok(tensor)
    }
}

/// Dimensions after scaling the shorter side to `target`, keeping aspect ratio.
///
/// The shorter side is pinned to exactly `target` so the center crop always fits.
fn scaled_dimensions(w: u32, h: u32, target: u32) -> (u32, u32) {
    let short = w.min(h) as f64;
    let scale = target as f64 / short;
    let scale_side = |side: u32| ((side as f64 * scale).round() as u32).max(target);
    if w <= h {
        (target, scale_side(h))
    } else {
        (scale_side(w), target)
    }
}
