use anyhow::{ensure, Context, Result};
use image::{imageops::FilterType, RgbImage};
use ndarray::Array4;
use rand::Rng;
use rand_distr::StandardNormal;
use std::path::Path;

/// ImageNet channel means, matching the model zoo the weights come from.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet channel standard deviations.
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Image pre/postprocessing for ImageNet-trained networks.
///
/// Preprocessing rescales the smaller edge to `scale` and applies the
/// ImageNet channel normalization; postprocessing is the exact inverse
/// affine map. The scale has a surprisingly large effect on the output.
#[derive(Clone, Copy, Debug)]
pub struct Processor {
    scale: u32,
}

impl Default for Processor {
    fn default() -> Self {
        Self { scale: 256 }
    }
}

impl Processor {
    /// A processor rescaling the smaller image edge to `scale` pixels.
    pub fn new(scale: u32) -> Self {
        Self { scale }
    }
    /// Decodes, rescales and normalizes an image file into a `[1, 3, h, w]`
    /// tensor.
    ///
    /// **Errors**
    ///
    /// Returns an error if the file cannot be read or decoded.
    pub fn preprocess_file(&self, path: impl AsRef<Path>) -> Result<Array4<f32>> {
        let path = path.as_ref();
        let image = image::open(path)
            .with_context(|| format!("failed to open image {path:?}"))?
            .to_rgb8();
        let (w, h) = image.dimensions();
        let (new_w, new_h) = if w <= h {
            (self.scale, (h * self.scale) / w.max(1))
        } else {
            ((w * self.scale) / h.max(1), self.scale)
        };
        let image = image::imageops::resize(&image, new_w, new_h, FilterType::Triangle);
        let mut tensor = Array4::zeros((1, 3, new_h as usize, new_w as usize));
        for (x, y, pixel) in image.enumerate_pixels() {
            for c in 0..3 {
                tensor[(0, c, y as usize, x as usize)] = f32::from(pixel[c]) / 255.;
            }
        }
        Ok(self.normalize(tensor))
    }
    /// Applies the ImageNet normalization to a `[b, 3, h, w]` tensor of
    /// `[0, 1]` pixel values.
    pub fn normalize(&self, mut tensor: Array4<f32>) -> Array4<f32> {
        for ((_, c, _, _), value) in tensor.indexed_iter_mut() {
            *value = (*value - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
        tensor
    }
    /// The inverse of [`normalize`](Self::normalize).
    pub fn postprocess(&self, tensor: &Array4<f32>) -> Array4<f32> {
        let mut tensor = tensor.clone();
        for ((_, c, _, _), value) in tensor.indexed_iter_mut() {
            *value = *value * IMAGENET_STD[c] + IMAGENET_MEAN[c];
        }
        tensor
    }
    /// Encodes the first batch item to `path`, optionally undoing the
    /// normalization first. Pixels are clamped to `[0, 1]`.
    ///
    /// **Errors**
    ///
    /// Returns an error if the tensor is not 3-channel or encoding fails.
    pub fn save(&self, tensor: &Array4<f32>, path: impl AsRef<Path>, postprocess: bool) -> Result<()> {
        let path = path.as_ref();
        let tensor = if postprocess {
            self.postprocess(tensor)
        } else {
            tensor.clone()
        };
        let (_, c, h, w) = tensor.dim();
        ensure!(c == 3, "expected 3 channels, found {c}");
        let mut image = RgbImage::new(w as u32, h as u32);
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            for ci in 0..3 {
                let value = tensor[(0, ci, y as usize, x as usize)].clamp(0., 1.);
                pixel[ci] = (value * 255.).round() as u8;
            }
        }
        image
            .save(path)
            .with_context(|| format!("failed to save image {path:?}"))
    }
}

/// Standard-normal noise with the shape of `tensor`, the starting point of
/// the optimization.
pub fn noise_like<R: Rng>(tensor: &Array4<f32>, rng: &mut R) -> Array4<f32> {
    Array4::from_shape_simple_fn(tensor.raw_dim(), || rng.sample(StandardNormal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn normalize_round_trips() {
        let mut rng = StdRng::seed_from_u64(0);
        let pixels = Array4::from_shape_simple_fn((1, 3, 4, 5), || rng.gen_range(0f32..1.));
        let processor = Processor::default();
        let restored = processor.postprocess(&processor.normalize(pixels.clone()));
        for (a, b) in pixels.iter().zip(restored.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-5);
        }
    }

    #[test]
    fn save_and_preprocess_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.png");
        let mut rng = StdRng::seed_from_u64(1);
        let pixels = Array4::from_shape_simple_fn((1, 3, 8, 8), || rng.gen_range(0f32..1.));
        // scale matches the edge length, so no resampling happens
        let processor = Processor::new(8);
        let normalized = processor.normalize(pixels.clone());
        processor.save(&normalized, &path, true).unwrap();
        let restored = processor.postprocess(&processor.preprocess_file(&path).unwrap());
        for (a, b) in pixels.iter().zip(restored.iter()) {
            // 8 bit quantization
            assert_relative_eq!(a, b, epsilon = 1. / 255. + 1e-5);
        }
    }

    #[test]
    fn preprocess_rescales_smaller_edge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wide.png");
        let image = RgbImage::new(64, 16);
        image.save(&path).unwrap();
        let tensor = Processor::new(8).preprocess_file(&path).unwrap();
        assert_eq!(tensor.shape(), [1, 3, 8, 32]);
    }

    #[test]
    fn save_rejects_non_rgb() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.png");
        let tensor = Array4::zeros((1, 1, 4, 4));
        assert!(Processor::default().save(&tensor, &path, false).is_err());
    }

    #[test]
    fn noise_matches_shape() {
        let mut rng = StdRng::seed_from_u64(2);
        let tensor = Array4::<f32>::zeros((1, 3, 5, 7));
        let noise = noise_like(&tensor, &mut rng);
        assert_eq!(noise.raw_dim(), tensor.raw_dim());
        assert!(noise.iter().any(|x| *x != 0.));
    }
}
