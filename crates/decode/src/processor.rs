//! Turns a prompt and an image into model inputs.

use crate::device::Device;
use crate::error::DecodeResult;
use crate::mask::AttentionMask;
use crate::model::ModelInputs;
use crate::tokenizer::Tokenizer;
use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array3;
use std::path::Path;
use tracing::debug;

const IMAGE_MEAN: f32 = 0.5;
const IMAGE_STD: f32 = 0.5;
const RESCALE_FACTOR: f32 = 1.0 / 255.0;

pub trait InputBuilder {
    fn prepare(&self, prompt: &str, image: &DynamicImage) -> DecodeResult<ModelInputs>;
}

pub fn load_image(path: impl AsRef<Path>) -> DecodeResult<DynamicImage> {
    Ok(image::open(path)?)
}

/// PaliGemma layout: `<image>` placeholders, `<bos>`, the prompt, then a
/// newline token that separates prefix from generated suffix.
pub struct PaliGemmaProcessor<T> {
    tokenizer: T,
    num_image_tokens: usize,
    image_size: u32,
    device: Device,
}

impl<T: Tokenizer> PaliGemmaProcessor<T> {
    pub fn new(tokenizer: T, num_image_tokens: usize, image_size: u32, device: Device) -> Self {
        Self {
            tokenizer,
            num_image_tokens,
            image_size,
            device,
        }
    }

    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    pub fn prompt_ids(&self, prompt: &str) -> Vec<u32> {
        let text = self.tokenizer.encode(prompt);
        let mut ids = Vec::with_capacity(self.num_image_tokens + text.len() + 2);
        ids.extend(std::iter::repeat(self.tokenizer.image_token_id()).take(self.num_image_tokens));
        ids.push(self.tokenizer.bos_token_id());
        ids.extend(text);
        ids.push(self.tokenizer.newline_token_id());
        ids
    }

    /// Resize (bicubic), rescale to [0, 1], normalize; returns (3, size, size).
    pub fn pixel_values(&self, image: &DynamicImage) -> Array3<f32> {
        let size = self.image_size;
        let rgb = image
            .resize_exact(size, size, FilterType::CatmullRom)
            .to_rgb8();
        Array3::from_shape_fn((3, size as usize, size as usize), |(c, y, x)| {
            let value = rgb.get_pixel(x as u32, y as u32)[c] as f32 * RESCALE_FACTOR;
            (value - IMAGE_MEAN) / IMAGE_STD
        })
    }
}

impl<T: Tokenizer> InputBuilder for PaliGemmaProcessor<T> {
    fn prepare(&self, prompt: &str, image: &DynamicImage) -> DecodeResult<ModelInputs> {
        let input_ids = self.prompt_ids(prompt);
        let image_features = self.pixel_values(image);
        debug!(
            tokens = input_ids.len(),
            image_tokens = self.num_image_tokens,
            "prepared model inputs"
        );
        Ok(ModelInputs {
            attention_mask: AttentionMask::ones(input_ids.len()),
            input_ids,
            image_features,
            device: self.device,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::WordTokenizer;
    use approx::assert_abs_diff_eq;
    use image::{Rgb, RgbImage};

    fn processor() -> PaliGemmaProcessor<WordTokenizer> {
        PaliGemmaProcessor::new(WordTokenizer::new(256), 4, 8, Device::Cpu)
    }

    #[test]
    fn prompt_layout() {
        let processor = processor();
        let ids = processor.prompt_ids("describe:");
        let tok = processor.tokenizer();
        let describe = tok.encode("describe:")[0];
        assert_eq!(ids, vec![4, 4, 4, 4, 2, describe, 5]);
    }

    #[test]
    fn pixels_are_normalized() {
        let processor = processor();
        let white = DynamicImage::ImageRgb8(RgbImage::from_pixel(20, 10, Rgb([255, 0, 255])));
        let pixels = processor.pixel_values(&white);
        assert_eq!(pixels.dim(), (3, 8, 8));
        assert_abs_diff_eq!(pixels[[0, 3, 3]], 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(pixels[[1, 3, 3]], -1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(pixels[[2, 7, 0]], 1.0, epsilon = 1e-5);
    }

    #[test]
    fn prepare_builds_matching_mask() {
        let processor = processor();
        let image = DynamicImage::ImageRgb8(RgbImage::new(8, 8));
        let inputs = processor.prepare("a dog", &image).expect("inputs");
        assert_eq!(inputs.attention_mask.len(), inputs.input_ids.len());
        assert_eq!(inputs.attention_mask.visible_count(), inputs.input_ids.len());
        assert_eq!(inputs.device, Device::Cpu);
    }

    #[test]
    fn missing_image_is_an_error() {
        assert!(load_image("/nonexistent/picture.png").is_err());
    }
}
