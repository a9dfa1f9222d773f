//! Interface between the decode loop and a vision-language model.

use crate::device::Device;
use crate::error::DecodeResult;
use crate::kv_cache::KVCache;
use crate::mask::AttentionMask;
use ndarray::{Array3, ArrayView3};

/// Tensors prepared for the first forward call of a generation.
#[derive(Debug, Clone)]
pub struct ModelInputs {
    /// Prompt token ids, image placeholders included.
    pub input_ids: Vec<u32>,
    pub attention_mask: AttentionMask,
    /// Normalized pixels, (channels, height, width).
    pub image_features: Array3<f32>,
    pub device: Device,
}

/// Window handed to one forward call.
#[derive(Debug, Clone, Copy)]
pub struct ForwardInput<'a> {
    /// Full prompt while the cache is empty, the newest token afterwards.
    pub input_ids: &'a [u32],
    /// Present on the first call only.
    pub image_features: Option<ArrayView3<'a, f32>>,
    /// Covers every position the model can see, cached ones included.
    pub attention_mask: &'a AttentionMask,
}

#[derive(Debug)]
pub struct ForwardOutput {
    /// Scores per position: (batch=1, window_len, vocab_size)
    pub logits: Array3<f32>,
    pub kv_cache: KVCache,
}

/// A model the generation controller can drive.
///
/// `forward` takes the cache by value and hands back its successor; callers
/// always continue with the returned cache.
pub trait VisionLanguageModel {
    fn device(&self) -> Device;

    fn vocab_size(&self) -> usize;

    /// A fresh cache sized for this model.
    fn empty_cache(&self) -> KVCache;

    fn forward(&self, input: ForwardInput<'_>, kv_cache: KVCache) -> DecodeResult<ForwardOutput>;
}
