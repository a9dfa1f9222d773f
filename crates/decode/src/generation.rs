//! Autoregressive decode loop.
//!
//! The controller owns everything that lives for one generation: the cache,
//! the growing attention mask and the sampled tokens. Step 1 (prefill) feeds
//! the whole prompt and the image; every later step feeds only the token
//! sampled on the previous step, since the cache already covers the rest.

use crate::config::GenerationConfig;
use crate::device::Device;
use crate::error::{DecodeError, DecodeResult};
use crate::model::{ForwardInput, ModelInputs, VisionLanguageModel};
use crate::sampler::Sampler;
use ndarray::{Array3, ArrayView1, Axis};
use std::slice;
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The end-of-sequence token was sampled; it is the last output token.
    EndOfSequence,
    /// `max_new_tokens` steps ran without sampling the end-of-sequence token.
    MaxTokens,
}

#[derive(Debug, Clone, Default)]
pub struct GenerationMetrics {
    pub prefill_ms: f64,
    pub decode_ms: f64,
    pub tokens_generated: usize,
    pub tokens_per_sec: f64,
    pub kv_cache_bytes_per_token: usize,
}

#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// Sampled ids in order, including the end-of-sequence id when it stopped the loop.
    pub tokens: Vec<u32>,
    pub stop_reason: StopReason,
    /// Attention mask length after the last step.
    pub context_len: usize,
    pub metrics: GenerationMetrics,
}

pub struct GenerationController<'m, M: ?Sized> {
    model: &'m M,
    device: Device,
    config: GenerationConfig,
}

impl<'m, M> GenerationController<'m, M>
where
    M: VisionLanguageModel + ?Sized,
{
    pub fn new(model: &'m M, device: Device, config: GenerationConfig) -> Self {
        Self {
            model,
            device,
            config,
        }
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Generate with the sampler described by the configured [`SamplingConfig`].
    ///
    /// [`SamplingConfig`]: crate::config::SamplingConfig
    pub fn generate(&self, inputs: ModelInputs) -> DecodeResult<GenerationOutput> {
        let mut sampler = self.config.sampling.build_sampler()?;
        self.generate_with_sampler(inputs, sampler.as_mut())
    }

    pub fn generate_with_sampler(
        &self,
        inputs: ModelInputs,
        sampler: &mut dyn Sampler,
    ) -> DecodeResult<GenerationOutput> {
        self.check_devices(&inputs)?;

        let ModelInputs {
            input_ids,
            mut attention_mask,
            image_features,
            ..
        } = inputs;

        if input_ids.is_empty() {
            return Err(DecodeError::shape("prompt must contain at least one token"));
        }
        if attention_mask.len() != input_ids.len() {
            return Err(DecodeError::shape(format!(
                "attention mask covers {} positions but prompt has {} tokens",
                attention_mask.len(),
                input_ids.len()
            )));
        }

        let max_new_tokens = self.config.max_new_tokens;
        let eos_token_id = self.config.eos_token_id;
        let vocab_size = self.model.vocab_size();

        let mut kv_cache = self.model.empty_cache();
        // Size buffers by the context room left in the cache, not by the budget.
        let room = kv_cache.max_len().saturating_sub(input_ids.len());
        let reserve = max_new_tokens.min(room);
        attention_mask.reserve(reserve);
        let mut generated = Vec::with_capacity(reserve);
        let mut last_token: Option<u32> = None;
        let mut stop_reason = StopReason::MaxTokens;

        info!(
            prompt_tokens = input_ids.len(),
            max_new_tokens,
            sampler = sampler.name(),
            device = %self.device,
            "starting generation"
        );

        let start = Instant::now();
        let mut prefill_ms = 0.0;

        for step in 1..=max_new_tokens {
            let window: &[u32] = match &last_token {
                None => input_ids.as_slice(),
                Some(token) => slice::from_ref(token),
            };
            let covered = kv_cache.len();
            if covered + window.len() != attention_mask.len() {
                return Err(DecodeError::shape(format!(
                    "attention mask covers {} positions but model would see {}",
                    attention_mask.len(),
                    covered + window.len()
                )));
            }

            let image_features = kv_cache.is_empty().then(|| image_features.view());
            let output = self.model.forward(
                ForwardInput {
                    input_ids: window,
                    image_features,
                    attention_mask: &attention_mask,
                },
                kv_cache,
            )?;
            kv_cache = output.kv_cache;

            if kv_cache.len() != covered + window.len() {
                return Err(DecodeError::shape(format!(
                    "cache covers {} positions after step {}, expected {}",
                    kv_cache.len(),
                    step,
                    covered + window.len()
                )));
            }

            let scores = last_position_scores(&output.logits, vocab_size)?;
            let token = sampler.sample(scores)?;
            generated.push(token);
            debug!(step, token, context = attention_mask.len(), "sampled token");

            if step == 1 {
                prefill_ms = start.elapsed().as_secs_f64() * 1000.0;
            }

            if token == eos_token_id {
                stop_reason = StopReason::EndOfSequence;
                break;
            }

            attention_mask.push_visible();
            last_token = Some(token);
        }

        let total_ms = start.elapsed().as_secs_f64() * 1000.0;
        let decode_ms = (total_ms - prefill_ms).max(0.0);
        let decoded_tokens = generated.len().saturating_sub(1);
        let tokens_per_sec = if decode_ms > 0.0 {
            (decoded_tokens as f64 / decode_ms) * 1000.0
        } else {
            0.0
        };

        let metrics = GenerationMetrics {
            prefill_ms,
            decode_ms,
            tokens_generated: generated.len(),
            tokens_per_sec,
            kv_cache_bytes_per_token: kv_cache.bytes_per_token(),
        };

        info!(
            tokens = generated.len(),
            stop_reason = ?stop_reason,
            prefill_ms,
            decode_ms,
            "generation finished"
        );

        Ok(GenerationOutput {
            tokens: generated,
            stop_reason,
            context_len: attention_mask.len(),
            metrics,
        })
    }

    fn check_devices(&self, inputs: &ModelInputs) -> DecodeResult<()> {
        let model_device = self.model.device();
        if model_device != self.device {
            return Err(DecodeError::Device {
                expected: self.device,
                found: model_device,
            });
        }
        if inputs.device != self.device {
            return Err(DecodeError::Device {
                expected: self.device,
                found: inputs.device,
            });
        }
        Ok(())
    }
}

/// Score vector of the last position of a (1, seq_len, vocab_size) tensor.
fn last_position_scores(logits: &Array3<f32>, vocab_size: usize) -> DecodeResult<ArrayView1<'_, f32>> {
    let (batch, seq_len, vocab) = logits.dim();
    if batch != 1 || seq_len == 0 || vocab != vocab_size {
        return Err(DecodeError::shape(format!(
            "expected logits of shape (1, >=1, {}), got {:?}",
            vocab_size,
            logits.dim()
        )));
    }
    Ok(logits.index_axis(Axis(0), 0).index_axis_move(Axis(0), seq_len - 1))
}
