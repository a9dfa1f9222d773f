//! Small Gemma-like vision-language model: patch embeddings, decoder stack
//! and LM head.
//!
//! It follows PaliGemma's data flow (image patches projected into the token
//! embedding space, merged at `<image>` placeholders, prefix attention over
//! the prompt) at a size that runs on CPU in tests. The CLI uses it when no
//! external backend is plugged in.

use crate::config::ReferenceConfig;
use crate::decoder::DecoderBlock;
use crate::device::Device;
use crate::error::{DecodeError, DecodeResult};
use crate::kv_cache::KVCache;
use crate::model::{ForwardInput, ForwardOutput, VisionLanguageModel};
use crate::weights::ModelWeights;
use anyhow::Context;
use ndarray::{Array2, ArrayView3, Axis};
use paligemma_kernels::rms_norm;
use std::path::Path;
use tracing::info;

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const VOCAB_FILE: &str = "vocab.json";

pub struct ReferenceModel {
    config: ReferenceConfig,
    weights: ModelWeights,
    decoder: DecoderBlock,
    device: Device,
}

impl ReferenceModel {
    /// Devices this implementation can run on.
    pub const SUPPORTED_DEVICES: &'static [Device] = &[Device::Cpu];

    pub fn new(config: ReferenceConfig, weights: ModelWeights, device: Device) -> DecodeResult<Self> {
        config.validate()?;
        weights.check_shapes(&config)?;
        if !Self::SUPPORTED_DEVICES.contains(&device) {
            return Err(DecodeError::Device {
                expected: Device::Cpu,
                found: device,
            });
        }
        let decoder = DecoderBlock::new(config.clone());
        Ok(Self {
            config,
            weights,
            decoder,
            device,
        })
    }

    /// Random weights, reproducible from `seed` (not pretrained).
    pub fn random(config: ReferenceConfig, seed: u64, device: Device) -> DecodeResult<Self> {
        let weights = ModelWeights::random(&config, seed);
        Self::new(config, weights, device)
    }

    /// Load `config.json` and `model.safetensors` from a model directory.
    pub fn load(dir: impl AsRef<Path>, device: Device) -> DecodeResult<Self> {
        let dir = dir.as_ref();
        let config = ReferenceConfig::from_json_file(dir.join(CONFIG_FILE))?;
        info!(path = %dir.display(), layers = config.n_layers, "loading weights from safetensors");
        let weights = ModelWeights::load_safetensors(dir.join(WEIGHTS_FILE), &config)
            .with_context(|| format!("failed to load weights from {}", dir.display()))?;
        Self::new(config, weights, device)
    }

    pub fn config(&self) -> &ReferenceConfig {
        &self.config
    }

    fn embed_tokens(&self, ids: &[u32]) -> DecodeResult<Array2<f32>> {
        let hidden = self.config.hidden_size;
        let normalizer = (hidden as f32).sqrt();
        let mut out = Array2::<f32>::zeros((ids.len(), hidden));
        for (row, &id) in ids.iter().enumerate() {
            if id as usize >= self.config.vocab_size {
                return Err(DecodeError::shape(format!(
                    "token id {} outside vocabulary of {}",
                    id, self.config.vocab_size
                )));
            }
            out.row_mut(row)
                .assign(&self.weights.token_embeddings.row(id as usize));
        }
        out *= normalizer;
        Ok(out)
    }

    /// Project non-overlapping patches of a (3, size, size) pixel tensor:
    /// one row per patch in raster order, scaled by `hidden^-0.5`.
    fn embed_image(&self, pixels: ArrayView3<'_, f32>) -> DecodeResult<Array2<f32>> {
        let size = self.config.image_size;
        if pixels.dim() != (3, size, size) {
            return Err(DecodeError::shape(format!(
                "expected image features of shape (3, {}, {}), got {:?}",
                size,
                size,
                pixels.dim()
            )));
        }
        let p = self.config.patch_size;
        let per_side = size / p;
        let patches = Array2::from_shape_fn(
            (self.config.num_image_tokens(), self.config.patch_dim()),
            |(i, j)| {
                let (py, px) = (i / per_side, i % per_side);
                let (c, r) = (j / (p * p), j % (p * p));
                pixels[[c, py * p + r / p, px * p + r % p]]
            },
        );
        let mut embeds = patches.dot(&self.weights.patch_embedding);
        embeds *= (self.config.hidden_size as f32).powf(-0.5);
        Ok(embeds)
    }

    /// Overwrite `<image>` placeholder rows with image embeddings, in order.
    fn merge_image_embeddings(
        &self,
        hidden: &mut Array2<f32>,
        ids: &[u32],
        image_embeds: &Array2<f32>,
    ) -> DecodeResult<()> {
        let positions: Vec<usize> = ids
            .iter()
            .enumerate()
            .filter(|&(_, &id)| id == self.config.image_token_id)
            .map(|(pos, _)| pos)
            .collect();
        if positions.len() != image_embeds.nrows() {
            return Err(DecodeError::shape(format!(
                "prompt has {} image placeholders but the image yields {} embeddings",
                positions.len(),
                image_embeds.nrows()
            )));
        }
        for (patch, pos) in positions.into_iter().enumerate() {
            hidden.row_mut(pos).assign(&image_embeds.row(patch));
        }
        Ok(())
    }
}

impl VisionLanguageModel for ReferenceModel {
    fn device(&self) -> Device {
        self.device
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn empty_cache(&self) -> KVCache {
        KVCache::new(
            self.config.n_layers,
            self.config.max_seq_len,
            self.config.hidden_size,
        )
    }

    /// Embed → merge image → decoder stack → final norm → LM head
    fn forward(&self, input: ForwardInput<'_>, mut kv_cache: KVCache) -> DecodeResult<ForwardOutput> {
        if input.input_ids.is_empty() {
            return Err(DecodeError::shape("forward called with an empty window"));
        }
        let position_offset = kv_cache.len();
        let mut hidden = self.embed_tokens(input.input_ids)?;

        if kv_cache.is_empty() {
            let pixels = input.image_features.ok_or_else(|| {
                DecodeError::shape("image features are required while the cache is empty")
            })?;
            let image_embeds = self.embed_image(pixels)?;
            self.merge_image_embeddings(&mut hidden, input.input_ids, &image_embeds)?;
        }

        for (layer_idx, layer_weights) in self.weights.layers.iter().enumerate() {
            hidden = self.decoder.forward(
                &hidden,
                layer_weights,
                &mut kv_cache,
                layer_idx,
                position_offset,
                input.attention_mask,
            )?;
        }

        let normed = rms_norm(
            hidden.view(),
            self.weights.final_norm.view(),
            self.config.rms_norm_eps,
        )?;

        // (seq_len, hidden) @ (hidden, vocab_size) -> (1, seq_len, vocab_size)
        let logits = normed.dot(&self.weights.lm_head).insert_axis(Axis(0));

        Ok(ForwardOutput { logits, kv_cache })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::AttentionMask;
    use ndarray::Array3;

    fn prompt(config: &ReferenceConfig) -> Vec<u32> {
        let mut ids = vec![config.image_token_id; config.num_image_tokens()];
        ids.extend([2, 10, 11, 5]);
        ids
    }

    #[test]
    fn prefill_then_single_token_step() {
        let config = ReferenceConfig::tiny();
        let model = ReferenceModel::random(config.clone(), 7, Device::Cpu).expect("model");
        let ids = prompt(&config);
        let pixels = Array3::<f32>::zeros((3, config.image_size, config.image_size));
        let mut mask = AttentionMask::ones(ids.len());

        let out = model
            .forward(
                ForwardInput {
                    input_ids: &ids,
                    image_features: Some(pixels.view()),
                    attention_mask: &mask,
                },
                model.empty_cache(),
            )
            .expect("prefill");
        assert_eq!(out.logits.dim(), (1, ids.len(), config.vocab_size));
        assert_eq!(out.kv_cache.len(), ids.len());

        mask.push_visible();
        let out = model
            .forward(
                ForwardInput {
                    input_ids: &[12],
                    image_features: None,
                    attention_mask: &mask,
                },
                out.kv_cache,
            )
            .expect("decode");
        assert_eq!(out.logits.dim(), (1, 1, config.vocab_size));
        assert_eq!(out.kv_cache.len(), ids.len() + 1);
        assert!(out.logits.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn incremental_decode_matches_full_prefill() {
        // One layer: with more, bidirectional prefix attention lets prompt
        // rows see the extra token and deeper keys diverge.
        let config = ReferenceConfig {
            n_layers: 1,
            ..ReferenceConfig::tiny()
        };
        let model = ReferenceModel::random(config.clone(), 21, Device::Cpu).expect("model");
        let pixels = Array3::from_shape_fn((3, config.image_size, config.image_size), |(c, y, x)| {
            ((c + y * 3 + x * 7) % 11) as f32 / 11.0 - 0.5
        });
        let ids = prompt(&config);
        let mut extended = ids.clone();
        extended.push(30);

        // Full pass over prompt + one token.
        let full_mask = AttentionMask::ones(extended.len());
        let full = model
            .forward(
                ForwardInput {
                    input_ids: &extended,
                    image_features: Some(pixels.view()),
                    attention_mask: &full_mask,
                },
                model.empty_cache(),
            )
            .expect("full");

        // Prefill the prompt, then feed the extra token through the cache.
        let mut mask = AttentionMask::ones(ids.len());
        let prefill = model
            .forward(
                ForwardInput {
                    input_ids: &ids,
                    image_features: Some(pixels.view()),
                    attention_mask: &mask,
                },
                model.empty_cache(),
            )
            .expect("prefill");
        mask.push_visible();
        let step = model
            .forward(
                ForwardInput {
                    input_ids: &[30],
                    image_features: None,
                    attention_mask: &mask,
                },
                prefill.kv_cache,
            )
            .expect("step");

        let last_full = full.logits.index_axis(Axis(0), 0);
        let last_full = last_full.row(extended.len() - 1);
        let last_step = step.logits.index_axis(Axis(0), 0);
        let last_step = last_step.row(0);
        for (a, b) in last_full.iter().zip(last_step.iter()) {
            assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
    }

    #[test]
    fn missing_image_on_prefill_is_rejected() {
        let config = ReferenceConfig::tiny();
        let model = ReferenceModel::random(config.clone(), 1, Device::Cpu).expect("model");
        let ids = prompt(&config);
        let mask = AttentionMask::ones(ids.len());
        let err = model
            .forward(
                ForwardInput {
                    input_ids: &ids,
                    image_features: None,
                    attention_mask: &mask,
                },
                model.empty_cache(),
            )
            .expect_err("needs image");
        assert!(matches!(err, DecodeError::Shape(_)));
    }

    #[test]
    fn placeholder_count_must_match_patches() {
        let config = ReferenceConfig::tiny();
        let model = ReferenceModel::random(config.clone(), 1, Device::Cpu).expect("model");
        let ids = vec![config.image_token_id, 2, 10];
        let mask = AttentionMask::ones(ids.len());
        let pixels = Array3::<f32>::zeros((3, config.image_size, config.image_size));
        let err = model
            .forward(
                ForwardInput {
                    input_ids: &ids,
                    image_features: Some(pixels.view()),
                    attention_mask: &mask,
                },
                model.empty_cache(),
            )
            .expect_err("placeholder mismatch");
        assert!(matches!(err, DecodeError::Shape(_)));
    }

    #[test]
    fn rejects_unsupported_device() {
        let err = ReferenceModel::random(ReferenceConfig::tiny(), 1, Device::Cuda)
            .err()
            .expect("cpu only");
        assert!(matches!(err, DecodeError::Device { .. }));
    }

    #[test]
    fn loads_from_model_directory() {
        let config = ReferenceConfig::tiny();
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            serde_json::to_string(&config).expect("json"),
        )
        .expect("write config");
        ModelWeights::random(&config, 4)
            .save_safetensors(dir.path().join(WEIGHTS_FILE))
            .expect("save");

        let model = ReferenceModel::load(dir.path(), Device::Cpu).expect("load");
        assert_eq!(model.config(), &config);
        assert_eq!(model.vocab_size(), config.vocab_size);
    }
}
