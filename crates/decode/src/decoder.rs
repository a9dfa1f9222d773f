//! Decoder block: self-attention + MLP with KV-cache support.

use crate::config::ReferenceConfig;
use crate::error::{DecodeError, DecodeResult};
use crate::kv_cache::KVCache;
use crate::mask::AttentionMask;
use crate::rope::RoPECache;
use crate::weights::DecoderWeights;
use ndarray::{s, Array2, Axis};
use paligemma_kernels::{gelu_inplace, mask_to_bias, rms_norm, scaled_dot_product_attention};

pub struct DecoderBlock {
    config: ReferenceConfig,
    rope: RoPECache,
}

impl DecoderBlock {
    pub fn new(config: ReferenceConfig) -> Self {
        let rope = RoPECache::new(config.max_seq_len, config.head_dim(), config.rope_theta);
        Self { config, rope }
    }

    /// Forward pass for a single decoder layer.
    ///
    /// Inputs:
    /// - x: (seq_len, hidden) hidden states of the current window
    /// - kv_cache: receives this layer's keys/values for the window
    /// - position_offset: positions already covered by the cache
    /// - mask: flags for every position visible after this window is appended
    ///
    /// Returns: (seq_len, hidden) output
    pub fn forward(
        &self,
        x: &Array2<f32>,
        weights: &DecoderWeights,
        kv_cache: &mut KVCache,
        layer_idx: usize,
        position_offset: usize,
        mask: &AttentionMask,
    ) -> DecodeResult<Array2<f32>> {
        let (_seq_len, hidden) = x.dim();
        if hidden != self.config.hidden_size {
            return Err(DecodeError::shape(format!(
                "hidden size {} does not match config {}",
                hidden, self.config.hidden_size
            )));
        }
        let eps = self.config.rms_norm_eps;

        let x_norm = rms_norm(x.view(), weights.input_norm.view(), eps)?;
        let attn_out =
            self.self_attention(&x_norm, weights, kv_cache, layer_idx, position_offset, mask)?;
        let x = x + &attn_out;

        let x_norm = rms_norm(x.view(), weights.post_attention_norm.view(), eps)?;
        let mlp_out = self.mlp(&x_norm, weights);

        Ok(x + &mlp_out)
    }

    fn self_attention(
        &self,
        x: &Array2<f32>,
        weights: &DecoderWeights,
        kv_cache: &mut KVCache,
        layer_idx: usize,
        position_offset: usize,
        mask: &AttentionMask,
    ) -> DecodeResult<Array2<f32>> {
        let seq_len = x.nrows();
        let head_dim = self.config.head_dim();

        let mut q = x.dot(&weights.q_proj);
        let mut k = x.dot(&weights.k_proj);
        let v = x.dot(&weights.v_proj);

        for h in 0..self.config.n_heads {
            let cols = h * head_dim..(h + 1) * head_dim;
            self.rope
                .apply(q.slice_mut(s![.., cols.clone()]), position_offset)?;
            self.rope.apply(k.slice_mut(s![.., cols]), position_offset)?;
        }

        let (k_cached, v_cached) = kv_cache.append_layer(
            layer_idx,
            k.view().insert_axis(Axis(0)),
            v.view().insert_axis(Axis(0)),
        )?;
        let k_full = k_cached.index_axis(Axis(0), 0); // (covered_len, hidden)
        let v_full = v_cached.index_axis(Axis(0), 0);

        if mask.len() != k_full.nrows() {
            return Err(DecodeError::shape(format!(
                "attention mask covers {} positions, cache holds {}",
                mask.len(),
                k_full.nrows()
            )));
        }
        // Prefix-LM: the prompt attends bidirectionally, so only padding is masked.
        let bias = mask_to_bias(mask.as_slice(), seq_len);

        let scale = 1.0 / (head_dim as f32).sqrt();
        let mut attn = Array2::<f32>::zeros((seq_len, self.config.hidden_size));
        for h in 0..self.config.n_heads {
            let cols = h * head_dim..(h + 1) * head_dim;
            let head_out = scaled_dot_product_attention(
                q.slice(s![.., cols.clone()]),
                k_full.slice(s![.., cols.clone()]),
                v_full.slice(s![.., cols.clone()]),
                Some(bias.view()),
                scale,
            )?;
            attn.slice_mut(s![.., cols]).assign(&head_out);
        }

        Ok(attn.dot(&weights.o_proj))
    }

    fn mlp(&self, x: &Array2<f32>, weights: &DecoderWeights) -> Array2<f32> {
        let mut hidden = x.dot(&weights.mlp_up);
        gelu_inplace(&mut hidden);
        hidden.dot(&weights.mlp_down)
    }
}
