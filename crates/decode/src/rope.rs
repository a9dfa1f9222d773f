//! Rotary Position Embeddings (RoPE) as used by Gemma.
//!
//! Reference: https://arxiv.org/abs/2104.09864

use crate::error::{DecodeError, DecodeResult};
use ndarray::{Array2, ArrayViewMut2};

pub struct RoPECache {
    cos: Array2<f32>,
    sin: Array2<f32>,
}

impl RoPECache {
    pub fn new(max_seq_len: usize, head_dim: usize, theta: f32) -> Self {
        let half = head_dim / 2;
        let mut cos = Array2::<f32>::zeros((max_seq_len, half));
        let mut sin = Array2::<f32>::zeros((max_seq_len, half));

        for pos in 0..max_seq_len {
            for i in 0..half {
                let freq = 1.0 / theta.powf((2 * i) as f32 / head_dim as f32);
                let angle = pos as f32 * freq;
                cos[[pos, i]] = angle.cos();
                sin[[pos, i]] = angle.sin();
            }
        }

        Self { cos, sin }
    }

    pub fn max_seq_len(&self) -> usize {
        self.cos.nrows()
    }

    /// Rotate one head's queries or keys, shape (seq_len, head_dim), in place.
    /// Adjacent feature pairs share a frequency.
    pub fn apply(&self, mut qk: ArrayViewMut2<'_, f32>, position_offset: usize) -> DecodeResult<()> {
        let (seq_len, head_dim) = qk.dim();
        if position_offset + seq_len > self.max_seq_len() {
            return Err(DecodeError::ContextOverflow {
                required: position_offset + seq_len,
                max: self.max_seq_len(),
            });
        }
        if head_dim != 2 * self.cos.ncols() {
            return Err(DecodeError::shape(format!(
                "head_dim {} does not match rotary table width {}",
                head_dim,
                2 * self.cos.ncols()
            )));
        }

        for pos in 0..seq_len {
            let abs_pos = position_offset + pos;
            for i in 0..head_dim / 2 {
                let (d0, d1) = (2 * i, 2 * i + 1);
                let x0 = qk[[pos, d0]];
                let x1 = qk[[pos, d1]];
                let c = self.cos[[abs_pos, i]];
                let s = self.sin[[abs_pos, i]];

                qk[[pos, d0]] = x0 * c - x1 * s;
                qk[[pos, d1]] = x0 * s + x1 * c;
            }
        }
        Ok(())
    }
}
