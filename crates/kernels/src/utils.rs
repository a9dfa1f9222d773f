//! Shared helpers for kernel implementations.

use ndarray::{Array2, ArrayViewMut1, ArrayViewMut2, Axis};
use rayon::prelude::*;

/// Numerically stable softmax over a single vector.
///
/// A vector whose entries are all `-inf` becomes all zeros. NaN inputs
/// propagate so callers can detect corrupted scores.
pub fn softmax_inplace(mut values: ArrayViewMut1<'_, f32>) {
    let max = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        values.fill(0.0);
        return;
    }
    values.mapv_inplace(|x| (x - max).exp());
    let sum = values.sum();
    values /= sum.max(f32::MIN_POSITIVE);
}

pub fn softmax_rows_inplace(mut scores: ArrayViewMut2<'_, f32>) {
    scores
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(softmax_inplace);
}

/// Approximate GELU (tanh formulation).
pub fn gelu_inplace(x: &mut Array2<f32>) {
    let c = (2.0 / std::f32::consts::PI).sqrt();
    x.mapv_inplace(|v| 0.5 * v * (1.0 + (c * (v + 0.044715 * v.powi(3))).tanh()));
}

/// Turn a 0/1 key mask into an additive `(q_len, flags.len())` attention bias.
pub fn mask_to_bias(flags: &[u8], q_len: usize) -> Array2<f32> {
    Array2::from_shape_fn((q_len, flags.len()), |(_, j)| {
        if flags[j] == 0 {
            f32::NEG_INFINITY
        } else {
            0.0
        }
    })
}
