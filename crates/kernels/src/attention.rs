//! Attention mechanism kernels.

use crate::utils::softmax_rows_inplace;
use anyhow::{ensure, Result};
use ndarray::{Array2, ArrayView2};

/// Single-head attention.
///
/// `query` is `(q_len, head_dim)`, `key` and `value` are `(kv_len, head_dim)`.
/// `bias` is added to the raw scores before the softmax; masked positions
/// carry `f32::NEG_INFINITY`.
pub fn scaled_dot_product_attention(
    query: ArrayView2<'_, f32>,
    key: ArrayView2<'_, f32>,
    value: ArrayView2<'_, f32>,
    bias: Option<ArrayView2<'_, f32>>,
    scale: f32,
) -> Result<Array2<f32>> {
    ensure!(
        query.ncols() == key.ncols(),
        "query dim {} must match key dim {}",
        query.ncols(),
        key.ncols()
    );
    ensure!(
        key.nrows() == value.nrows(),
        "key rows {} differ from value rows {}",
        key.nrows(),
        value.nrows()
    );
    let mut scores = query.dot(&key.t());
    scores *= scale;

    if let Some(bias) = bias {
        ensure!(
            bias.dim() == scores.dim(),
            "bias shape {:?} incompatible with attention scores {:?}",
            bias.dim(),
            scores.dim()
        );
        scores += &bias;
    }

    softmax_rows_inplace(scores.view_mut());
    Ok(scores.dot(&value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn uniform_scores_average_values() {
        let query = array![[0.0f32, 0.0]];
        let key = array![[1.0f32, 0.0], [0.0, 1.0]];
        let value = array![[2.0f32, 4.0], [4.0, 8.0]];

        let out = scaled_dot_product_attention(query.view(), key.view(), value.view(), None, 1.0)
            .expect("attention");
        assert_abs_diff_eq!(out[[0, 0]], 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(out[[0, 1]], 6.0, epsilon = 1e-6);
    }

    #[test]
    fn masked_keys_are_ignored() {
        let query = array![[1.0f32, 1.0]];
        let key = array![[1.0f32, 0.0], [0.0, 1.0]];
        let value = array![[1.0f32, 0.0], [0.0, 1.0]];
        let bias = array![[0.0f32, f32::NEG_INFINITY]];

        let out = scaled_dot_product_attention(
            query.view(),
            key.view(),
            value.view(),
            Some(bias.view()),
            1.0,
        )
        .expect("attention");
        assert_abs_diff_eq!(out[[0, 0]], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(out[[0, 1]], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn rejects_mismatched_bias() {
        let query = array![[1.0f32, 1.0]];
        let key = array![[1.0f32, 0.0], [0.0, 1.0]];
        let bias = array![[0.0f32, 0.0, 0.0]];
        let err = scaled_dot_product_attention(
            query.view(),
            key.view(),
            key.view(),
            Some(bias.view()),
            1.0,
        );
        assert!(err.is_err());
    }
}
