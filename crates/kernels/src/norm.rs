//! Normalization kernels.

use anyhow::{ensure, Result};
use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewMut2, Axis};
use rayon::prelude::*;

/// Gemma-style RMS norm: `x / rms(x) * (1 + weight)`, applied per row.
pub fn rms_norm_inplace(
    mut data: ArrayViewMut2<'_, f32>,
    weight: ArrayView1<'_, f32>,
    epsilon: f32,
) -> Result<()> {
    let feature_dim = data.len_of(Axis(1));
    ensure!(
        weight.len() == feature_dim,
        "weight length {} must equal feature dimension {}",
        weight.len(),
        feature_dim
    );
    let scale = weight.mapv(|w| 1.0 + w);
    let scale = scale.view();

    data.axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|mut row| {
            let mean_sq = row.iter().map(|x| x * x).sum::<f32>() / feature_dim as f32;
            let inv_rms = 1.0 / (mean_sq + epsilon).sqrt();
            row.zip_mut_with(&scale, |value, s| *value = *value * inv_rms * s);
        });

    Ok(())
}

/// Non-mutating RMS norm that returns a new array.
pub fn rms_norm(
    data: ArrayView2<'_, f32>,
    weight: ArrayView1<'_, f32>,
    epsilon: f32,
) -> Result<Array2<f32>> {
    let mut output = data.to_owned();
    rms_norm_inplace(output.view_mut(), weight, epsilon)?;
    Ok(output)
}
