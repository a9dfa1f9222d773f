//! Reference-model weights and their safetensors (de)serialization.

use crate::config::ReferenceConfig;
use anyhow::{ensure, Context, Result};
use ndarray::{Array1, Array2};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct DecoderWeights {
    // Attention
    pub q_proj: Array2<f32>,
    pub k_proj: Array2<f32>,
    pub v_proj: Array2<f32>,
    pub o_proj: Array2<f32>,

    // RMSNorm (pre-attention)
    pub input_norm: Array1<f32>,

    // MLP
    pub mlp_up: Array2<f32>,
    pub mlp_down: Array2<f32>,

    // RMSNorm (pre-MLP)
    pub post_attention_norm: Array1<f32>,
}

#[derive(Debug, Clone)]
pub struct ModelWeights {
    pub token_embeddings: Array2<f32>, // (vocab_size, hidden)
    pub patch_embedding: Array2<f32>,  // (3 * patch * patch, hidden)
    pub layers: Vec<DecoderWeights>,
    pub final_norm: Array1<f32>,
    pub lm_head: Array2<f32>, // (hidden, vocab_size)
}

impl ModelWeights {
    /// Load weights from safetensors.
    /// Expected tensor naming: `layers.{i}.{component}`, all F32.
    pub fn load_safetensors(path: impl AsRef<Path>, config: &ReferenceConfig) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)
            .with_context(|| format!("failed to read safetensors file {}", path.display()))?;
        let tensors = SafeTensors::deserialize(&data).context("failed to parse safetensors")?;

        let mut layers = Vec::with_capacity(config.n_layers);
        for i in 0..config.n_layers {
            let prefix = format!("layers.{}", i);
            layers.push(DecoderWeights {
                q_proj: load_tensor_2d(&tensors, &format!("{}.q_proj", prefix))?,
                k_proj: load_tensor_2d(&tensors, &format!("{}.k_proj", prefix))?,
                v_proj: load_tensor_2d(&tensors, &format!("{}.v_proj", prefix))?,
                o_proj: load_tensor_2d(&tensors, &format!("{}.o_proj", prefix))?,
                input_norm: load_tensor_1d(&tensors, &format!("{}.input_norm", prefix))?,
                mlp_up: load_tensor_2d(&tensors, &format!("{}.mlp_up", prefix))?,
                mlp_down: load_tensor_2d(&tensors, &format!("{}.mlp_down", prefix))?,
                post_attention_norm: load_tensor_1d(
                    &tensors,
                    &format!("{}.post_attention_norm", prefix),
                )?,
            });
        }

        let weights = Self {
            token_embeddings: load_tensor_2d(&tensors, "token_embeddings")?,
            patch_embedding: load_tensor_2d(&tensors, "patch_embedding")?,
            layers,
            final_norm: load_tensor_1d(&tensors, "final_norm")?,
            lm_head: load_tensor_2d(&tensors, "lm_head")?,
        };
        weights.check_shapes(config)?;
        Ok(weights)
    }

    pub fn save_safetensors(&self, path: impl AsRef<Path>) -> Result<()> {
        let entries = self.named_tensors();
        let views = entries
            .iter()
            .map(|(name, shape, bytes)| {
                Ok((name.as_str(), TensorView::new(Dtype::F32, shape.clone(), bytes)?))
            })
            .collect::<Result<Vec<_>>>()?;
        let blob = safetensors::serialize(views, &None)?;
        fs::write(path, blob)?;
        Ok(())
    }

    /// Seeded random weights for tests and the demo (not for real inference)
    pub fn random(config: &ReferenceConfig, seed: u64) -> Self {
        let mut rng = fastrand::Rng::with_seed(seed);
        let mut random_array = |shape: (usize, usize)| {
            Array2::from_shape_fn(shape, |_| (rng.f32() - 0.5) * 0.04)
        };

        let d = config.hidden_size;
        let token_embeddings = random_array((config.vocab_size, d));
        let patch_embedding = random_array((config.patch_dim(), d));
        let lm_head = random_array((d, config.vocab_size));

        let mut layers = Vec::with_capacity(config.n_layers);
        for _ in 0..config.n_layers {
            layers.push(DecoderWeights {
                q_proj: random_array((d, d)),
                k_proj: random_array((d, d)),
                v_proj: random_array((d, d)),
                o_proj: random_array((d, d)),
                input_norm: Array1::zeros(d),
                mlp_up: random_array((d, config.intermediate_size)),
                mlp_down: random_array((config.intermediate_size, d)),
                post_attention_norm: Array1::zeros(d),
            });
        }

        Self {
            token_embeddings,
            patch_embedding,
            layers,
            final_norm: Array1::zeros(d),
            lm_head,
        }
    }

    pub fn check_shapes(&self, config: &ReferenceConfig) -> Result<()> {
        let d = config.hidden_size;
        let ff = config.intermediate_size;
        ensure!(
            self.token_embeddings.dim() == (config.vocab_size, d),
            "token_embeddings shape {:?} != ({}, {})",
            self.token_embeddings.dim(),
            config.vocab_size,
            d
        );
        ensure!(
            self.patch_embedding.dim() == (config.patch_dim(), d),
            "patch_embedding shape {:?} != ({}, {})",
            self.patch_embedding.dim(),
            config.patch_dim(),
            d
        );
        ensure!(
            self.lm_head.dim() == (d, config.vocab_size),
            "lm_head shape {:?} != ({}, {})",
            self.lm_head.dim(),
            d,
            config.vocab_size
        );
        ensure!(self.final_norm.len() == d, "final_norm length != {}", d);
        ensure!(
            self.layers.len() == config.n_layers,
            "expected {} layers, found {}",
            config.n_layers,
            self.layers.len()
        );
        for (i, layer) in self.layers.iter().enumerate() {
            for (name, shape, expected) in [
                ("q_proj", layer.q_proj.dim(), (d, d)),
                ("k_proj", layer.k_proj.dim(), (d, d)),
                ("v_proj", layer.v_proj.dim(), (d, d)),
                ("o_proj", layer.o_proj.dim(), (d, d)),
                ("mlp_up", layer.mlp_up.dim(), (d, ff)),
                ("mlp_down", layer.mlp_down.dim(), (ff, d)),
            ] {
                ensure!(
                    shape == expected,
                    "layers.{}.{} shape {:?} != {:?}",
                    i,
                    name,
                    shape,
                    expected
                );
            }
            ensure!(
                layer.input_norm.len() == d && layer.post_attention_norm.len() == d,
                "layers.{} norm weights must have length {}",
                i,
                d
            );
        }
        Ok(())
    }

    fn named_tensors(&self) -> Vec<(String, Vec<usize>, Vec<u8>)> {
        let mut out = vec![
            entry_2d("token_embeddings".into(), &self.token_embeddings),
            entry_2d("patch_embedding".into(), &self.patch_embedding),
            entry_1d("final_norm".into(), &self.final_norm),
            entry_2d("lm_head".into(), &self.lm_head),
        ];
        for (i, layer) in self.layers.iter().enumerate() {
            let prefix = format!("layers.{}", i);
            out.push(entry_2d(format!("{}.q_proj", prefix), &layer.q_proj));
            out.push(entry_2d(format!("{}.k_proj", prefix), &layer.k_proj));
            out.push(entry_2d(format!("{}.v_proj", prefix), &layer.v_proj));
            out.push(entry_2d(format!("{}.o_proj", prefix), &layer.o_proj));
            out.push(entry_1d(format!("{}.input_norm", prefix), &layer.input_norm));
            out.push(entry_2d(format!("{}.mlp_up", prefix), &layer.mlp_up));
            out.push(entry_2d(format!("{}.mlp_down", prefix), &layer.mlp_down));
            out.push(entry_1d(
                format!("{}.post_attention_norm", prefix),
                &layer.post_attention_norm,
            ));
        }
        out
    }
}

fn entry_2d(name: String, array: &Array2<f32>) -> (String, Vec<usize>, Vec<u8>) {
    let (rows, cols) = array.dim();
    (name, vec![rows, cols], to_le_bytes(array.iter()))
}

fn entry_1d(name: String, array: &Array1<f32>) -> (String, Vec<usize>, Vec<u8>) {
    (name, vec![array.len()], to_le_bytes(array.iter()))
}

fn to_le_bytes<'a>(values: impl Iterator<Item = &'a f32>) -> Vec<u8> {
    values.flat_map(|v| v.to_le_bytes()).collect()
}

fn load_f32(tensors: &SafeTensors<'_>, name: &str) -> Result<(Vec<usize>, Vec<f32>)> {
    let view = tensors
        .tensor(name)
        .with_context(|| format!("tensor '{}' not found", name))?;
    ensure!(
        view.dtype() == Dtype::F32,
        "tensor '{}' has dtype {:?}, expected F32",
        name,
        view.dtype()
    );

    let floats = view
        .data()
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    Ok((view.shape().to_vec(), floats))
}

fn load_tensor_2d(tensors: &SafeTensors<'_>, name: &str) -> Result<Array2<f32>> {
    let (shape, floats) = load_f32(tensors, name)?;
    ensure!(shape.len() == 2, "expected 2D tensor for {}", name);
    Array2::from_shape_vec((shape[0], shape[1]), floats).context("failed to reshape tensor")
}

fn load_tensor_1d(tensors: &SafeTensors<'_>, name: &str) -> Result<Array1<f32>> {
    let (shape, floats) = load_f32(tensors, name)?;
    ensure!(shape.len() == 1, "expected 1D tensor for {}", name);
    Ok(Array1::from(floats))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_weights_match_config() {
        let config = ReferenceConfig::tiny();
        let weights = ModelWeights::random(&config, 1);
        weights.check_shapes(&config).expect("shapes");
    }

    #[test]
    fn random_weights_are_seeded() {
        let config = ReferenceConfig::tiny();
        let a = ModelWeights::random(&config, 5);
        let b = ModelWeights::random(&config, 5);
        assert_eq!(a.lm_head, b.lm_head);
        assert_eq!(a.layers[1].q_proj, b.layers[1].q_proj);
    }

    #[test]
    fn safetensors_roundtrip() {
        let config = ReferenceConfig::tiny();
        let weights = ModelWeights::random(&config, 3);
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("model.safetensors");

        weights.save_safetensors(&path).expect("save");
        let loaded = ModelWeights::load_safetensors(&path, &config).expect("load");

        assert_eq!(loaded.token_embeddings, weights.token_embeddings);
        assert_eq!(loaded.layers[0].input_norm, weights.layers[0].input_norm);
        assert_eq!(loaded.layers[1].mlp_down, weights.layers[1].mlp_down);
    }

    #[test]
    fn load_rejects_mismatched_config() {
        let config = ReferenceConfig::tiny();
        let weights = ModelWeights::random(&config, 3);
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("model.safetensors");
        weights.save_safetensors(&path).expect("save");

        let wider = ReferenceConfig {
            hidden_size: 128,
            ..ReferenceConfig::tiny()
        };
        assert!(ModelWeights::load_safetensors(&path, &wider).is_err());
    }
}
