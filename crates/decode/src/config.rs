//! Generation, sampling and reference-model configuration.

use crate::error::{DecodeError, DecodeResult};
use crate::sampler::{GreedySampler, NucleusSampler, Sampler};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Token selection settings.
///
/// `temperature` and `top_p` only matter when `do_sample` is set; they are
/// validated in that case only, so greedy decoding accepts any value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub do_sample: bool,
    /// Seed for the nucleus sampler's random source; a fresh seed is drawn when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_p: 0.9,
            do_sample: false,
            seed: None,
        }
    }
}

impl SamplingConfig {
    pub fn greedy() -> Self {
        Self::default()
    }

    pub fn nucleus(temperature: f32, top_p: f32) -> Self {
        Self {
            temperature,
            top_p,
            do_sample: true,
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> DecodeResult<()> {
        if !self.do_sample {
            return Ok(());
        }
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(DecodeError::config(format!(
                "temperature must be a positive finite number, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(DecodeError::config(format!(
                "top_p must lie in (0, 1], got {}",
                self.top_p
            )));
        }
        Ok(())
    }

    /// Build the sampler selected by `do_sample`.
    pub fn build_sampler(&self) -> DecodeResult<Box<dyn Sampler>> {
        self.validate()?;
        if !self.do_sample {
            return Ok(Box::new(GreedySampler));
        }
        let rng = match self.seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        Ok(Box::new(NucleusSampler::new(self.top_p, self.temperature, rng)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    pub sampling: SamplingConfig,
    pub eos_token_id: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 100,
            sampling: SamplingConfig::default(),
            eos_token_id: 1,
        }
    }
}

/// Geometry of the reference decoder and its patch-embedding image encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub intermediate_size: usize,
    pub max_seq_len: usize,
    pub rope_theta: f32,
    pub rms_norm_eps: f32,
    pub image_size: usize,
    pub patch_size: usize,
    pub image_token_id: u32,
}

impl ReferenceConfig {
    /// Tiny config for tests and the random-weight demo
    pub fn tiny() -> Self {
        Self {
            vocab_size: 256,
            hidden_size: 64,
            n_layers: 2,
            n_heads: 4,
            intermediate_size: 128,
            max_seq_len: 192,
            rope_theta: 10000.0,
            rms_norm_eps: 1e-6,
            image_size: 32,
            patch_size: 8,
            image_token_id: 4,
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let blob = fs::read_to_string(path)
            .with_context(|| format!("failed to read model config {}", path.display()))?;
        let config: Self = serde_json::from_str(&blob)
            .with_context(|| format!("failed to parse model config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DecodeResult<()> {
        if self.n_heads == 0 || self.hidden_size % self.n_heads != 0 {
            return Err(DecodeError::config(format!(
                "hidden_size {} is not divisible by n_heads {}",
                self.hidden_size, self.n_heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(DecodeError::config(format!(
                "head_dim {} must be even for rotary embeddings",
                self.head_dim()
            )));
        }
        if self.patch_size == 0 || self.image_size % self.patch_size != 0 {
            return Err(DecodeError::config(format!(
                "image_size {} is not divisible by patch_size {}",
                self.image_size, self.patch_size
            )));
        }
        if self.image_token_id as usize >= self.vocab_size {
            return Err(DecodeError::config(format!(
                "image_token_id {} outside vocabulary of {}",
                self.image_token_id, self.vocab_size
            )));
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.n_heads
    }

    pub fn num_image_tokens(&self) -> usize {
        let per_side = self.image_size / self.patch_size;
        per_side * per_side
    }

    /// Flattened length of one RGB patch.
    pub fn patch_dim(&self) -> usize {
        3 * self.patch_size * self.patch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_cli_surface() {
        let config = GenerationConfig::default();
        assert_eq!(config.max_new_tokens, 100);
        assert_eq!(config.sampling.temperature, 0.8);
        assert_eq!(config.sampling.top_p, 0.9);
        assert!(!config.sampling.do_sample);
    }

    #[test]
    fn nucleus_rejects_bad_parameters() {
        assert!(SamplingConfig::nucleus(0.0, 0.9).validate().is_err());
        assert!(SamplingConfig::nucleus(1.0, 0.0).validate().is_err());
        assert!(SamplingConfig::nucleus(1.0, 1.5).validate().is_err());
        assert!(SamplingConfig::nucleus(1.0, f32::NAN).validate().is_err());
        assert!(SamplingConfig::nucleus(0.5, 1.0).validate().is_ok());
    }

    #[test]
    fn greedy_ignores_temperature() {
        let config = SamplingConfig {
            temperature: 0.0,
            ..SamplingConfig::greedy()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.build_sampler().expect("sampler").name(), "greedy");
    }

    #[test]
    fn tiny_config_geometry() {
        let config = ReferenceConfig::tiny();
        config.validate().expect("valid");
        assert_eq!(config.head_dim(), 16);
        assert_eq!(config.num_image_tokens(), 16);
        assert_eq!(config.patch_dim(), 192);
    }

    #[test]
    fn reference_config_json_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        let config = ReferenceConfig::tiny();
        fs::write(&path, serde_json::to_string_pretty(&config).expect("json")).expect("write");

        let loaded = ReferenceConfig::from_json_file(&path).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn sampling_config_seed_is_optional_in_json() {
        let parsed: SamplingConfig =
            serde_json::from_str(r#"{"temperature":0.7,"top_p":0.95,"do_sample":true}"#)
                .expect("parse");
        assert_eq!(parsed.seed, None);
        assert!(parsed.do_sample);
    }
}
