//! Image-conditioned text generation for PaliGemma-style models.
//!
//! This crate implements the decode loop around a vision-language model:
//! - KV-cache threading across steps (prefill once, then one token per step)
//! - Greedy and nucleus (top-p) token selection with a seedable random source
//! - Stopping on the end-of-sequence token or a token budget
//! - A PaliGemma input processor and a small reference model for CPU runs

pub mod config;
pub mod decoder;
pub mod device;
pub mod error;
pub mod generation;
pub mod kv_cache;
pub mod mask;
pub mod model;
pub mod processor;
pub mod reference;
pub mod rope;
pub mod sampler;
pub mod tokenizer;
pub mod weights;

pub use config::{GenerationConfig, ReferenceConfig, SamplingConfig};
pub use device::Device;
pub use error::{DecodeError, DecodeResult};
pub use generation::{GenerationController, GenerationMetrics, GenerationOutput, StopReason};
pub use kv_cache::KVCache;
pub use mask::AttentionMask;
pub use model::{ForwardInput, ForwardOutput, ModelInputs, VisionLanguageModel};
pub use processor::{load_image, InputBuilder, PaliGemmaProcessor};
pub use reference::ReferenceModel;
pub use sampler::{GreedySampler, NucleusDistribution, NucleusSampler, Sampler};
pub use tokenizer::{Tokenizer, WordTokenizer};
pub use weights::ModelWeights;
