//! CLI wiring for the `paligemma` binary.

use anyhow::{Context, Result};
use clap::Parser;
use paligemma_decode::reference::VOCAB_FILE;
use paligemma_decode::{
    load_image, Device, GenerationConfig, GenerationController, InputBuilder, PaliGemmaProcessor,
    ReferenceConfig, ReferenceModel, SamplingConfig, Tokenizer, WordTokenizer,
};
use std::path::{Path, PathBuf};
use tracing::info;

/// Seed for the random-weight model used when no model directory is given.
const DEMO_WEIGHTS_SEED: u64 = 0x5eed;

#[derive(Parser, Debug)]
#[command(name = "paligemma", about = "Describe an image with a PaliGemma-style model")]
pub struct Cli {
    /// Directory with config.json, model.safetensors and optionally vocab.json.
    /// Without it a tiny randomly initialised model is used.
    #[arg(long)]
    pub model_path: Option<PathBuf>,

    #[arg(long)]
    pub prompt: String,

    #[arg(long)]
    pub image_file_path: PathBuf,

    #[arg(long, default_value_t = 100)]
    pub max_tokens_to_generate: usize,

    #[arg(long, default_value_t = 0.8)]
    pub temperature: f32,

    #[arg(long, default_value_t = 0.9)]
    pub top_p: f32,

    #[arg(long, default_value_t = false)]
    pub do_sample: bool,

    #[arg(long, default_value_t = false)]
    pub only_cpu: bool,

    /// Seed for nucleus sampling; random when omitted.
    #[arg(long)]
    pub seed: Option<u64>,
}

impl Cli {
    fn generation_config(&self, eos_token_id: u32) -> GenerationConfig {
        GenerationConfig {
            max_new_tokens: self.max_tokens_to_generate,
            sampling: SamplingConfig {
                temperature: self.temperature,
                top_p: self.top_p,
                do_sample: self.do_sample,
                seed: self.seed,
            },
            eos_token_id,
        }
    }
}

pub fn run_cli(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let device = Device::select(cli.only_cpu, ReferenceModel::SUPPORTED_DEVICES);
    println!("Device in use: {}", device);

    println!("Loading model");
    let (model, tokenizer) = load_model(cli.model_path.as_deref(), device)?;
    let config = model.config();
    let processor = PaliGemmaProcessor::new(
        tokenizer,
        config.num_image_tokens(),
        config.image_size as u32,
        device,
    );

    let image = load_image(&cli.image_file_path)
        .with_context(|| format!("failed to open image {}", cli.image_file_path.display()))?;
    let inputs = processor.prepare(&cli.prompt, &image)?;

    println!("Running inference");
    let generation = cli.generation_config(processor.tokenizer().eos_token_id());
    let controller = GenerationController::new(&model, device, generation);
    let output = controller.generate(inputs)?;

    info!(
        tokens = output.tokens.len(),
        stop_reason = ?output.stop_reason,
        prefill_ms = output.metrics.prefill_ms,
        tokens_per_sec = output.metrics.tokens_per_sec,
        "inference completed"
    );

    let decoded = processor.tokenizer().decode(&output.tokens, true);
    println!("{}{}", cli.prompt, decoded);
    Ok(())
}

fn load_model(model_path: Option<&Path>, device: Device) -> Result<(ReferenceModel, WordTokenizer)> {
    match model_path {
        Some(dir) => {
            let model = ReferenceModel::load(dir, device)?;
            let vocab_size = model.config().vocab_size;
            let vocab_path = dir.join(VOCAB_FILE);
            let tokenizer = if vocab_path.exists() {
                WordTokenizer::from_vocab_file(&vocab_path, vocab_size)?
            } else {
                WordTokenizer::new(vocab_size)
            };
            info!(path = %dir.display(), "model loaded");
            Ok((model, tokenizer))
        }
        None => {
            let config = ReferenceConfig::tiny();
            info!(
                layers = config.n_layers,
                hidden = config.hidden_size,
                "no model path given, using random reference weights"
            );
            let tokenizer = WordTokenizer::new(config.vocab_size);
            let model = ReferenceModel::random(config, DEMO_WEIGHTS_SEED, device)?;
            Ok((model, tokenizer))
        }
    }
}
