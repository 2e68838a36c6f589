pub mod manager;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod scheduler;
pub mod utils;

use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use model::StableDiffusionVersion;
use orchestrator::{ImageSize, StylePreset};
use thiserror::Error;
use tracing_chrome::{ChromeLayerBuilder, FlushGuard};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub use manager::{ImageModel, Loader, ModelManager, ModelStatus};
pub use orchestrator::{BatchOutcome, GeneratedImage, GenerationRequest, Orchestrator};

pub const DEFAULT_MODEL_DIR: &str = "models/lcm_dreamshaper/model_files";
pub const DEFAULT_OUTPUT_DIR: &str = "output";

#[derive(Error, Debug)]
pub enum ImagenError {
    #[error("missing model files under {}: {}. Run `imagen fetch` first", root.display(), missing.join(", "))]
    MissingArtifacts {
        root: PathBuf,
        missing: Vec<&'static str>,
    },
    #[error("{0}")]
    InvalidRequest(String),
    #[error("failed to generate image {index}: {reason}")]
    Generation { index: usize, reason: String },
    #[error("failed to load model: {0}")]
    Load(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Parser)]
#[command(author, version, about = "Text-to-image generation over a local diffusion model", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Directory holding the diffusers-format model files.
    #[arg(long, global = true, env = "IMAGEN_MODEL_DIR", default_value = DEFAULT_MODEL_DIR)]
    pub model_dir: PathBuf,

    #[arg(long, global = true, value_enum, default_value = "v1-5")]
    pub sd_version: StableDiffusionVersion,

    /// Run on CPU rather than on GPU.
    #[arg(long, global = true)]
    pub cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long, global = true)]
    pub tracing: bool,

    /// Plain-text log file, in addition to stderr.
    #[arg(long, global = true, default_value = "debug.log")]
    pub log_file: PathBuf,

    /// Only log to stderr.
    #[arg(long, global = true)]
    pub no_log_file: bool,

    /// The size of the sliced attention or 0 for automatic slicing (disabled by default)
    #[arg(long, global = true)]
    pub sliced_attention_size: Option<usize>,

    /// Use flash attention in the unet, needs the `flash-attn` feature.
    #[arg(long, global = true)]
    pub use_flash_attn: bool,
}

impl Cli {
    pub fn log_file(&self) -> Option<&Path> {
        (!self.no_log_file).then_some(self.log_file.as_path())
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Generate a batch of images from a prompt.
    Generate(GenerateArgs),
    /// Check that every required model file is present.
    Verify,
    /// Download the model files from the Hugging Face hub.
    Fetch {
        /// Override the hub repository the weights are pulled from.
        #[arg(long)]
        repo: Option<String>,
    },
    /// List style presets and example prompts.
    Presets,
}

#[derive(Args, Clone, Debug)]
pub struct GenerateArgs {
    /// The prompt to be used for image generation.
    #[arg(long)]
    pub prompt: String,

    /// Quality dial, 1 is fastest and 10 is best.
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u8).range(1..=10))]
    pub quality: u8,

    #[arg(long, default_value = "512x512")]
    pub size: ImageSize,

    /// Classifier-free guidance scale, between 0.5 and 2.0.
    #[arg(long, default_value_t = 1.0, value_parser = parse_guidance_scale)]
    pub guidance_scale: f64,

    /// Seed for the noise generator, -1 for random.
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub seed: i64,

    /// Number of images to generate.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=4))]
    pub batch_count: u8,

    /// Quick-insert a style preset into the prompt.
    #[arg(long, value_enum)]
    pub style: Option<StylePreset>,

    #[arg(long, env = "IMAGEN_OUTPUT_DIR", default_value = DEFAULT_OUTPUT_DIR)]
    pub output_dir: PathBuf,
}

pub const GUIDANCE_SCALE_RANGE: std::ops::RangeInclusive<f64> = 0.5..=2.0;

fn parse_guidance_scale(s: &str) -> Result<f64, String> {
    let scale: f64 = s.parse().map_err(|_| format!("`{s}` is not a number"))?;
    if !GUIDANCE_SCALE_RANGE.contains(&scale) {
        return Err(format!(
            "{scale} is not in {}..={}",
            GUIDANCE_SCALE_RANGE.start(),
            GUIDANCE_SCALE_RANGE.end()
        ));
    }
    Ok(scale)
}

impl GenerateArgs {
    pub fn request(&self) -> GenerationRequest {
        let prompt = match self.style {
            Some(style) => style.insert_into(&self.prompt),
            None => self.prompt.clone(),
        };
        GenerationRequest {
            prompt,
            quality: self.quality,
            size: self.size,
            guidance_scale: self.guidance_scale,
            seed: self.seed,
            batch_count: self.batch_count,
        }
    }
}

/// Installs the global subscriber. The returned guard flushes the chrome
/// trace on drop and must outlive every traced call.
pub fn init_logging(log_file: Option<&Path>, chrome: bool) -> Result<Option<FlushGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    let (chrome_layer, guard) = if chrome {
        let (layer, guard) = ChromeLayerBuilder::new().build();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(chrome_layer)
        .init();

    Ok(guard)
}
