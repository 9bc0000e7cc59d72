//! Image-anchored text-to-video generation
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin sd-video -- \
//!     --prompt "A lighthouse in a storm" \
//!     --image seed.png \
//!     --model-dir ./text-to-video-ms-1.7b \
//!     --output output.webm
//! ```
//!
//! `--prompts-file` chains one segment per non-blank line, each anchored on the
//! previous segment's last frame. `--mock` runs the whole pipeline with
//! deterministic stand-in networks and needs no weights.

use anyhow::{Context, Result, bail};
use candle_core::Device;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

use sd_video::{
    ComputeConfig, DiffusionConfig, GenerationConfig, GenerationRequest, ModelDirectory,
    Precision, VideoPipeline,
    loader::VAE_UPSAMPLING,
    mock::{MockDecoder, MockDenoiser, MockTextEmbedder},
    model::{Denoiser, LatentDecoder, TextEmbedder},
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Generate a video from a text prompt anchored on a seed image"
)]
struct Args {
    /// Text prompt describing the video
    #[arg(short, long, conflicts_with = "prompts_file")]
    prompt: Option<String>,

    /// File with one prompt per line; segments are chained
    #[arg(long)]
    prompts_file: Option<PathBuf>,

    /// Negative prompt for classifier-free guidance
    #[arg(long, default_value = "")]
    negative_prompt: String,

    /// Seed image anchoring the first frames
    #[arg(short, long)]
    image: PathBuf,

    /// Output WebM file
    #[arg(short, long, default_value = "output.webm")]
    output: PathBuf,

    /// Model directory containing configuration.json and weights
    #[arg(short, long, required_unless_present = "mock")]
    model_dir: Option<PathBuf>,

    /// Frames per segment
    #[arg(long, default_value = "16")]
    frames: usize,

    /// Image weight on the first frame
    #[arg(long, default_value = "0.23")]
    alpha: f64,

    /// Per-frame decay of the image weight
    #[arg(long, default_value = "0.8")]
    ratio: f64,

    #[arg(long, default_value = "24")]
    fps: u32,

    /// Number of DDIM steps
    #[arg(long, default_value = "50")]
    steps: usize,

    #[arg(long, default_value = "9.0")]
    guidance_scale: f64,

    #[arg(long, default_value = "42")]
    seed: u64,

    /// Write blended-noise preview PNGs here
    #[arg(long)]
    preview_dir: Option<PathBuf>,

    /// Dump final latents to this file
    #[arg(long)]
    save_latents: Option<PathBuf>,

    /// Use CPU instead of CUDA
    #[arg(long)]
    cpu: bool,

    /// Use float16 precision
    #[arg(long, conflicts_with = "bf16")]
    f16: bool,

    /// Use bfloat16 precision
    #[arg(long)]
    bf16: bool,

    /// Run with deterministic stand-in networks (no weights needed)
    #[arg(long)]
    mock: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sd_video=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let device = if args.cpu || args.mock {
        Device::Cpu
    } else {
        match Device::cuda_if_available(0) {
            Ok(device) => device,
            Err(e) => {
                warn!("CUDA not available: {}, falling back to CPU", e);
                Device::Cpu
            }
        }
    };
    let precision = if args.f16 {
        Precision::F16
    } else if args.bf16 {
        Precision::BF16
    } else {
        Precision::F32
    };
    let compute = ComputeConfig { device, precision };

    let mut generation = GenerationConfig::default()
        .with_frames(args.frames)
        .with_blend(args.alpha, args.ratio)
        .with_fps(args.fps)
        .with_steps(args.steps)
        .with_guidance_scale(args.guidance_scale)
        .with_seed(args.seed);
    generation.preview_dir = args.preview_dir.clone();
    generation.validate().context("invalid generation settings")?;

    let (prompt, chained) = match (&args.prompt, &args.prompts_file) {
        (Some(prompt), None) => (prompt.clone(), false),
        (None, Some(path)) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read prompts file '{}'", path.display()))?;
            (text, true)
        }
        _ => bail!("exactly one of --prompt or --prompts-file is required"),
    };

    let request = GenerationRequest::new(prompt, &args.image, &args.output)
        .with_negative_prompt(args.negative_prompt.clone())
        .with_frames(args.frames)
        .with_blend(args.alpha, args.ratio)
        .with_fps(args.fps);

    info!(
        frames = args.frames,
        steps = args.steps,
        guidance_scale = args.guidance_scale,
        seed = args.seed,
        ?precision,
        mock = args.mock,
        "sd-video"
    );

    if args.mock {
        let pipeline = VideoPipeline::new(
            MockDenoiser::new(),
            MockTextEmbedder::new(77, 64, &compute.device),
            MockDecoder::new(VAE_UPSAMPLING),
            DiffusionConfig::default(),
            generation,
            compute,
        )?;
        return run(pipeline, &request, chained, args.save_latents);
    }

    let model_dir = args
        .model_dir
        .as_ref()
        .context("--model-dir is required unless --mock is set")?;
    let directory = ModelDirectory::open(model_dir)
        .with_context(|| format!("failed to open model directory '{}'", model_dir.display()))?;
    let models = directory
        .load(&compute, &generation)
        .context("failed to load models")?;
    let pipeline = VideoPipeline::new(
        models.denoiser,
        models.text_embedder,
        models.decoder,
        directory.config().diffusion(),
        generation,
        compute,
    )?;
    run(pipeline, &request, chained, args.save_latents)
}

fn run<D, T, V>(
    pipeline: VideoPipeline<D, T, V>,
    request: &GenerationRequest,
    chained: bool,
    save_latents: Option<PathBuf>,
) -> Result<()>
where
    D: Denoiser,
    T: TextEmbedder,
    V: LatentDecoder,
{
    let mut pipeline = pipeline.with_progress(|step| {
        if (step.index + 1) % 10 == 0 || step.index + 1 == step.total {
            info!("Step {}/{} (t={})", step.index + 1, step.total, step.timestep);
        }
    });
    if let Some(path) = save_latents {
        pipeline = pipeline.with_latents_dump(path);
    }

    let report = if chained {
        pipeline.generate_chained(request)
    } else {
        pipeline.generate(request)
    }
    .context("generation failed")?;

    info!(
        "Wrote {} frames ({}x{} @ {} fps, {} segment(s)) to {} in {:.1}s",
        report.frame_count,
        report.width,
        report.height,
        report.fps,
        report.segments,
        report.output_path.display(),
        report.elapsed_secs
    );
    Ok(())
}
