//! Image-anchored text-to-video pipeline
//!
//! Composes the stages end to end:
//!
//! ```text
//! prompt ──► ConditioningEncoder ─┐
//! image  ──► NoiseImageBlender ───┴─► SamplerDriver ─► decode_latents ─► tensor_to_frames ─► VideoWriter
//! ```
//!
//! Multi-prompt chaining runs one segment per prompt line; each segment after
//! the first is anchored on the previous segment's final frame.

use std::path::{Path, PathBuf};
use std::time::Instant;

use image::RgbImage;
use tracing::info;

use crate::blend::{NoiseImageBlender, load_seed_image, resize_seed_image};
use crate::conditioning::ConditioningEncoder;
use crate::config::{ComputeConfig, ConfigError, DiffusionConfig, GenerationConfig};
use crate::encode_ffmpeg::write_video;
use crate::error::Result;
use crate::latents_bin::save_latents;
use crate::model::{Denoiser, LatentDecoder, TextEmbedder};
use crate::postprocess::{ChannelOrder, tensor_to_frames};
use crate::sampler::{CancellationToken, SamplerDriver, StepInfo};
use crate::utils::Pcg32;
use crate::vae::decode_latents;

/// One call's worth of user-facing parameters
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub image_path: PathBuf,
    pub output_path: PathBuf,
    pub frame_count: usize,
    pub initial_alpha: f64,
    pub decay_ratio: f64,
    pub fps: u32,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        let defaults = GenerationConfig::default();
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            image_path: PathBuf::new(),
            output_path: PathBuf::from("output.webm"),
            frame_count: defaults.frame_count,
            initial_alpha: defaults.initial_alpha,
            decay_ratio: defaults.decay_ratio,
            fps: defaults.fps,
        }
    }
}

impl GenerationRequest {
    pub fn new(
        prompt: impl Into<String>,
        image_path: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            image_path: image_path.into(),
            output_path: output_path.into(),
            ..Self::default()
        }
    }

    pub fn with_negative_prompt(mut self, negative: impl Into<String>) -> Self {
        self.negative_prompt = negative.into();
        self
    }

    pub fn with_frames(mut self, frame_count: usize) -> Self {
        self.frame_count = frame_count;
        self
    }

    pub fn with_blend(mut self, initial_alpha: f64, decay_ratio: f64) -> Self {
        self.initial_alpha = initial_alpha;
        self.decay_ratio = decay_ratio;
        self
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    /// Non-blank prompt lines, trimmed
    pub fn prompt_lines(&self) -> Vec<String> {
        self.prompt
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// One generated segment of a (possibly chained) run
#[derive(Debug, Clone)]
pub struct Segment {
    pub prompt: String,
    /// Image the segment was anchored on, before resizing to latent size
    pub seed: RgbImage,
    pub frames: Vec<RgbImage>,
}

#[derive(Debug, Clone)]
pub struct GenerationReport {
    pub output_path: PathBuf,
    pub frame_count: usize,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub segments: usize,
    pub elapsed_secs: f64,
}

type StepCallback = Box<dyn FnMut(StepInfo) + Send>;

pub struct VideoPipeline<D, T, V>
where
    D: Denoiser,
    T: TextEmbedder,
    V: LatentDecoder,
{
    denoiser: D,
    conditioning: ConditioningEncoder<T>,
    decoder: V,
    diffusion: DiffusionConfig,
    generation: GenerationConfig,
    compute: ComputeConfig,
    channel_order: ChannelOrder,
    cancel: CancellationToken,
    latents_dump: Option<PathBuf>,
    on_step: Option<StepCallback>,
}

impl<D, T, V> VideoPipeline<D, T, V>
where
    D: Denoiser,
    T: TextEmbedder,
    V: LatentDecoder,
{
    pub fn new(
        denoiser: D,
        text_embedder: T,
        decoder: V,
        diffusion: DiffusionConfig,
        generation: GenerationConfig,
        compute: ComputeConfig,
    ) -> Result<Self> {
        generation.validate()?;
        Ok(Self {
            denoiser,
            conditioning: ConditioningEncoder::new(text_embedder),
            decoder,
            diffusion,
            generation,
            compute,
            channel_order: ChannelOrder::default(),
            cancel: CancellationToken::new(),
            latents_dump: None,
            on_step: None,
        })
    }

    pub fn with_channel_order(mut self, order: ChannelOrder) -> Self {
        self.channel_order = order;
        self
    }

    /// Dump final latents of every segment next to `path`
    pub fn with_latents_dump(mut self, path: impl Into<PathBuf>) -> Self {
        self.latents_dump = Some(path.into());
        self
    }

    pub fn with_progress(mut self, callback: impl FnMut(StepInfo) + Send + 'static) -> Self {
        self.on_step = Some(Box::new(callback));
        self
    }

    /// Token that aborts the running sampling loop between steps
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn generation_config(&self) -> &GenerationConfig {
        &self.generation
    }

    pub fn denoiser(&self) -> &D {
        &self.denoiser
    }

    pub fn conditioning(&self) -> &ConditioningEncoder<T> {
        &self.conditioning
    }

    /// Request parameters layered over the pipeline's configuration
    fn request_config(&self, request: &GenerationRequest) -> Result<GenerationConfig> {
        let config = self
            .generation
            .clone()
            .with_frames(request.frame_count)
            .with_blend(request.initial_alpha, request.decay_ratio)
            .with_fps(request.fps);
        config.validate()?;
        Ok(config)
    }

    /// Generate one segment's frames anchored on `seed_image`
    pub fn generate_frames(
        &mut self,
        prompt: &str,
        negative_prompt: &str,
        seed_image: &RgbImage,
        config: &GenerationConfig,
        rng: &mut Pcg32,
        segment: usize,
    ) -> Result<Vec<RgbImage>> {
        let device = self.compute.device.clone();
        let anchor = resize_seed_image(seed_image, config.latent_width, config.latent_height);

        let embeddings = self.conditioning.encode(prompt, negative_prompt)?;
        let latents = NoiseImageBlender::from_config(config).blend(&anchor, rng, &device)?;

        let sampler = SamplerDriver::new(
            self.diffusion.clone(),
            config.num_inference_steps,
            config.guidance_scale,
        )?
        .with_guidance_mode(config.guidance_mode)
        .with_compute_dtype(self.compute.dtype())
        .with_cancellation(self.cancel.clone());

        let on_step = &mut self.on_step;
        let mut progress = |step: StepInfo| {
            if let Some(callback) = on_step.as_mut() {
                callback(step);
            }
        };
        let latents =
            sampler.sample(&mut self.denoiser, latents, &embeddings, Some(&mut progress))?;

        if let Some(path) = &self.latents_dump {
            let path = segment_path(path, segment);
            save_latents(&path, &latents)?;
            info!(path = %path.display(), "Saved final latents");
        }

        let pixels = decode_latents(
            &self.decoder,
            &latents,
            config.scale_factor,
            config.decode_chunk_size,
        )?;
        tensor_to_frames(&pixels)
    }

    /// Run one segment per prompt, chaining each on the previous final frame.
    pub fn generate_segments(
        &mut self,
        prompts: &[String],
        negative_prompt: &str,
        seed_image: &RgbImage,
        config: &GenerationConfig,
    ) -> Result<Vec<Segment>> {
        if prompts.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "prompt",
                reason: "no non-empty prompt lines".to_string(),
            }
            .into());
        }

        let mut rng = Pcg32::seeded(config.seed);
        let mut segments: Vec<Segment> = Vec::with_capacity(prompts.len());
        for (index, prompt) in prompts.iter().enumerate() {
            let seed = match segments.last().and_then(|s| s.frames.last()) {
                Some(last) => last.clone(),
                None => seed_image.clone(),
            };
            info!(
                segment = index + 1,
                total = prompts.len(),
                prompt = %prompt,
                "Generating segment"
            );
            let frames =
                self.generate_frames(prompt, negative_prompt, &seed, config, &mut rng, index)?;
            segments.push(Segment {
                prompt: prompt.clone(),
                seed,
                frames,
            });
        }
        Ok(segments)
    }

    /// Generate a single-prompt video and write it to `request.output_path`
    pub fn generate(&mut self, request: &GenerationRequest) -> Result<GenerationReport> {
        let prompt = request.prompt.trim().to_string();
        self.run(request, std::slice::from_ref(&prompt))
    }

    /// Treat `request.prompt` as newline-delimited prompts and chain them
    pub fn generate_chained(&mut self, request: &GenerationRequest) -> Result<GenerationReport> {
        let prompts = request.prompt_lines();
        self.run(request, &prompts)
    }

    fn run(&mut self, request: &GenerationRequest, prompts: &[String]) -> Result<GenerationReport> {
        let started = Instant::now();
        let config = self.request_config(request)?;
        let image =
            load_seed_image(&request.image_path, config.latent_width, config.latent_height)?;

        let segments =
            self.generate_segments(prompts, &request.negative_prompt, &image, &config)?;
        let frames: Vec<RgbImage> = segments.into_iter().flat_map(|s| s.frames).collect();
        let (width, height) = frames
            .first()
            .map(|f| (f.width(), f.height()))
            .unwrap_or_default();

        info!(
            path = %request.output_path.display(),
            frames = frames.len(),
            fps = config.fps,
            "Writing video"
        );
        write_video(&request.output_path, &frames, config.fps, self.channel_order)?;

        let report = GenerationReport {
            output_path: request.output_path.clone(),
            frame_count: frames.len(),
            width,
            height,
            fps: config.fps,
            segments: prompts.len(),
            elapsed_secs: started.elapsed().as_secs_f64(),
        };
        info!(
            frames = report.frame_count,
            elapsed_secs = report.elapsed_secs,
            "Generation complete"
        );
        Ok(report)
    }
}

/// `latents.bin` for segment 0, `latents_1.bin` for segment 1, ...
fn segment_path(path: &Path, segment: usize) -> PathBuf {
    if segment == 0 {
        return path.to_path_buf();
    }
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("latents");
    let name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}_{segment}.{ext}"),
        None => format!("{stem}_{segment}"),
    };
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_lines_skip_blanks() {
        let request = GenerationRequest::new("a cat\n\n  \n a dog \n", "in.png", "out.webm");
        assert_eq!(request.prompt_lines(), vec!["a cat", "a dog"]);
    }

    #[test]
    fn test_segment_path() {
        let p = Path::new("/tmp/out/latents.bin");
        assert_eq!(segment_path(p, 0), PathBuf::from("/tmp/out/latents.bin"));
        assert_eq!(segment_path(p, 2), PathBuf::from("/tmp/out/latents_2.bin"));
    }
}
