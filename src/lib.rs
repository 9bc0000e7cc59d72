//! sd-video: image-anchored text-to-video diffusion sampling on Candle.
//!
//! A seed image is blended with noise into a latent video whose image weight
//! decays frame by frame, denoised with classifier-free guided DDIM, decoded
//! frame-wise and written to WebM through ffmpeg.

pub mod blend;
pub mod conditioning;
pub mod config;
pub mod encode_ffmpeg;
pub mod error;
pub mod latents_bin;
pub mod loader;
pub mod mock;
pub mod model;
pub mod pipeline;
pub mod postprocess;
pub mod sampler;
pub mod scheduler;
pub mod text_encoder;
pub mod unet;
pub mod utils;
pub mod vae;

pub use blend::{NoiseImageBlender, blend_schedule, load_seed_image};
pub use conditioning::{ConditioningEncoder, PromptEmbeddings};
pub use config::{
    ComputeConfig, ConfigError, DiffusionConfig, GenerationConfig, GuidanceMode, ModelConfig,
    Precision, PredictionType,
};
pub use encode_ffmpeg::{EncodeError, VideoWriter, VideoWriterConfig, write_video};
pub use error::{Result, SdVideoError};
pub use loader::{LoaderError, ModelDirectory};
pub use model::{Denoiser, LatentDecoder, TextEmbedder};
pub use pipeline::{GenerationReport, GenerationRequest, Segment, VideoPipeline};
pub use postprocess::{ChannelOrder, tensor_to_frames};
pub use sampler::{CancellationToken, SamplerDriver, StepInfo, apply_guidance};
pub use scheduler::DdimScheduler;
pub use vae::decode_latents;
