//! Configuration structures for the video sampling pipeline
//!
//! Three groups of settings live here:
//! - [`ModelConfig`]: the model directory's `configuration.json`
//! - [`DiffusionConfig`]: the noise schedule the denoiser was trained with
//! - [`GenerationConfig`] / [`ComputeConfig`]: per-run and per-device knobs

use candle_core::{DType, Device};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;

// =============================================================================
// Model directory configuration (configuration.json)
// =============================================================================

/// Top-level `configuration.json` document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: ModelSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    pub model_cfg: ModelHyperParams,
    pub model_args: ModelArgs,
}

/// Architecture hyperparameters of the denoising network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelHyperParams {
    /// Latent channels fed to the denoiser (4)
    pub unet_in_dim: usize,
    /// Base channel width
    pub unet_dim: usize,
    /// Image-embedding width (unused by text conditioning)
    #[serde(default)]
    pub unet_y_dim: usize,
    /// Text context width (1024 for OpenCLIP ViT-H)
    pub unet_context_dim: usize,
    /// Predicted channels (4)
    pub unet_out_dim: usize,
    #[serde(default)]
    pub unet_dim_mult: Vec<usize>,
    #[serde(default)]
    pub unet_num_heads: usize,
    #[serde(default)]
    pub unet_head_dim: usize,
    #[serde(default)]
    pub unet_res_blocks: usize,
    #[serde(default)]
    pub unet_attn_scales: Vec<f64>,
    #[serde(default)]
    pub unet_dropout: f64,
    /// Written as `"True"`/`"False"` by some exporters
    #[serde(default, deserialize_with = "bool_or_string")]
    pub temporal_attention: bool,
    #[serde(default = "default_num_timesteps")]
    pub num_timesteps: usize,
    #[serde(default = "default_mean_type")]
    pub mean_type: PredictionType,
    #[serde(default)]
    pub var_type: Option<String>,
    #[serde(default)]
    pub loss_type: Option<String>,
}

/// Weight file names, relative to the model directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArgs {
    pub ckpt_unet: String,
    pub ckpt_autoencoder: String,
    pub ckpt_clip: String,
    #[serde(default = "default_tokenizer_file")]
    pub ckpt_tokenizer: String,
}

fn default_num_timesteps() -> usize {
    1000
}

fn default_mean_type() -> PredictionType {
    PredictionType::Epsilon
}

fn default_tokenizer_file() -> String {
    "tokenizer.json".to_string()
}

fn bool_or_string<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrString {
        Bool(bool),
        Str(String),
    }

    match BoolOrString::deserialize(deserializer)? {
        BoolOrString::Bool(b) => Ok(b),
        BoolOrString::Str(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" | "" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "expected a boolean, got {other:?}"
            ))),
        },
    }
}

impl ModelConfig {
    /// Check the hyperparameters against the network [`crate::loader`] builds.
    ///
    /// The denoiser is the SD 2.1 frame-wise 2D UNet, so every architecture
    /// field must describe that network. Zero or empty optional fields are
    /// taken as unspecified.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cfg = &self.model.model_cfg;
        if cfg.unet_in_dim != LATENT_CHANNELS || cfg.unet_out_dim != LATENT_CHANNELS {
            return Err(ConfigError::LatentChannels {
                in_dim: cfg.unet_in_dim,
                out_dim: cfg.unet_out_dim,
            });
        }
        if cfg.num_timesteps < 2 {
            return Err(ConfigError::InvalidValue {
                field: "num_timesteps",
                reason: format!("must be at least 2, got {}", cfg.num_timesteps),
            });
        }

        let unsupported = |field: &'static str, value: String, supported: String| {
            Err(ConfigError::UnsupportedArchitecture {
                field,
                value,
                supported,
            })
        };
        if cfg.temporal_attention {
            return unsupported(
                "temporal_attention",
                "true".to_string(),
                "false (frames are denoised independently)".to_string(),
            );
        }
        if cfg.unet_dim != UNET_BASE_DIM {
            return unsupported("unet_dim", cfg.unet_dim.to_string(), UNET_BASE_DIM.to_string());
        }
        if cfg.unet_context_dim != CONTEXT_DIM {
            return unsupported(
                "unet_context_dim",
                cfg.unet_context_dim.to_string(),
                CONTEXT_DIM.to_string(),
            );
        }
        if !cfg.unet_dim_mult.is_empty() && cfg.unet_dim_mult != UNET_DIM_MULT {
            return unsupported(
                "unet_dim_mult",
                format!("{:?}", cfg.unet_dim_mult),
                format!("{UNET_DIM_MULT:?}"),
            );
        }
        if cfg.unet_res_blocks != 0 && cfg.unet_res_blocks != UNET_RES_BLOCKS {
            return unsupported(
                "unet_res_blocks",
                cfg.unet_res_blocks.to_string(),
                UNET_RES_BLOCKS.to_string(),
            );
        }
        if cfg.unet_head_dim != 0 && cfg.unet_head_dim != UNET_HEAD_DIM {
            return unsupported(
                "unet_head_dim",
                cfg.unet_head_dim.to_string(),
                UNET_HEAD_DIM.to_string(),
            );
        }
        // Head counts vary per level (5, 10, 20, 20); only the head width is fixed
        if cfg.unet_num_heads != 0 {
            return unsupported(
                "unet_num_heads",
                cfg.unet_num_heads.to_string(),
                format!("unset (heads are {UNET_HEAD_DIM} wide at every level)"),
            );
        }
        if !cfg.unet_attn_scales.is_empty() && cfg.unet_attn_scales != UNET_ATTN_SCALES {
            return unsupported(
                "unet_attn_scales",
                format!("{:?}", cfg.unet_attn_scales),
                format!("{UNET_ATTN_SCALES:?}"),
            );
        }
        Ok(())
    }

    /// Noise schedule matching this model's training setup
    pub fn diffusion(&self) -> DiffusionConfig {
        DiffusionConfig {
            num_train_timesteps: self.model.model_cfg.num_timesteps,
            prediction_type: self.model.model_cfg.mean_type,
            ..DiffusionConfig::default()
        }
    }
}

/// Number of latent channels the denoiser operates on
pub const LATENT_CHANNELS: usize = 4;

/// Text context width of the OpenCLIP ViT-H encoder
pub const CONTEXT_DIM: usize = 1024;

// SD 2.1 UNet layout
pub const UNET_BASE_DIM: usize = 320;
pub const UNET_DIM_MULT: [usize; 4] = [1, 2, 4, 4];
pub const UNET_RES_BLOCKS: usize = 2;
pub const UNET_HEAD_DIM: usize = 64;
pub const UNET_ATTN_SCALES: [f64; 3] = [1.0, 0.5, 0.25];

// =============================================================================
// Diffusion schedule
// =============================================================================

/// What the denoiser predicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredictionType {
    #[serde(rename = "eps", alias = "epsilon")]
    Epsilon,
    #[serde(rename = "v", alias = "v_prediction")]
    VPrediction,
    #[serde(rename = "x0", alias = "sample")]
    Sample,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BetaSchedule {
    /// Linear in sqrt(beta) space (Stable Diffusion)
    #[serde(rename = "linear_sd", alias = "scaled_linear")]
    LinearSd,
    #[serde(rename = "linear")]
    Linear,
}

/// DDIM scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffusionConfig {
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    pub prediction_type: PredictionType,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::LinearSd,
            prediction_type: PredictionType::Epsilon,
        }
    }
}

// =============================================================================
// Per-run generation parameters
// =============================================================================

/// How the two guidance evaluations are issued to the denoiser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GuidanceMode {
    /// One forward pass over a batch of 2 (`[negative, positive]`)
    #[default]
    Batched,
    /// Two forward passes of batch 1, lower peak memory
    Sequential,
}

/// Generation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Frames per generated segment
    pub frame_count: usize,
    /// Image weight on the first frame
    pub initial_alpha: f64,
    /// Per-frame decay of the image weight
    pub decay_ratio: f64,
    pub fps: u32,
    pub guidance_scale: f64,
    pub num_inference_steps: usize,
    pub latent_height: usize,
    pub latent_width: usize,
    /// Decoder latent normalization, model specific
    pub scale_factor: f64,
    pub seed: u64,
    pub guidance_mode: GuidanceMode,
    /// Frames per decoder call; `None` decodes all frames at once
    pub decode_chunk_size: Option<usize>,
    /// Where to write blended-noise previews, if anywhere
    pub preview_dir: Option<PathBuf>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            frame_count: 16,
            initial_alpha: 0.23,
            decay_ratio: 0.8,
            fps: 24,
            guidance_scale: 9.0,
            num_inference_steps: 50,
            latent_height: 32,
            latent_width: 32,
            scale_factor: 0.18215,
            seed: 42,
            guidance_mode: GuidanceMode::Batched,
            decode_chunk_size: None,
            preview_dir: None,
        }
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_count == 0 {
            return Err(ConfigError::InvalidFrameCount(self.frame_count));
        }
        if !(0.0..=1.0).contains(&self.initial_alpha) {
            return Err(ConfigError::OutOfRange {
                field: "initial_alpha",
                value: self.initial_alpha,
            });
        }
        if !(0.0..=1.0).contains(&self.decay_ratio) {
            return Err(ConfigError::OutOfRange {
                field: "decay_ratio",
                value: self.decay_ratio,
            });
        }
        if self.fps == 0 {
            return Err(ConfigError::InvalidValue {
                field: "fps",
                reason: "must be greater than zero".to_string(),
            });
        }
        if !self.guidance_scale.is_finite() {
            return Err(ConfigError::InvalidValue {
                field: "guidance_scale",
                reason: format!("must be finite, got {}", self.guidance_scale),
            });
        }
        if self.num_inference_steps == 0 {
            return Err(ConfigError::InvalidValue {
                field: "num_inference_steps",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.latent_height == 0 || self.latent_width == 0 {
            return Err(ConfigError::InvalidDimensions {
                height: self.latent_height,
                width: self.latent_width,
            });
        }
        if !(self.scale_factor.is_finite() && self.scale_factor > 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "scale_factor",
                reason: format!("must be positive, got {}", self.scale_factor),
            });
        }
        if self.decode_chunk_size == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "decode_chunk_size",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
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

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.num_inference_steps = steps;
        self
    }

    pub fn with_guidance_scale(mut self, scale: f64) -> Self {
        self.guidance_scale = scale;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_latent_size(mut self, height: usize, width: usize) -> Self {
        self.latent_height = height;
        self.latent_width = width;
        self
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }
}

// =============================================================================
// Device / precision
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Precision {
    #[default]
    F32,
    F16,
    BF16,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Precision::F32 => DType::F32,
            Precision::F16 => DType::F16,
            Precision::BF16 => DType::BF16,
        }
    }
}

/// Explicit compute context handed to the pipeline at construction
#[derive(Debug, Clone)]
pub struct ComputeConfig {
    pub device: Device,
    /// Dtype of denoiser inputs and loaded weights; latents stay in F32
    pub precision: Precision,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            precision: Precision::F32,
        }
    }
}

impl ComputeConfig {
    pub fn cpu() -> Self {
        Self::default()
    }

    pub fn dtype(&self) -> DType {
        self.precision.dtype()
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid frame count: {0}. Must be at least 1")]
    InvalidFrameCount(usize),
    #[error("{field} must be within [0, 1], got {value}")]
    OutOfRange { field: &'static str, value: f64 },
    #[error("Invalid latent dimensions: height={height}, width={width}")]
    InvalidDimensions { height: usize, width: usize },
    #[error("Invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("Denoiser must map 4 latent channels, got in={in_dim} out={out_dim}")]
    LatentChannels { in_dim: usize, out_dim: usize },
    #[error("Unsupported {field} = {value}; the frame-wise UNet requires {supported}")]
    UnsupportedArchitecture {
        field: &'static str,
        value: String,
        supported: String,
    },
}
