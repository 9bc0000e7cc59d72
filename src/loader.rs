//! Model directory loading
//!
//! A model directory holds `configuration.json` plus the weight files it
//! names. [`ModelDirectory::open`] parses and validates the configuration and
//! checks that every referenced file exists; [`ModelDirectory::load`] builds
//! the three providers on a device.

use std::path::{Path, PathBuf};

use candle_transformers::models::stable_diffusion::StableDiffusionConfig;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::config::{ComputeConfig, ConfigError, GenerationConfig, ModelConfig};
use crate::text_encoder::{ClipTextEmbedder, TextEncoderError};
use crate::unet::FrameUnetDenoiser;
use crate::vae::KlLatentDecoder;

/// Name of the configuration file inside a model directory
pub const CONFIG_FILE: &str = "configuration.json";

/// Pixels per latent cell of the KL autoencoder
pub const VAE_UPSAMPLING: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("Failed to read file: {path}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse JSON config: {path}")]
    JsonParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Missing weight files: {missing:?}")]
    MissingWeights { missing: Vec<String> },

    #[error("Invalid model configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Context width mismatch: configuration says {configured}, text encoder produces {encoder}")]
    ContextDim { configured: usize, encoder: usize },

    #[error("Text encoder: {0}")]
    TextEncoder(#[from] TextEncoderError),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Parse a JSON file into `T`
pub fn load_model_config<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, LoaderError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| LoaderError::FileRead {
        path: path.display().to_string(),
        source: e,
    })?;

    serde_json::from_str(&content).map_err(|e| LoaderError::JsonParse {
        path: path.display().to_string(),
        source: e,
    })
}

/// Resolved weight locations
#[derive(Debug, Clone)]
pub struct WeightPaths {
    pub unet: PathBuf,
    pub autoencoder: PathBuf,
    pub clip: PathBuf,
    pub tokenizer: PathBuf,
}

/// The three providers built from a model directory
pub struct LoadedModels {
    pub denoiser: FrameUnetDenoiser,
    pub text_embedder: ClipTextEmbedder,
    pub decoder: KlLatentDecoder,
}

#[derive(Debug, Clone)]
pub struct ModelDirectory {
    root: PathBuf,
    config: ModelConfig,
    weights: WeightPaths,
}

impl ModelDirectory {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, LoaderError> {
        let root = root.as_ref().to_path_buf();
        let config: ModelConfig = load_model_config(root.join(CONFIG_FILE))?;
        config.validate()?;

        let args = &config.model.model_args;
        let weights = WeightPaths {
            unet: root.join(&args.ckpt_unet),
            autoencoder: root.join(&args.ckpt_autoencoder),
            clip: root.join(&args.ckpt_clip),
            tokenizer: root.join(&args.ckpt_tokenizer),
        };

        let missing: Vec<String> = [
            &weights.unet,
            &weights.autoencoder,
            &weights.clip,
            &weights.tokenizer,
        ]
        .into_iter()
        .filter(|p| !p.is_file())
        .map(|p| p.display().to_string())
        .collect();
        if !missing.is_empty() {
            return Err(LoaderError::MissingWeights { missing });
        }

        Ok(Self {
            root,
            config,
            weights,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn weights(&self) -> &WeightPaths {
        &self.weights
    }

    /// Network configuration for the requested latent resolution
    pub fn sd_config(&self, generation: &GenerationConfig) -> StableDiffusionConfig {
        StableDiffusionConfig::v2_1(
            None,
            Some(generation.latent_height * VAE_UPSAMPLING),
            Some(generation.latent_width * VAE_UPSAMPLING),
        )
    }

    /// Build the denoiser, text encoder and decoder on the compute device
    pub fn load(
        &self,
        compute: &ComputeConfig,
        generation: &GenerationConfig,
    ) -> Result<LoadedModels, LoaderError> {
        let sd = self.sd_config(generation);
        let configured = self.config.model.model_cfg.unet_context_dim;

        let dtype = compute.dtype();
        let device = &compute.device;

        info!(path = %self.weights.clip.display(), "Loading text encoder");
        let text_embedder = ClipTextEmbedder::load(
            &self.weights.clip,
            &self.weights.tokenizer,
            &sd.clip,
            configured,
            device,
            dtype,
        )?;
        let encoder = text_embedder.embed("")?.dim(2)?;
        if encoder != configured {
            return Err(LoaderError::ContextDim {
                configured,
                encoder,
            });
        }

        info!(path = %self.weights.unet.display(), ?dtype, "Loading denoiser");
        let denoiser = FrameUnetDenoiser::load(&self.weights.unet, &sd, device, dtype)?;

        info!(path = %self.weights.autoencoder.display(), "Loading decoder");
        let decoder = KlLatentDecoder::load(&self.weights.autoencoder, &sd, device, dtype)?;

        Ok(LoadedModels {
            denoiser,
            text_embedder,
            decoder,
        })
    }
}
