//! Frame-wise conditional UNet denoiser
//!
//! Runs the `candle-transformers` 2D conditional UNet on every frame of a
//! `(B, 4, F, H, W)` latent by folding frames into the batch axis. Each frame
//! sees the context of its own batch entry.

use std::path::Path;

use candle_core::{DType, Device, Result, Tensor};
use candle_transformers::models::stable_diffusion::StableDiffusionConfig;
use candle_transformers::models::stable_diffusion::unet_2d::UNet2DConditionModel;
use tracing::debug;

use crate::config::LATENT_CHANNELS;
use crate::model::Denoiser;

pub struct FrameUnetDenoiser {
    unet: UNet2DConditionModel,
    dtype: DType,
}

impl FrameUnetDenoiser {
    pub fn load(
        weights: impl AsRef<Path>,
        sd_config: &StableDiffusionConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let unet = sd_config.build_unet(weights, device, LATENT_CHANNELS, false, dtype)?;
        Ok(Self { unet, dtype })
    }
}

impl Denoiser for FrameUnetDenoiser {
    fn forward(&mut self, latents: &Tensor, timestep: f64, context: &Tensor) -> Result<Tensor> {
        let (b, c, f, h, w) = latents.dims5()?;
        let (_, seq_len, dim) = context.dims3()?;

        // (B, C, F, H, W) -> (B*F, C, H, W)
        let frames = latents
            .permute((0, 2, 1, 3, 4))?
            .reshape((b * f, c, h, w))?
            .to_dtype(self.dtype)?;
        let context = context
            .unsqueeze(1)?
            .repeat((1, f, 1, 1))?
            .reshape((b * f, seq_len, dim))?
            .to_dtype(self.dtype)?;

        let out = self.unet.forward(&frames, timestep, &context)?;
        debug!(timestep, batch = b * f, "UNet forward");

        out.reshape((b, f, c, h, w))?
            .permute((0, 2, 1, 3, 4))?
            .contiguous()
    }
}
