//! Latent decoding
//!
//! [`decode_latents`] turns a `(1, 4, F, H, W)` latent video into pixel frames
//! by folding frames into the batch axis for a 2D decoder. [`KlLatentDecoder`]
//! is the `candle-transformers` KL autoencoder behind that interface.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_transformers::models::stable_diffusion::StableDiffusionConfig;
use candle_transformers::models::stable_diffusion::vae::AutoEncoderKL;
use tracing::{debug, info};

use crate::error::{Result, SdVideoError};
use crate::model::LatentDecoder;

/// Decode a latent video into `(B, 3, F, H', W')` pixels in the decoder's range.
///
/// Latents are divided by `scale_factor` first. With `chunk_size` set, the
/// decoder sees at most that many frames per call; frame order is preserved
/// either way.
pub fn decode_latents<V: LatentDecoder + ?Sized>(
    decoder: &V,
    latents: &Tensor,
    scale_factor: f64,
    chunk_size: Option<usize>,
) -> Result<Tensor> {
    let (b, c, f, h, w) = latents.dims5()?;
    let n = b * f;
    info!(frames = f, chunk_size, "Decoding latents");

    let flat = latents
        .affine(1.0 / scale_factor, 0.0)?
        .permute((0, 2, 1, 3, 4))?
        .reshape((n, c, h, w))?;

    let chunk = chunk_size.unwrap_or(n).max(1);
    let mut decoded = Vec::with_capacity(n.div_ceil(chunk));
    let mut start = 0;
    while start < n {
        let len = chunk.min(n - start);
        let part = decoder.decode(&flat.narrow(0, start, len)?)?;
        if part.dims().len() != 4 || part.dim(0)? != len || part.dim(1)? != 3 {
            return Err(SdVideoError::ShapeMismatch {
                context: "decoder output",
                expected: vec![len, 3],
                actual: part.dims().to_vec(),
            });
        }
        decoded.push(part.to_dtype(DType::F32)?);
        start += len;
    }

    let pixels = if decoded.len() == 1 {
        decoded.remove(0)
    } else {
        Tensor::cat(&decoded, 0)?
    };
    let (_, _, out_h, out_w) = pixels.dims4()?;
    debug!(out_h, out_w, "Decoded frames");

    Ok(pixels
        .reshape((b, f, 3, out_h, out_w))?
        .permute((0, 2, 1, 3, 4))?
        .contiguous()?)
}

/// KL autoencoder decoder, 8x spatial upsampling
pub struct KlLatentDecoder {
    vae: AutoEncoderKL,
    dtype: DType,
}

impl KlLatentDecoder {
    pub fn load(
        weights: impl AsRef<Path>,
        sd_config: &StableDiffusionConfig,
        device: &Device,
        dtype: DType,
    ) -> candle_core::Result<Self> {
        let vae = sd_config.build_vae(weights, device, dtype)?;
        Ok(Self { vae, dtype })
    }
}

impl LatentDecoder for KlLatentDecoder {
    fn decode(&self, latents: &Tensor) -> candle_core::Result<Tensor> {
        self.vae
            .decode(&latents.to_dtype(self.dtype)?)?
            .to_dtype(DType::F32)
    }
}
