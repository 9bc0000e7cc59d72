//! Capability interfaces for the three networks the pipeline composes
//!
//! The sampling core never looks inside these models. Anything that can map
//! latents to a noise prediction, text to an embedding, or latents to pixels
//! can be plugged in, including the deterministic stand-ins in [`crate::mock`].

use candle_core::{Result, Tensor};

/// Denoising network conditioned on text
pub trait Denoiser {
    /// Predict the model target for `latents` at `timestep`.
    ///
    /// `latents` is `(B, 4, F, H, W)` and `context` is `(B, L, D)`; the output
    /// has the same shape as `latents`. Inputs arrive in the compute dtype.
    fn forward(&mut self, latents: &Tensor, timestep: f64, context: &Tensor) -> Result<Tensor>;
}

/// Text-to-embedding encoder
pub trait TextEmbedder {
    /// Encode one prompt into a `(1, L, D)` embedding
    fn encode(&mut self, text: &str) -> Result<Tensor>;
}

/// Latent-to-pixel decoder
pub trait LatentDecoder {
    /// Decode `(N, 4, H, W)` latents into `(N, 3, H', W')` pixels in `[-1, 1]`
    fn decode(&self, latents: &Tensor) -> Result<Tensor>;
}

impl<T: Denoiser + ?Sized> Denoiser for Box<T> {
    fn forward(&mut self, latents: &Tensor, timestep: f64, context: &Tensor) -> Result<Tensor> {
        (**self).forward(latents, timestep, context)
    }
}

impl<T: TextEmbedder + ?Sized> TextEmbedder for Box<T> {
    fn encode(&mut self, text: &str) -> Result<Tensor> {
        (**self).encode(text)
    }
}

impl<T: LatentDecoder + ?Sized> LatentDecoder for Box<T> {
    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        (**self).decode(latents)
    }
}
