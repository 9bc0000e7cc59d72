//! Deterministic stand-ins for the three networks
//!
//! Used by the test suite and by the CLI's `--mock` mode to exercise the full
//! pipeline without weights. All outputs are finite, bounded and a pure
//! function of their inputs.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use candle_core::{DType, Device, Result, Tensor};

use crate::model::{Denoiser, LatentDecoder, TextEmbedder};
use crate::utils::Pcg32;

/// Hash-seeded Gaussian embeddings of a fixed shape
#[derive(Debug, Clone)]
pub struct MockTextEmbedder {
    seq_len: usize,
    dim: usize,
    device: Device,
    pub calls: usize,
}

impl MockTextEmbedder {
    pub fn new(seq_len: usize, dim: usize, device: &Device) -> Self {
        Self {
            seq_len,
            dim,
            device: device.clone(),
            calls: 0,
        }
    }
}

impl Default for MockTextEmbedder {
    fn default() -> Self {
        Self::new(8, 16, &Device::Cpu)
    }
}

impl TextEmbedder for MockTextEmbedder {
    fn encode(&mut self, text: &str) -> Result<Tensor> {
        self.calls += 1;
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        Pcg32::seeded(hasher.finish()).randn((1, self.seq_len, self.dim), &self.device)
    }
}

/// Predicts a damped copy of the input shifted by the context mean.
///
/// Each batch entry only sees its own context, so batched and sequential
/// guidance agree.
#[derive(Debug, Clone, Default)]
pub struct MockDenoiser {
    pub calls: usize,
    fail_at: Option<usize>,
    nan_at: Option<usize>,
}

impl MockDenoiser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return an error on the given (zero-based) forward call
    pub fn failing_at(call: usize) -> Self {
        Self {
            fail_at: Some(call),
            ..Self::default()
        }
    }

    /// Return NaN predictions on the given (zero-based) forward call
    pub fn nan_at(call: usize) -> Self {
        Self {
            nan_at: Some(call),
            ..Self::default()
        }
    }
}

impl Denoiser for MockDenoiser {
    fn forward(&mut self, latents: &Tensor, _timestep: f64, context: &Tensor) -> Result<Tensor> {
        let call = self.calls;
        self.calls += 1;
        if self.fail_at == Some(call) {
            candle_core::bail!("mock denoiser failure on call {call}");
        }

        let b = latents.dim(0)?;
        if context.dim(0)? != b {
            candle_core::bail!(
                "context batch {} does not match latent batch {b}",
                context.dim(0)?
            );
        }
        let bias = context
            .to_dtype(DType::F32)?
            .flatten_from(1)?
            .mean_keepdim(1)?
            .reshape((b, 1, 1, 1, 1))?
            .affine(0.05, 0.0)?;
        let out = latents
            .to_dtype(DType::F32)?
            .affine(0.1, 0.0)?
            .broadcast_add(&bias)?;

        let out = if self.nan_at == Some(call) {
            out.affine(0.0, f64::NAN)?
        } else {
            out
        };
        out.to_dtype(latents.dtype())
    }
}

/// Nearest-neighbour upsampling of the first three latent channels
#[derive(Debug, Clone)]
pub struct MockDecoder {
    upsampling: usize,
}

impl MockDecoder {
    pub fn new(upsampling: usize) -> Self {
        Self {
            upsampling: upsampling.max(1),
        }
    }

    pub fn upsampling(&self) -> usize {
        self.upsampling
    }
}

impl Default for MockDecoder {
    fn default() -> Self {
        Self::new(2)
    }
}

impl LatentDecoder for MockDecoder {
    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = latents.dims4()?;
        latents
            .narrow(1, 0, 3)?
            .to_dtype(DType::F32)?
            .tanh()?
            .upsample_nearest2d(h * self.upsampling, w * self.upsampling)
    }
}
