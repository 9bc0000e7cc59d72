//! Guided denoising loop
//!
//! Drives a [`Denoiser`] through the DDIM timesteps with classifier-free
//! guidance. The latent state is owned by the loop and replaced after every
//! step; nothing else observes it until sampling returns.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use candle_core::{DType, Tensor};
use tracing::{debug, info};

use crate::conditioning::PromptEmbeddings;
use crate::config::{DiffusionConfig, GuidanceMode};
use crate::error::{Result, SdVideoError};
use crate::model::Denoiser;
use crate::scheduler::DdimScheduler;

/// Shared flag checked between sampling steps
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Progress report passed to the step callback after each completed step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepInfo {
    pub index: usize,
    pub total: usize,
    pub timestep: usize,
}

/// `neg + scale * (pos - neg)`, exact at scale 0 and 1
pub fn apply_guidance(
    negative: &Tensor,
    positive: &Tensor,
    scale: f64,
) -> candle_core::Result<Tensor> {
    if scale == 0.0 {
        return Ok(negative.clone());
    }
    if scale == 1.0 {
        return Ok(positive.clone());
    }
    negative + (positive - negative)?.affine(scale, 0.0)?
}

/// Conditioning prepared once per run, in the compute dtype
enum GuidanceInputs {
    Batched(Tensor),
    Sequential { negative: Tensor, positive: Tensor },
}

pub struct SamplerDriver {
    scheduler: DdimScheduler,
    num_inference_steps: usize,
    guidance_scale: f64,
    guidance_mode: GuidanceMode,
    /// Dtype of the denoiser inputs; the latent state stays F32
    compute_dtype: DType,
    cancel: Option<CancellationToken>,
}

impl SamplerDriver {
    pub fn new(
        diffusion: DiffusionConfig,
        num_inference_steps: usize,
        guidance_scale: f64,
    ) -> Result<Self> {
        let mut scheduler = DdimScheduler::new(diffusion)?;
        scheduler.set_timesteps(num_inference_steps)?;
        Ok(Self {
            scheduler,
            num_inference_steps,
            guidance_scale,
            guidance_mode: GuidanceMode::default(),
            compute_dtype: DType::F32,
            cancel: None,
        })
    }

    pub fn with_guidance_mode(mut self, mode: GuidanceMode) -> Self {
        self.guidance_mode = mode;
        self
    }

    pub fn with_compute_dtype(mut self, dtype: DType) -> Self {
        self.compute_dtype = dtype;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn scheduler(&self) -> &DdimScheduler {
        &self.scheduler
    }

    pub fn timesteps(&self) -> &[usize] {
        self.scheduler.timesteps()
    }

    /// Run the full loop from `latents` and return the final state.
    pub fn sample<D: Denoiser + ?Sized>(
        &self,
        denoiser: &mut D,
        latents: Tensor,
        embeddings: &PromptEmbeddings,
        mut on_step: Option<&mut dyn FnMut(StepInfo)>,
    ) -> Result<Tensor> {
        let mut latents = latents.to_dtype(DType::F32)?;
        let total = self.num_inference_steps;
        let inputs = match self.guidance_mode {
            GuidanceMode::Batched => {
                let context = embeddings.guidance_context()?;
                GuidanceInputs::Batched(context.to_dtype(self.compute_dtype)?)
            }
            GuidanceMode::Sequential => GuidanceInputs::Sequential {
                negative: embeddings.negative.to_dtype(self.compute_dtype)?,
                positive: embeddings.positive.to_dtype(self.compute_dtype)?,
            },
        };

        info!(
            steps = total,
            guidance_scale = self.guidance_scale,
            mode = ?self.guidance_mode,
            shape = ?latents.dims(),
            "Starting denoising loop"
        );

        for (index, &timestep) in self.scheduler.timesteps().iter().enumerate() {
            if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                info!(step = index, "Sampling cancelled");
                return Err(SdVideoError::Cancelled { step: index });
            }

            let failed = |e: candle_core::Error| SdVideoError::SamplingFailed {
                step: index,
                reason: e.to_string(),
            };

            let input = latents.to_dtype(self.compute_dtype)?;
            let t = timestep as f64;
            let (pred_neg, pred_pos) = match &inputs {
                GuidanceInputs::Batched(context) => {
                    let batch = Tensor::cat(&[&input, &input], 0)?;
                    let out = denoiser.forward(&batch, t, context).map_err(failed)?;
                    check_prediction(&out, 2, &input, index)?;
                    (out.narrow(0, 0, 1)?, out.narrow(0, 1, 1)?)
                }
                GuidanceInputs::Sequential { negative, positive } => {
                    let out_neg = denoiser.forward(&input, t, negative).map_err(failed)?;
                    check_prediction(&out_neg, 1, &input, index)?;
                    let out_pos = denoiser.forward(&input, t, positive).map_err(failed)?;
                    check_prediction(&out_pos, 1, &input, index)?;
                    (out_neg, out_pos)
                }
            };

            let guided = apply_guidance(
                &pred_neg.to_dtype(DType::F32)?,
                &pred_pos.to_dtype(DType::F32)?,
                self.guidance_scale,
            )?;
            latents = self.scheduler.step(&guided, timestep, &latents)?.prev_sample;

            let checksum = latents.to_dtype(DType::F64)?.sum_all()?.to_scalar::<f64>()?;
            if !checksum.is_finite() {
                return Err(SdVideoError::SamplingFailed {
                    step: index,
                    reason: "latent contains non-finite values".to_string(),
                });
            }

            debug!(step = index + 1, total, timestep, "Denoising step complete");
            if let Some(callback) = on_step.as_deref_mut() {
                callback(StepInfo {
                    index,
                    total,
                    timestep,
                });
            }
        }

        info!("Denoising complete");
        Ok(latents)
    }
}

fn check_prediction(output: &Tensor, batch: usize, input: &Tensor, step: usize) -> Result<()> {
    let mut expected = input.dims().to_vec();
    expected[0] = batch;
    if output.dims() != expected.as_slice() {
        return Err(SdVideoError::SamplingFailed {
            step,
            reason: format!(
                "denoiser returned shape {:?}, expected {:?}",
                output.dims(),
                expected
            ),
        });
    }
    Ok(())
}
