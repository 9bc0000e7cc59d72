//! Deterministic DDIM scheduler (eta = 0)
//!
//! Timesteps are spread evenly from `T - 1` down to 0 and walked from high
//! noise to low noise. Each step predicts `x0` from the model output and
//! re-noises it to the previous timestep along the deterministic DDIM path.

use candle_core::{Result, Tensor};

use crate::config::{BetaSchedule, DiffusionConfig, PredictionType};

/// Output from a scheduler step
#[derive(Debug)]
pub struct DdimStepOutput {
    /// Latent at the previous (less noisy) timestep
    pub prev_sample: Tensor,
    /// Predicted clean latent
    pub pred_original_sample: Tensor,
}

#[derive(Debug, Clone)]
pub struct DdimScheduler {
    config: DiffusionConfig,
    alphas_cumprod: Vec<f64>,
    timesteps: Vec<usize>,
}

impl DdimScheduler {
    pub fn new(config: DiffusionConfig) -> Result<Self> {
        if config.num_train_timesteps < 2 {
            candle_core::bail!(
                "num_train_timesteps must be at least 2, got {}",
                config.num_train_timesteps
            );
        }
        let betas = Self::compute_betas(&config);

        let mut alphas_cumprod = Vec::with_capacity(betas.len());
        let mut cumprod = 1.0;
        for beta in &betas {
            cumprod *= 1.0 - beta;
            alphas_cumprod.push(cumprod);
        }

        Ok(Self {
            config,
            alphas_cumprod,
            timesteps: Vec::new(),
        })
    }

    fn compute_betas(config: &DiffusionConfig) -> Vec<f64> {
        let n = config.num_train_timesteps;
        let denom = (n - 1) as f64;
        match config.beta_schedule {
            BetaSchedule::LinearSd => {
                let start = config.beta_start.sqrt();
                let end = config.beta_end.sqrt();
                (0..n)
                    .map(|i| {
                        let b = start + (i as f64 / denom) * (end - start);
                        b * b
                    })
                    .collect()
            }
            BetaSchedule::Linear => {
                let span = config.beta_end - config.beta_start;
                (0..n)
                    .map(|i| config.beta_start + (i as f64 / denom) * span)
                    .collect()
            }
        }
    }

    /// Choose `num_inference_steps` timesteps, strictly decreasing.
    ///
    /// Requires `1 <= num_inference_steps <= T`.
    pub fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<&[usize]> {
        let t = self.config.num_train_timesteps;
        if num_inference_steps == 0 || num_inference_steps > t {
            candle_core::bail!(
                "num_inference_steps must be within [1, {t}], got {num_inference_steps}"
            );
        }

        // Evenly spaced from T - 1 down to 0; spacing >= 1 keeps them unique
        let n = num_inference_steps;
        self.timesteps = if n == 1 {
            vec![t - 1]
        } else {
            let spacing = (t - 1) as f64 / (n - 1) as f64;
            (0..n)
                .map(|k| (spacing * (n - 1 - k) as f64).round() as usize)
                .collect()
        };
        Ok(&self.timesteps)
    }

    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    /// Timestep following `timestep` in the schedule, `None` after the last
    pub fn prev_timestep(&self, timestep: usize) -> Result<Option<usize>> {
        match self.timesteps.iter().position(|&t| t == timestep) {
            Some(i) => Ok(self.timesteps.get(i + 1).copied()),
            None => candle_core::bail!("timestep {timestep} is not in the current schedule"),
        }
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    pub fn config(&self) -> &DiffusionConfig {
        &self.config
    }

    /// Move `sample` from `timestep` to the next scheduled timestep.
    ///
    /// The last step lands on the predicted clean sample. `model_output` must
    /// already have guidance applied. Both tensors are expected in F32.
    pub fn step(
        &self,
        model_output: &Tensor,
        timestep: usize,
        sample: &Tensor,
    ) -> Result<DdimStepOutput> {
        let last = self.alphas_cumprod.len() - 1;
        let alpha_t = self.alphas_cumprod[timestep.min(last)];
        let alpha_prev = match self.prev_timestep(timestep)? {
            Some(prev) => self.alphas_cumprod[prev.min(last)],
            None => 1.0,
        };

        let (x0, eps) = match self.config.prediction_type {
            PredictionType::Epsilon => {
                let x0 = (sample.affine((1.0 / alpha_t).sqrt(), 0.0)?
                    - model_output.affine((1.0 / alpha_t - 1.0).sqrt(), 0.0)?)?;
                (x0, model_output.clone())
            }
            PredictionType::VPrediction => {
                // x0 = sqrt(a) x_t - sqrt(1-a) v ; eps = sqrt(1-a) x_t + sqrt(a) v
                let x0 = (sample.affine(alpha_t.sqrt(), 0.0)?
                    - model_output.affine((1.0 - alpha_t).sqrt(), 0.0)?)?;
                let eps = (sample.affine((1.0 - alpha_t).sqrt(), 0.0)?
                    + model_output.affine(alpha_t.sqrt(), 0.0)?)?;
                (x0, eps)
            }
            PredictionType::Sample => {
                let eps = (sample.affine((1.0 / alpha_t).sqrt(), 0.0)? - model_output)?
                    .affine(1.0 / (1.0 / alpha_t - 1.0).sqrt(), 0.0)?;
                (model_output.clone(), eps)
            }
        };

        let prev_sample =
            (x0.affine(alpha_prev.sqrt(), 0.0)? + eps.affine((1.0 - alpha_prev).sqrt(), 0.0)?)?;

        Ok(DdimStepOutput {
            prev_sample,
            pred_original_sample: x0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_linear_sd_betas() -> Result<()> {
        let scheduler = DdimScheduler::new(DiffusionConfig::default())?;
        let ac = scheduler.alphas_cumprod();
        assert_eq!(ac.len(), 1000);
        assert!((ac[0] - (1.0 - 0.00085)).abs() < 1e-12);
        assert!(ac.windows(2).all(|w| w[1] < w[0]));
        Ok(())
    }

    #[test]
    fn test_rejects_out_of_range_steps() -> Result<()> {
        let mut scheduler = DdimScheduler::new(DiffusionConfig::default())?;
        assert!(scheduler.set_timesteps(0).is_err());
        assert!(scheduler.set_timesteps(1001).is_err());
        let all = scheduler.set_timesteps(1000)?;
        assert_eq!(all.len(), 1000);
        assert!(all.windows(2).all(|w| w[1] < w[0]));
        Ok(())
    }

    #[test]
    fn test_prev_timestep_follows_schedule() -> Result<()> {
        let mut scheduler = DdimScheduler::new(DiffusionConfig::default())?;
        scheduler.set_timesteps(3)?;
        assert_eq!(scheduler.prev_timestep(999)?, Some(500));
        assert_eq!(scheduler.prev_timestep(0)?, None);
        assert!(scheduler.prev_timestep(998).is_err());
        Ok(())
    }

    #[test]
    fn test_step_with_exact_noise_recovers_x0() -> Result<()> {
        let mut scheduler = DdimScheduler::new(DiffusionConfig::default())?;
        scheduler.set_timesteps(10)?;
        let device = Device::Cpu;
        let x0 = Tensor::new(&[0.5f32, -0.25, 1.0], &device)?;
        let eps = Tensor::new(&[0.1f32, 0.7, -1.2], &device)?;
        let t = scheduler.timesteps()[0];
        let a = scheduler.alphas_cumprod()[t];
        let xt = (x0.affine(a.sqrt(), 0.0)? + eps.affine((1.0 - a).sqrt(), 0.0)?)?;

        let out = scheduler.step(&eps, t, &xt)?;
        let recovered = out.pred_original_sample.to_vec1::<f32>()?;
        for (r, e) in recovered.iter().zip([0.5f32, -0.25, 1.0]) {
            assert!((r - e).abs() < 1e-3, "{r} vs {e}");
        }
        Ok(())
    }
}
