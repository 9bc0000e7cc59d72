//! Noise-image blending
//!
//! Builds the initial latent sequence: the seed image is normalized, laid over
//! every frame, and mixed with Gaussian noise using a weight that decays
//! geometrically over the frame axis. Early frames stay close to the image,
//! later frames are mostly noise.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use image::RgbImage;
use image::imageops::FilterType;
use tracing::{debug, info};

use crate::config::{GenerationConfig, LATENT_CHANNELS};
use crate::error::{Result, SdVideoError};
use crate::utils::Pcg32;

/// Standard deviations at or below this are treated as zero
const FLAT_STD_EPS: f64 = 1e-6;

/// Per-frame image weights `alpha_i = a0 * r^i`
pub fn blend_schedule(frame_count: usize, initial_alpha: f64, decay_ratio: f64) -> Vec<f64> {
    (0..frame_count)
        .map(|i| initial_alpha * decay_ratio.powi(i as i32))
        .collect()
}

/// Open an image and resize it to the latent resolution
pub fn load_seed_image(path: impl AsRef<Path>, width: usize, height: usize) -> Result<RgbImage> {
    let path = path.as_ref();
    let img = image::open(path)
        .map_err(|e| SdVideoError::invalid_image(Some(path.to_path_buf()), e.to_string()))?;
    Ok(resize_seed_image(&img.to_rgb8(), width, height))
}

/// Resize an in-memory frame to the latent resolution
pub fn resize_seed_image(image: &RgbImage, width: usize, height: usize) -> RgbImage {
    if image.width() as usize == width && image.height() as usize == height {
        return image.clone();
    }
    image::imageops::resize(image, width as u32, height as u32, FilterType::CatmullRom)
}

/// `(3, H, W)` f32 tensor with values in `[0, 1]`
pub fn image_to_tensor(image: &RgbImage, device: &Device) -> Result<Tensor> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let data: Vec<f32> = image.as_raw().iter().map(|&v| v as f32 / 255.0).collect();
    let tensor = Tensor::from_vec(data, (height, width, 3), device)?.permute((2, 0, 1))?;
    Ok(tensor.contiguous()?)
}

#[derive(Debug, Clone)]
pub struct NoiseImageBlender {
    frame_count: usize,
    initial_alpha: f64,
    decay_ratio: f64,
    preview_dir: Option<PathBuf>,
}

impl NoiseImageBlender {
    pub fn new(frame_count: usize, initial_alpha: f64, decay_ratio: f64) -> Self {
        Self {
            frame_count,
            initial_alpha,
            decay_ratio,
            preview_dir: None,
        }
    }

    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            frame_count: config.frame_count,
            initial_alpha: config.initial_alpha,
            decay_ratio: config.decay_ratio,
            preview_dir: config.preview_dir.clone(),
        }
    }

    pub fn with_preview_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.preview_dir = Some(dir.into());
        self
    }

    pub fn schedule(&self) -> Vec<f64> {
        blend_schedule(self.frame_count, self.initial_alpha, self.decay_ratio)
    }

    /// Produce the normalized `(1, 4, F, H, W)` starting latent.
    ///
    /// `image` must already be at latent resolution. Noise is drawn from `rng`.
    pub fn blend(&self, image: &RgbImage, rng: &mut Pcg32, device: &Device) -> Result<Tensor> {
        let (height, width) = (image.height() as usize, image.width() as usize);
        let frames = self.frame_count;
        info!(
            frames,
            height,
            width,
            initial_alpha = self.initial_alpha,
            decay_ratio = self.decay_ratio,
            "Blending seed image with noise"
        );

        let rgb = normalize_channels(&image_to_tensor(image, device)?)?;
        let placeholder = Tensor::zeros((1, height, width), DType::F32, device)?;
        // (4, H, W) -> (1, 4, 1, H, W), broadcast over frames below
        let image_latent = Tensor::cat(&[&rgb, &placeholder], 0)?
            .unsqueeze(0)?
            .unsqueeze(2)?;

        let noise = rng.randn((1, LATENT_CHANNELS, frames, height, width), device)?;

        let alphas: Vec<f32> = self.schedule().iter().map(|&a| a as f32).collect();
        let alpha = Tensor::from_vec(alphas, (1, 1, frames, 1, 1), device)?;
        let one_minus_alpha = alpha.affine(-1.0, 1.0)?;

        let blended = (image_latent.broadcast_mul(&alpha)? + noise.broadcast_mul(&one_minus_alpha)?)?;
        let blended = renormalize(&blended)?;

        if let Some(dir) = &self.preview_dir {
            write_previews(&blended, dir)?;
        }
        Ok(blended)
    }
}

/// Per-channel standardization of a `(3, H, W)` image using the unbiased std.
///
/// A channel with zero variance maps to zero; an image whose every channel is
/// flat carries no signal and is rejected.
fn normalize_channels(image: &Tensor) -> Result<Tensor> {
    let (channels, height, width) = image.dims3()?;
    let flat = image.reshape((channels, height * width))?;
    let mean = flat.mean_keepdim(1)?;
    let centered = flat.broadcast_sub(&mean)?;

    let stds: Vec<f64> = if height * width > 1 {
        centered
            .sqr()?
            .sum_keepdim(1)?
            .affine(1.0 / (height * width - 1) as f64, 0.0)?
            .sqrt()?
            .flatten_all()?
            .to_vec1::<f32>()?
            .into_iter()
            .map(f64::from)
            .collect()
    } else {
        vec![0.0; channels]
    };

    if stds.iter().all(|&s| !(s > FLAT_STD_EPS)) {
        return Err(SdVideoError::invalid_image(
            None,
            "image has zero variance in every color channel",
        ));
    }

    let scales: Vec<f32> = stds
        .iter()
        .map(|&s| if s > FLAT_STD_EPS { (1.0 / s) as f32 } else { 0.0 })
        .collect();
    debug!(?stds, "Seed image channel statistics");
    let scales = Tensor::from_vec(scales, (channels, 1), image.device())?;
    Ok(centered
        .broadcast_mul(&scales)?
        .reshape((channels, height, width))?)
}

/// Standardize the whole tensor by its global mean and unbiased std
fn renormalize(blended: &Tensor) -> Result<Tensor> {
    let n = blended.elem_count();
    let mean = blended.mean_all()?.to_scalar::<f32>()? as f64;
    let sum_sq = blended
        .affine(1.0, -mean)?
        .sqr()?
        .sum_all()?
        .to_scalar::<f32>()? as f64;
    let std = (sum_sq / (n.saturating_sub(1).max(1)) as f64).sqrt();

    if !(std.is_finite() && std > FLAT_STD_EPS) {
        return Err(SdVideoError::invalid_image(
            None,
            format!("blended latent has degenerate std {std}"),
        ));
    }
    debug!(mean, std, "Blended latent statistics before renormalization");
    Ok(blended.affine(1.0 / std, -mean / std)?)
}

/// Write one PNG per frame from the RGB channels, min-max scaled over the
/// whole tensor.
pub fn write_previews(latents: &Tensor, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|source| SdVideoError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let (_, _, frames, height, width) = latents.dims5()?;
    let rgb = latents.narrow(1, 0, 3)?;
    let min = rgb.min_all()?.to_scalar::<f32>()? as f64;
    let max = rgb.max_all()?.to_scalar::<f32>()? as f64;
    let range = (max - min).max(1e-12);
    let scaled = rgb
        .affine(255.0 / range, -min * 255.0 / range)?
        .round()?
        .clamp(0.0, 255.0)?
        .to_dtype(DType::U8)?;

    for j in 0..frames {
        // (1, 3, 1, H, W) -> (H, W, 3)
        let frame = scaled
            .narrow(2, j, 1)?
            .reshape((3, height, width))?
            .permute((1, 2, 0))?;
        let data = frame.flatten_all()?.to_vec1::<u8>()?;
        let path = dir.join(format!("preview_frame_{j}.png"));
        let img = RgbImage::from_raw(width as u32, height as u32, data).ok_or_else(|| {
            SdVideoError::invalid_image(None, "preview buffer has the wrong length")
        })?;
        img.save(&path)
            .map_err(|source| SdVideoError::ImageWrite { path, source })?;
    }
    debug!(frames, dir = %dir.display(), "Wrote blend previews");
    Ok(())
}
