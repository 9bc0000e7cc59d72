//! Decoder output to 8-bit frames

use candle_core::{DType, Tensor};
use image::RgbImage;

use crate::error::{Result, SdVideoError};

/// Per-channel statistics the decoder output was normalized with
pub const PIXEL_MEAN: [f64; 3] = [0.5, 0.5, 0.5];
pub const PIXEL_STD: [f64; 3] = [0.5, 0.5, 0.5];

/// Byte order of packed pixels handed to the video writer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelOrder {
    #[default]
    Rgb,
    Bgr,
}

impl ChannelOrder {
    /// ffmpeg `-pix_fmt` name for packed 8-bit input
    pub fn pix_fmt(self) -> &'static str {
        match self {
            ChannelOrder::Rgb => "rgb24",
            ChannelOrder::Bgr => "bgr24",
        }
    }

    /// Pack an RGB frame in this order
    pub fn pack(self, frame: &RgbImage) -> Vec<u8> {
        match self {
            ChannelOrder::Rgb => frame.as_raw().clone(),
            ChannelOrder::Bgr => frame
                .as_raw()
                .chunks_exact(3)
                .flat_map(|p| [p[2], p[1], p[0]])
                .collect(),
        }
    }
}

/// Convert `(1, 3, F, H, W)` pixels into `F` frames.
///
/// Values are denormalized with [`PIXEL_MEAN`]/[`PIXEL_STD`], scaled to 255,
/// rounded and saturated into `[0, 255]`.
pub fn tensor_to_frames(video: &Tensor) -> Result<Vec<RgbImage>> {
    let (b, c, f, h, w) = video.dims5()?;
    if b != 1 || c != 3 {
        return Err(SdVideoError::ShapeMismatch {
            context: "pixel video",
            expected: vec![1, 3, f, h, w],
            actual: video.dims().to_vec(),
        });
    }
    let device = video.device();

    let std = Tensor::new(&PIXEL_STD.map(|v| v as f32), device)?.reshape((1, 3, 1, 1, 1))?;
    let mean = Tensor::new(&PIXEL_MEAN.map(|v| v as f32), device)?.reshape((1, 3, 1, 1, 1))?;
    let bytes = video
        .to_dtype(DType::F32)?
        .broadcast_mul(&std)?
        .broadcast_add(&mean)?
        .affine(255.0, 0.0)?
        .round()?
        .clamp(0f32, 255f32)?
        .to_dtype(DType::U8)?
        // (1, 3, F, H, W) -> (F, H, W, 3)
        .squeeze(0)?
        .permute((1, 2, 3, 0))?
        .contiguous()?
        .flatten_all()?
        .to_vec1::<u8>()?;

    let frame_len = h * w * 3;
    bytes
        .chunks_exact(frame_len)
        .map(|chunk| {
            RgbImage::from_raw(w as u32, h as u32, chunk.to_vec()).ok_or_else(|| {
                SdVideoError::ShapeMismatch {
                    context: "frame buffer",
                    expected: vec![frame_len],
                    actual: vec![chunk.len()],
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_denormalize_and_saturate() -> Result<()> {
        // frame 0: -1 -> 0, frame 1: 1 -> 255, frame 2: 3 saturates, frame 3: 0 -> 128 (127.5 rounds up)
        let values = [-1.0f32, 1.0, 3.0, 0.0];
        let data: Vec<f32> = (0..3).flat_map(|_| values).collect();
        let video = Tensor::from_vec(data, (1, 3, 4, 1, 1), &Device::Cpu)?;
        let frames = tensor_to_frames(&video)?;
        assert_eq!(frames.len(), 4);
        let px: Vec<u8> = frames.iter().map(|f| f.get_pixel(0, 0)[0]).collect();
        assert_eq!(px, vec![0, 255, 255, 128]);
        Ok(())
    }

    #[test]
    fn test_bgr_packing_swaps_channels() {
        let frame = RgbImage::from_pixel(1, 1, image::Rgb([10, 20, 30]));
        assert_eq!(ChannelOrder::Rgb.pack(&frame), vec![10, 20, 30]);
        assert_eq!(ChannelOrder::Bgr.pack(&frame), vec![30, 20, 10]);
    }
}
