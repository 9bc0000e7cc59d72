//! Latent decoding and frame post-processing tests

use candle_core::{DType, Device, Tensor};
use sd_video::mock::MockDecoder;
use sd_video::postprocess::{ChannelOrder, tensor_to_frames};
use sd_video::vae::decode_latents;
use sd_video::{LatentDecoder, Result, SdVideoError};

/// `(1, 4, F, H, W)` latents where every element of frame `f` equals `values[f]`
fn constant_frames(values: &[f32], h: usize, w: usize) -> Result<Tensor> {
    let f = values.len();
    let mut data = Vec::with_capacity(4 * f * h * w);
    for _ in 0..4 {
        for &v in values {
            data.extend(std::iter::repeat_n(v, h * w));
        }
    }
    Ok(Tensor::from_vec(data, (1, 4, f, h, w), &Device::Cpu)?)
}

#[test]
fn test_frame_order_preserved() -> Result<()> {
    let values = [-0.9f32, -0.3, 0.0, 0.4, 0.8];
    let latents = constant_frames(&values, 2, 3)?;
    let pixels = decode_latents(&MockDecoder::new(2), &latents, 1.0, None)?;

    assert_eq!(pixels.dims(), &[1, 3, 5, 4, 6]);
    for (f, &v) in values.iter().enumerate() {
        let frame = pixels.narrow(2, f, 1)?.flatten_all()?.to_vec1::<f32>()?;
        let want = v.tanh();
        assert!(frame.iter().all(|&p| (p - want).abs() < 1e-6), "frame {f}");
    }
    Ok(())
}

#[test]
fn test_scale_factor_applied() -> Result<()> {
    let latents = constant_frames(&[0.1], 1, 1)?;
    let pixels = decode_latents(&MockDecoder::new(1), &latents, 0.18215, None)?;
    let got = pixels.flatten_all()?.to_vec1::<f32>()?[0];
    assert!((got - (0.1f32 / 0.18215).tanh()).abs() < 1e-5);
    Ok(())
}

#[test]
fn test_chunked_decode_matches_single_call() -> Result<()> {
    let values = [0.1f32, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7];
    let latents = constant_frames(&values, 2, 2)?;
    let decoder = MockDecoder::new(2);
    let whole = decode_latents(&decoder, &latents, 0.5, None)?;
    let chunked = decode_latents(&decoder, &latents, 0.5, Some(3))?;
    assert_eq!(
        whole.flatten_all()?.to_vec1::<f32>()?,
        chunked.flatten_all()?.to_vec1::<f32>()?
    );
    Ok(())
}

#[test]
fn test_decoder_with_wrong_channels_is_rejected() -> Result<()> {
    struct Grayscale;
    impl LatentDecoder for Grayscale {
        fn decode(&self, latents: &Tensor) -> candle_core::Result<Tensor> {
            latents.narrow(1, 0, 1)
        }
    }
    let latents = constant_frames(&[0.0, 0.0], 2, 2)?;
    let err = decode_latents(&Grayscale, &latents, 1.0, None).unwrap_err();
    assert!(matches!(err, SdVideoError::ShapeMismatch { .. }), "{err}");
    Ok(())
}

#[test]
fn test_reference_frame_channel_order() -> Result<()> {
    // Pure red in [-1, 1] decoder space: R=1, G=B=-1
    let mut data = vec![1.0f32; 4];
    data.extend([-1.0f32; 8]);
    let video = Tensor::from_vec(data, (1, 3, 1, 2, 2), &Device::Cpu)?;
    let frames = tensor_to_frames(&video)?;

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].get_pixel(1, 1).0, [255, 0, 0]);
    assert_eq!(&ChannelOrder::Rgb.pack(&frames[0])[..3], &[255, 0, 0]);
    assert_eq!(&ChannelOrder::Bgr.pack(&frames[0])[..3], &[0, 0, 255]);
    Ok(())
}

#[test]
fn test_frames_are_saturated() -> Result<()> {
    let video = Tensor::from_vec(vec![-5.0f32, 5.0, -5.0], (1, 3, 1, 1, 1), &Device::Cpu)?;
    let frames = tensor_to_frames(&video)?;
    assert_eq!(frames[0].get_pixel(0, 0).0, [0, 255, 0]);
    Ok(())
}

#[test]
fn test_rejects_non_rgb_video() -> Result<()> {
    let video = Tensor::zeros((1, 4, 2, 2, 2), DType::F32, &Device::Cpu)?;
    assert!(tensor_to_frames(&video).is_err());
    Ok(())
}
